// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::{fs, io, thread};

use net_discovery::{CmdOutput, ExecOpts, NodeExecutor, TransportError};
use ssh2::Session;
use thiserror::Error;
use wait_timeout::ChildExt;

pub const DEFAULT_SSH_RETRIES: u8 = 6;
pub const DEFAULT_SSH_TIMEOUT: u8 = 10;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("ssh connection failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh session creation failed")]
    SessionNew(#[source] ssh2::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("ssh command failed")]
    Command(#[source] ssh2::Error),
    #[error("retrieving exit status from ssh command failed")]
    ExitStatus(#[source] ssh2::Error),
    #[error("failed to read file")]
    FileRead(#[source] std::io::Error),
    #[error("failed to read metadata")]
    FileMetadata(#[source] std::io::Error),
    #[error("scp send failed")]
    ScpSend(#[source] ssh2::Error),
    #[error("scp write failed")]
    WriteAll(#[source] std::io::Error),
    #[error("scp send EOF failed")]
    SendEof(#[source] ssh2::Error),
    #[error("scp wait EOF failed")]
    WaitEof(#[source] ssh2::Error),
}

impl From<SshError> for TransportError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::Connection(io) => TransportError::Connection(io),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SshAuth {
    pub username: String,
    pub password: String,
}

impl Default for SshAuth {
    // Stock cloud image credentials.
    fn default() -> Self {
        SshAuth {
            username: String::from("cloud"),
            password: String::from("cloud123"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SshNodeConfig {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub auth: SshAuth,
    pub retries: u8,
    pub timeout: u8,
}

impl SshNodeConfig {
    pub fn new(name: &str, addr: &str) -> Self {
        SshNodeConfig {
            name: name.to_string(),
            addr: addr.to_string(),
            port: 22,
            auth: SshAuth::default(),
            retries: DEFAULT_SSH_RETRIES,
            timeout: DEFAULT_SSH_TIMEOUT,
        }
    }
}

fn open_session(config: &SshNodeConfig) -> Result<Session, SshError> {
    let mut counter = 0;
    loop {
        let closure = || -> Result<Session, SshError> {
            let tcp = TcpStream::connect(format!("{}:{}", config.addr, config.port))
                .map_err(SshError::Connection)?;
            let mut sess = Session::new().map_err(SshError::SessionNew)?;
            sess.set_tcp_stream(tcp);
            sess.handshake().map_err(SshError::Handshake)?;

            sess.userauth_password(&config.auth.username, &config.auth.password)
                .map_err(SshError::Authentication)?;
            assert!(sess.authenticated());

            Ok(sess)
        };

        match closure() {
            Ok(sess) => return Ok(sess),
            Err(e) => {
                counter += 1;
                if counter >= config.retries {
                    eprintln!(
                        "\n\n==== Start ssh connect (FAILED) ====\n\n\
                         node=\"{}\"\n\
                         addr=\"{}:{}\"\n\
                         error=\"{e:?}\"\n\
                         \n==== End ssh connect ====\n\n",
                        config.name, config.addr, config.port
                    );

                    return Err(e);
                }
            }
        };
        thread::sleep(Duration::new((config.timeout * counter).into(), 0));
    }
}

// sudo without a shell covers single commands; pipelines need the whole
// line to run under one privileged shell.
fn compose_command(command: &str, opts: &ExecOpts) -> String {
    if !opts.sudo {
        command.to_string()
    } else if opts.shell {
        format!("sudo sh -c '{command}'")
    } else {
        format!("sudo {command}")
    }
}

/// A guest reachable over SSH. Every command opens a fresh session, so
/// a crashed sshd only costs the command that hit it.
pub struct SshNode {
    config: SshNodeConfig,
}

impl SshNode {
    /// Validate connectivity and credentials once up front.
    pub fn connect(config: SshNodeConfig) -> Result<Self, SshError> {
        let node = SshNode { config };
        open_session(&node.config)?;
        Ok(node)
    }
}

impl NodeExecutor for SshNode {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn run(&self, command: &str, opts: &ExecOpts) -> Result<CmdOutput, TransportError> {
        let sess = open_session(&self.config)?;
        if let Some(timeout) = opts.timeout {
            sess.set_timeout(timeout.as_millis() as u32);
        }

        let mut channel = sess.channel_session().map_err(SshError::ChannelSession)?;
        let composed = compose_command(command, opts);
        debug!("[{}] {composed}", self.config.name);
        channel.exec(&composed).map_err(SshError::Command)?;

        let mut stdout = String::new();
        // Close failures after the output is read change nothing.
        let _ = channel.read_to_string(&mut stdout);
        let _ = channel.close();
        let _ = channel.wait_close();

        let exit_code = channel.exit_status().map_err(SshError::ExitStatus)?;
        Ok(CmdOutput::new(stdout, exit_code))
    }
}

pub fn running_as_root() -> bool {
    // SAFETY: geteuid never fails.
    unsafe { libc::geteuid() == 0 }
}

/// The machine the tests run on, driven through `bash -c`.
pub struct LocalNode {
    name: String,
}

impl LocalNode {
    pub fn new() -> Self {
        LocalNode {
            name: String::from("localhost"),
        }
    }
}

impl Default for LocalNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeExecutor for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, command: &str, opts: &ExecOpts) -> Result<CmdOutput, TransportError> {
        // Already privileged processes must not depend on sudo existing.
        let composed = if running_as_root() {
            command.to_string()
        } else {
            compose_command(command, opts)
        };
        debug!("[{}] {composed}", self.name);

        let Some(timeout) = opts.timeout else {
            let output = Command::new("bash")
                .args(["-c", &composed])
                .output()
                .map_err(TransportError::Execution)?;
            if !output.stderr.is_empty() {
                debug!(
                    "[{}] stderr: {}",
                    self.name,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            return Ok(CmdOutput::new(
                String::from_utf8_lossy(&output.stdout).into_owned(),
                output.status.code().unwrap_or(-1),
            ));
        };

        let mut child = Command::new("bash")
            .args(["-c", &composed])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(TransportError::Execution)?;

        let status = match child.wait_timeout(timeout).map_err(TransportError::Execution)? {
            Some(status) => status,
            None => {
                kill_child(&mut child);
                return Err(TransportError::Timeout(timeout));
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout);
        }
        Ok(CmdOutput::new(stdout, status.code().unwrap_or(-1)))
    }
}

pub fn kill_child(child: &mut Child) {
    let r = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        warn!("failed to kill child with SIGTERM: {e:?}");
    }

    // The timeout period elapsed without the child exiting
    if child.wait_timeout(Duration::new(10, 0)).unwrap().is_none() {
        let _ = child.kill();
    }
}

/// Canned node for hermetic tests: replays scripted responses and
/// records the command transcript.
///
/// Responses queue per command; the final entry keeps answering repeat
/// runs, so one fixture can serve several discovery passes. In strict
/// mode an unscripted command is a protocol error, otherwise it fails
/// like a readlink probe on a missing path (exit 1, empty stdout).
pub struct ScriptedNode {
    name: String,
    responses: Mutex<HashMap<String, VecDeque<CmdOutput>>>,
    transcript: Mutex<Vec<String>>,
    strict: bool,
}

impl ScriptedNode {
    pub fn new(name: &str) -> Self {
        ScriptedNode {
            name: name.to_string(),
            responses: Mutex::new(HashMap::new()),
            transcript: Mutex::new(Vec::new()),
            strict: false,
        }
    }

    pub fn strict(name: &str) -> Self {
        ScriptedNode {
            strict: true,
            ..Self::new(name)
        }
    }

    /// Queue one response for `command`.
    pub fn expect(self, command: &str, exit_code: i32, stdout: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(CmdOutput::new(stdout, exit_code));
        self
    }

    pub fn expect_ok(self, command: &str, stdout: &str) -> Self {
        self.expect(command, 0, stdout)
    }

    /// Every command that was run, in order.
    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lock().unwrap().clone()
    }

    pub fn ran(&self, command: &str) -> bool {
        self.transcript.lock().unwrap().iter().any(|c| c == command)
    }

    pub fn runs_of(&self, command: &str) -> usize {
        self.transcript
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == command)
            .count()
    }
}

impl NodeExecutor for ScriptedNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, command: &str, _opts: &ExecOpts) -> Result<CmdOutput, TransportError> {
        self.transcript.lock().unwrap().push(command.to_string());
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(command) {
            Some(queue) => {
                if queue.len() > 1 {
                    Ok(queue.pop_front().unwrap())
                } else {
                    Ok(queue.front().cloned().unwrap())
                }
            }
            None if self.strict => Err(TransportError::Protocol(format!(
                "unscripted command: {command}"
            ))),
            None => Ok(CmdOutput::new("", 1)),
        }
    }
}

/// Poll until the node's ssh port accepts TCP connections. Every
/// connect attempt is bounded by the remaining budget, so a host that
/// silently drops packets cannot stall the poll past `timeout`.
pub fn wait_for_ssh(addr: &str, port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if let Ok(sockets) = (addr, port).to_socket_addrs() {
            for socket in sockets {
                let attempt = timeout
                    .saturating_sub(start.elapsed())
                    .min(Duration::new(1, 0))
                    .max(Duration::from_millis(1));
                if TcpStream::connect_timeout(&socket, attempt).is_ok() {
                    return true;
                }
            }
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::new(1, 0));
    }
}

/// Upload a local file over scp, e.g. a traffic-generator payload.
pub fn push_file(
    config: &SshNodeConfig,
    path: &Path,
    remote_path: &Path,
) -> Result<(), SshError> {
    let mut counter = 0;
    loop {
        let closure = || -> Result<(), SshError> {
            let sess = open_session(config)?;

            let content = fs::read(path).map_err(SshError::FileRead)?;
            let mode = fs::metadata(path)
                .map_err(SshError::FileMetadata)?
                .permissions()
                .mode()
                & 0o777;

            let mut channel = sess
                .scp_send(remote_path, mode as i32, content.len() as u64, None)
                .map_err(SshError::ScpSend)?;
            channel.write_all(&content).map_err(SshError::WriteAll)?;
            channel.send_eof().map_err(SshError::SendEof)?;
            channel.wait_eof().map_err(SshError::WaitEof)?;

            // Close failures after a complete upload change nothing.
            let _ = channel.close();
            let _ = channel.wait_close();

            Ok(())
        };

        match closure() {
            Ok(_) => break,
            Err(e) => {
                counter += 1;
                if counter >= config.retries {
                    eprintln!(
                        "\n\n==== Start push_file (FAILED) ====\n\n\
                         path=\"{path:?}\"\n\
                         remote_path=\"{remote_path:?}\"\n\
                         node=\"{}\"\n\
                         error=\"{e:?}\"\n\
                         \n==== End push_file ====\n\n",
                        config.name
                    );

                    return Err(e);
                }
            }
        };
        thread::sleep(Duration::new((config.timeout * counter).into(), 0));
    }
    Ok(())
}
