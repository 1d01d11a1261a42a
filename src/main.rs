// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::process;
use std::str::FromStr;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use net_discovery::{disk, NicDevice, NicInventory, NodeExecutor, PacketCounter, RetryPolicy};
use serde::Serialize;
use test_infra::{wait_for_ssh, LocalNode, SshAuth, SshNode, SshNodeConfig};
use thiserror::Error;

#[derive(Error, Debug)]
enum Error {
    #[error(
        "malformed node spec '{0}', expected addr=<ip>[,port=<port>][,user=<user>][,password=<password>]"
    )]
    MalformedNodeSpec(String),
    #[error("target node did not open its ssh port in time")]
    Unreachable,
    #[error("ssh connection failed")]
    Ssh(#[source] test_infra::SshError),
    #[error("nic discovery failed")]
    Discovery(#[source] net_discovery::Error),
    #[error("expected {expected} accelerated nic(s), found {found}")]
    VfCountMismatch { expected: usize, found: usize },
    #[error("no accelerated nic found")]
    NoVf,
    #[error("report serialization failed")]
    ReportSerialization(#[source] serde_json::Error),
}

struct NodeSpec {
    addr: String,
    port: u16,
    user: String,
    password: String,
}

impl FromStr for NodeSpec {
    type Err = Error;

    // "addr=10.0.0.4,port=2222,user=cloud,password=cloud123"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let auth = SshAuth::default();
        let mut spec = NodeSpec {
            addr: String::new(),
            port: 22,
            user: auth.username,
            password: auth.password,
        };
        for option in s.split(',') {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| Error::MalformedNodeSpec(s.to_string()))?;
            match key {
                "addr" => spec.addr = value.to_string(),
                "port" => {
                    spec.port = value
                        .parse()
                        .map_err(|_| Error::MalformedNodeSpec(s.to_string()))?;
                }
                "user" => spec.user = value.to_string(),
                "password" => spec.password = value.to_string(),
                _ => return Err(Error::MalformedNodeSpec(s.to_string())),
            }
        }
        if spec.addr.is_empty() {
            return Err(Error::MalformedNodeSpec(s.to_string()));
        }
        Ok(spec)
    }
}

#[derive(Serialize)]
struct NicEntry {
    #[serde(flatten)]
    device: NicDevice,
    tx_packets: u64,
    rx_packets: u64,
}

#[derive(Serialize)]
struct NicReport {
    node: String,
    default_nic: String,
    os_disk: String,
    mana_present: bool,
    nics: Vec<NicEntry>,
}

fn create_app() -> Command {
    Command::new("guest-net-check")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Discover and validate synthetic/SR-IOV NIC pairing inside a Linux guest.")
        .arg(
            Arg::new("node")
                .long("node")
                .help("Guest connection spec: addr=<ip>[,port=<port>][,user=<user>][,password=<password>]")
                .num_args(1)
                .required_unless_present("local"),
        )
        .arg(
            Arg::new("local")
                .long("local")
                .help("Probe the local machine instead of a remote guest")
                .action(ArgAction::SetTrue)
                .conflicts_with("node"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .help("Node name used in logs and the report")
                .num_args(1)
                .default_value("node0"),
        )
        .arg(
            Arg::new("expect-sriov")
                .long("expect-sriov")
                .help("Fail unless at least one accelerated nic is found")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("expect-vfs")
                .long("expect-vfs")
                .help("Fail unless exactly this many accelerated nics are found")
                .num_args(1)
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the report as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .help("Discovery attempts before giving up; expectation checks use the settle schedule")
                .num_args(1)
                .default_value("15")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("retry-delay")
                .long("retry-delay")
                .help("Base delay between discovery attempts, in seconds")
                .num_args(1)
                .default_value("3")
                .value_parser(value_parser!(u64)),
        )
}

fn connect_node(args: &ArgMatches) -> Result<Box<dyn NodeExecutor>, Error> {
    if args.get_flag("local") {
        return Ok(Box::new(LocalNode::new()));
    }

    let spec: NodeSpec = args.get_one::<String>("node").unwrap().parse()?;
    let mut config = SshNodeConfig::new(args.get_one::<String>("name").unwrap(), &spec.addr);
    config.port = spec.port;
    config.auth = SshAuth {
        username: spec.user,
        password: spec.password,
    };

    if !wait_for_ssh(&config.addr, config.port, Duration::from_secs(60)) {
        return Err(Error::Unreachable);
    }
    let node = SshNode::connect(config).map_err(Error::Ssh)?;
    Ok(Box::new(node))
}

fn check_expectations(
    inventory: &NicInventory,
    expect_sriov: bool,
    expected_vfs: Option<usize>,
) -> Result<(), Error> {
    let vf_count = inventory.occupied_pci_slots().len();
    if expect_sriov && vf_count == 0 {
        return Err(Error::NoVf);
    }
    if let Some(expected) = expected_vfs {
        if expected != vf_count {
            return Err(Error::VfCountMismatch {
                expected,
                found: vf_count,
            });
        }
    }
    Ok(())
}

// A VF that has not enslaved yet still discovers as a valid
// synthetic-only inventory, so the expectation checks retry together
// with discovery as one unit.
fn discover_with_expectations(
    inventory: &mut NicInventory,
    policy: &RetryPolicy,
    expect_sriov: bool,
    expected_vfs: Option<usize>,
) -> Result<(), Error> {
    policy.retry(|| {
        inventory.discover().map_err(Error::Discovery)?;
        check_expectations(inventory, expect_sriov, expected_vfs)
    })
}

fn run(args: &ArgMatches) -> Result<(), Error> {
    let node = connect_node(args)?;
    info!("running nic discovery against '{}'", node.name());

    let expect_sriov = args.get_flag("expect-sriov");
    let expected_vfs = args.get_one::<usize>("expect-vfs").copied();

    let policy = if expect_sriov || expected_vfs.is_some() {
        RetryPolicy::vf_presence()
    } else {
        RetryPolicy {
            attempts: *args.get_one::<u32>("retries").unwrap(),
            delay: Duration::from_secs(*args.get_one::<u64>("retry-delay").unwrap()),
            ..RetryPolicy::discovery()
        }
    };

    let mut inventory = NicInventory::new(node.as_ref());
    discover_with_expectations(&mut inventory, &policy, expect_sriov, expected_vfs)?;

    info!(
        "discovery complete: {} nic(s), {} accelerated",
        inventory.len(),
        inventory.occupied_pci_slots().len()
    );

    let mut nics = Vec::new();
    for device in inventory.devices() {
        let tx_packets = inventory
            .packet_count(&device.upper, PacketCounter::Tx)
            .map_err(Error::Discovery)?;
        let rx_packets = inventory
            .packet_count(&device.upper, PacketCounter::Rx)
            .map_err(Error::Discovery)?;
        nics.push(NicEntry {
            device: device.clone(),
            tx_packets,
            rx_packets,
        });
    }

    let report = NicReport {
        node: node.name().to_string(),
        default_nic: inventory.default_nic().to_string(),
        os_disk: disk::os_disk_partition(node.as_ref()).map_err(Error::Discovery)?,
        mana_present: inventory.is_mana_present().map_err(Error::Discovery)?,
        nics,
    };

    if args.get_flag("json") {
        let rendered = serde_json::to_string_pretty(&report).map_err(Error::ReportSerialization)?;
        println!("{rendered}");
    } else {
        println!("node: {}", report.node);
        println!("default nic: {}", report.default_nic);
        println!("os disk: {}", report.os_disk);
        println!("mana present: {}", report.mana_present);
        for entry in &report.nics {
            println!(
                "{} [tx {} rx {}]",
                entry.device, entry.tx_packets, entry.rx_packets
            );
        }
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let cmd_arguments = create_app().get_matches();
    if let Err(e) = run(&cmd_arguments) {
        eprintln!("Error: {:#}", anyhow::Error::from(e));
        process::exit(1);
    }
}
