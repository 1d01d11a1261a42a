// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::node::{ExecOpts, NodeExecutor};
use crate::{pattern, Error, Result};

/// Driver backing synthetic interfaces on Hyper-V derived platforms.
pub const DEFAULT_NETVSC_DRIVER: &str = "hv_netvsc";

/// One guest-visible network device: the synthetic upper interface plus,
/// when acceleration is active, the SR-IOV virtual function enslaved
/// beneath it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NicDevice {
    /// Name of the synthetic interface, e.g. `eth0`.
    pub upper: String,
    /// Name of the paired virtual-function interface. Empty while the
    /// device runs without acceleration.
    pub lower: String,
    /// PCI slot backing the lower interface. Empty when unpaired.
    pub pci_slot: String,
    pub ip_addr: String,
    pub mac_addr: String,
    /// VMBus channel identity of the synthetic device, written to the
    /// driver bind/unbind nodes.
    pub dev_uuid: String,
    /// Kernel module currently bound to the synthetic device.
    pub bound_driver: String,
    /// Resolved sysfs path of the bound driver.
    pub driver_sysfs_path: String,
}

impl NicDevice {
    /// Record for a bare synthetic interface without a VF.
    pub fn new(upper: &str) -> Self {
        Self::paired(upper, "", "")
    }

    /// Record for an accelerated interface and its lower VF.
    pub fn paired(upper: &str, lower: &str, pci_slot: &str) -> Self {
        NicDevice {
            upper: upper.to_string(),
            lower: lower.to_string(),
            pci_slot: pci_slot.to_string(),
            ip_addr: String::new(),
            mac_addr: String::new(),
            dev_uuid: String::new(),
            bound_driver: DEFAULT_NETVSC_DRIVER.to_string(),
            driver_sysfs_path: String::new(),
        }
    }

    /// Whether an SR-IOV lower device is attached. A record that knows
    /// either a lower name or a backing PCI slot counts as paired.
    pub fn has_lower(&self) -> bool {
        !self.lower.is_empty() || !self.pci_slot.is_empty()
    }
}

impl fmt::Display for NicDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "upper: {}, lower: {}, pci_slot: {}, ip: {}, mac: {}",
            self.upper, self.lower, self.pci_slot, self.ip_addr, self.mac_addr
        )
    }
}

/// Administrative state applied through `ip link set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    fn as_arg(self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
        }
    }
}

/// Interface statistics counters exposed under sysfs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketCounter {
    Tx,
    Rx,
}

impl PacketCounter {
    fn sysfs_name(self) -> &'static str {
        match self {
            PacketCounter::Tx => "tx_packets",
            PacketCounter::Rx => "rx_packets",
        }
    }
}

/// Directory of every non-virtual network interface on one node.
///
/// Built by [`NicInventory::discover`], which walks `/sys/class/net`,
/// pairs synthetic uppers with their SR-IOV lowers and resolves the
/// addressing of every record. All probing goes through the
/// [`NodeExecutor`] handed in at construction; the inventory itself
/// never retries, callers wrap discovery in a
/// [`RetryPolicy`](crate::RetryPolicy) when they expect races.
pub struct NicInventory<'n> {
    node: &'n dyn NodeExecutor,
    nics: BTreeMap<String, NicDevice>,
    nic_names: Vec<String>,
    default_nic: String,
}

impl<'n> NicInventory<'n> {
    pub fn new(node: &'n dyn NodeExecutor) -> Self {
        NicInventory {
            node,
            nics: BTreeMap::new(),
            nic_names: Vec::new(),
            default_nic: String::new(),
        }
    }

    /// Probe the node and rebuild every record from scratch.
    pub fn discover(&mut self) -> Result<()> {
        self.nics.clear();
        self.default_nic.clear();
        self.nic_names = self.enumerate_candidates()?;
        debug!(
            "candidate interfaces on '{}': {:?}",
            self.node.name(),
            self.nic_names
        );
        self.pair_devices()?;
        self.resolve_default_nic()?;
        self.resolve_addresses()?;
        self.resolve_device_uuids()?;
        self.resolve_bound_drivers()?;
        info!(
            "found {} nic(s) on node '{}', default is '{}'",
            self.nics.len(),
            self.node.name(),
            self.default_nic
        );
        Ok(())
    }

    /// Drop every record and probe the node again, e.g. after a driver
    /// rebind or a VF hot add/remove.
    pub fn reload(&mut self) -> Result<()> {
        self.discover()
    }

    // Interface names under /sys/class/net minus the purely virtual
    // ones (loopback, bridges, bonds).
    fn enumerate_candidates(&self) -> Result<Vec<String>> {
        let opts = ExecOpts::new().shell().sudo();
        let all = self.node.run("ls /sys/class/net/", &opts)?;
        let virt = self.node.run("ls /sys/devices/virtual/net", &opts)?;
        let virtual_names: Vec<&str> = virt.stdout.split_whitespace().collect();
        let names: Vec<String> = all
            .stdout
            .split_whitespace()
            .filter(|n| !virtual_names.contains(n))
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(Error::Environment {
                node: self.node.name().to_string(),
                reason: format!(
                    "no candidate network interfaces, only virtual devices present: {virtual_names:?}"
                ),
            });
        }
        Ok(names)
    }

    // A pair shows up as /sys/class/net/<lower>/upper_<upper>, carried
    // by the lower side only. Every ordered candidate pair is probed;
    // a failing readlink just means "not a pair".
    fn pair_devices(&mut self) -> Result<()> {
        for upper in &self.nic_names {
            for lower in &self.nic_names {
                if upper == lower {
                    continue;
                }
                let probe = self.node.run(
                    &format!("readlink /sys/class/net/{lower}/upper_{upper}"),
                    &ExecOpts::new(),
                )?;
                if !probe.success() {
                    continue;
                }
                let device = self.node.run(
                    &format!("readlink /sys/class/net/{lower}/device"),
                    &ExecOpts::new(),
                )?;
                let pci_slot = basename(device.trimmed()).to_string();
                if !pattern::is_pci_slot(&pci_slot) {
                    return Err(Error::Environment {
                        node: self.node.name().to_string(),
                        reason: format!(
                            "device link of vf '{lower}' does not name a pci slot: {:?}",
                            device.stdout
                        ),
                    });
                }
                debug!("interface {upper} is paired with vf {lower} at slot '{pci_slot}'");
                self.nics
                    .insert(upper.clone(), NicDevice::paired(upper, lower, &pci_slot));
            }
        }

        // Whatever is neither an upper nor somebody's lower is a plain
        // synthetic interface without acceleration.
        let lowers: Vec<String> = self.nics.values().map(|n| n.lower.clone()).collect();
        for name in &self.nic_names {
            if !self.nics.contains_key(name) && !lowers.contains(name) {
                self.nics.insert(name.clone(), NicDevice::new(name));
            }
        }

        if self.nics.is_empty() {
            return Err(Error::Environment {
                node: self.node.name().to_string(),
                reason: "no network devices could be assembled from the candidate list".to_string(),
            });
        }
        Ok(())
    }

    fn resolve_default_nic(&mut self) -> Result<()> {
        let route = self.node.run("ip route show", &ExecOpts::new().sudo())?;
        if !route.success() || route.trimmed().is_empty() {
            return Err(Error::Environment {
                node: self.node.name().to_string(),
                reason: format!(
                    "route table query failed (exit {}): {:?}",
                    route.exit_code, route.stdout
                ),
            });
        }
        let dev = match pattern::default_route_device(&route.stdout) {
            Some(dev) => dev,
            None => {
                return Err(Error::Environment {
                    node: self.node.name().to_string(),
                    reason: format!("no default route present in: {:?}", route.stdout),
                });
            }
        };
        if !self.nic_names.iter().any(|n| n == dev) {
            return Err(Error::Environment {
                node: self.node.name().to_string(),
                reason: format!(
                    "default interface '{dev}' is not a discovered candidate: {:?}",
                    self.nic_names
                ),
            });
        }
        if !self.nics.contains_key(dev) {
            return Err(Error::Environment {
                node: self.node.name().to_string(),
                reason: format!("default interface '{dev}' is a lower device, not an upper"),
            });
        }
        debug!("default interface is '{dev}'");
        self.default_nic = dev.to_string();
        Ok(())
    }

    fn resolve_addresses(&mut self) -> Result<()> {
        for (name, nic) in &mut self.nics {
            let out = self
                .node
                .run(&format!("ip addr show {name}"), &ExecOpts::new().sudo())?;
            let ip = pattern::ipv4_addr(&out.stdout);
            let mac = pattern::mac_addr(&out.stdout);
            let (Some(ip), Some(mac)) = (ip, mac) else {
                return Err(Error::Parse {
                    what: "interface ip/mac address",
                    context: format!("{name}: {:?}", out.stdout),
                });
            };
            nic.ip_addr = ip.to_string();
            nic.mac_addr = mac.to_string();
        }
        Ok(())
    }

    // The VMBus channel GUID of the synthetic device is the base name of
    // its sysfs device link.
    fn resolve_device_uuids(&mut self) -> Result<()> {
        for (name, nic) in &mut self.nics {
            let out = self.node.run(
                &format!("readlink /sys/class/net/{name}/device"),
                &ExecOpts::new(),
            )?;
            let target = out.trimmed();
            if !out.success() || target.is_empty() {
                return Err(Error::Environment {
                    node: self.node.name().to_string(),
                    reason: format!(
                        "cannot read device link of interface '{name}' (exit {})",
                        out.exit_code
                    ),
                });
            }
            nic.dev_uuid = basename(target).to_string();
        }
        Ok(())
    }

    fn resolve_bound_drivers(&mut self) -> Result<()> {
        for (name, nic) in &mut self.nics {
            let out = self.node.run(
                &format!("readlink -f /sys/class/net/{name}/device/driver"),
                &ExecOpts::new(),
            )?;
            let path = out.trimmed();
            if !out.success() || path.is_empty() {
                return Err(Error::Environment {
                    node: self.node.name().to_string(),
                    reason: format!("no driver currently bound for interface '{name}'"),
                });
            }
            nic.driver_sysfs_path = path.to_string();
            nic.bound_driver = basename(path).to_string();
        }
        Ok(())
    }

    /// Names of every upper interface, in stable sorted order.
    pub fn upper_names(&self) -> Vec<String> {
        self.nics.keys().cloned().collect()
    }

    /// Lower names aligned with every record; unpaired records yield an
    /// empty string. [`paired_lower_names`](Self::paired_lower_names)
    /// filters those out.
    pub fn lower_names(&self) -> Vec<String> {
        self.nics.values().map(|n| n.lower.clone()).collect()
    }

    /// Lower names of records that actually carry a VF.
    pub fn paired_lower_names(&self) -> Vec<String> {
        self.nics
            .values()
            .map(|n| n.lower.clone())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// PCI slots aligned with every record (empty when unpaired).
    pub fn pci_slots(&self) -> Vec<String> {
        self.nics.values().map(|n| n.pci_slot.clone()).collect()
    }

    /// Slots of records with a VF behind them.
    pub fn occupied_pci_slots(&self) -> Vec<String> {
        self.nics
            .values()
            .map(|n| n.pci_slot.clone())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Uppers with no VF paired beneath them.
    pub fn unpaired_names(&self) -> Vec<String> {
        self.nics
            .values()
            .filter(|n| !n.has_lower())
            .map(|n| n.upper.clone())
            .collect()
    }

    /// Look up a record by upper name.
    pub fn nic(&self, name: &str) -> Result<&NicDevice> {
        self.nics.get(name).ok_or_else(|| Error::UnknownNic {
            name: name.to_string(),
            known: self.upper_names(),
        })
    }

    /// True when `name` is a known upper or a known lower.
    pub fn contains(&self, name: &str) -> bool {
        self.nics.contains_key(name) || self.nics.values().any(|n| n.lower == name)
    }

    /// Insert a record, replacing any previous one under the same upper.
    pub fn append(&mut self, nic: NicDevice) {
        self.nics.insert(nic.upper.clone(), nic);
    }

    pub fn len(&self) -> usize {
        self.nics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nics.is_empty()
    }

    /// Every record, in upper-name order.
    pub fn devices(&self) -> impl Iterator<Item = &NicDevice> {
        self.nics.values()
    }

    /// Interface carrying the default route. Empty before discovery.
    pub fn default_nic(&self) -> &str {
        &self.default_nic
    }

    pub fn primary_nic(&self) -> Result<&NicDevice> {
        self.nic_by_index(0)
    }

    pub fn secondary_nic(&self) -> Result<&NicDevice> {
        self.nic_by_index(1)
    }

    /// Record at `index` over the sorted upper names.
    pub fn nic_by_index(&self, index: usize) -> Result<&NicDevice> {
        self.nics
            .values()
            .nth(index)
            .ok_or_else(|| Error::UnknownNic {
                name: format!("index {index}"),
                known: self.upper_names(),
            })
    }

    /// Read one statistics counter of an interface.
    pub fn packet_count(&self, name: &str, counter: PacketCounter) -> Result<u64> {
        let out = self.node.run(
            &format!(
                "cat /sys/class/net/{name}/statistics/{}",
                counter.sysfs_name()
            ),
            &ExecOpts::new().sudo(),
        )?;
        out.trimmed().parse::<u64>().map_err(|_| Error::Parse {
            what: "packet counter",
            context: format!("{name}: {:?}", out.stdout),
        })
    }

    /// Whether the kernel currently knows an interface by this name.
    pub fn nic_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .node
            .run(&format!("ip link show {name}"), &ExecOpts::new().sudo())?;
        Ok(out.success())
    }

    /// Flip the administrative state of an interface.
    pub fn set_link(&self, name: &str, state: LinkState) -> Result<()> {
        let out = self.node.run(
            &format!("ip link set {name} {}", state.as_arg()),
            &ExecOpts::new().sudo(),
        )?;
        if !out.success() {
            return Err(Error::Environment {
                node: self.node.name().to_string(),
                reason: format!(
                    "could not set link {name} {}: {:?}",
                    state.as_arg(),
                    out.stdout
                ),
            });
        }
        Ok(())
    }

    /// Detach the synthetic device from `driver_module` by writing its
    /// VMBus GUID to the driver's unbind node. The record stays as it
    /// was; callers [`reload`](Self::reload) to observe the result.
    pub fn unbind(&mut self, name: &str, driver_module: &str) -> Result<()> {
        let dev_uuid = self.nic(name)?.dev_uuid.clone();
        Self::validate_dev_uuid(name, &dev_uuid)?;
        if self.nic_exists(name)? {
            self.set_link(name, LinkState::Down)?;
        }
        self.write_driver_node(driver_module, "unbind", &dev_uuid)
    }

    /// Attach the synthetic device to `driver_module`.
    pub fn bind(&mut self, name: &str, driver_module: &str) -> Result<()> {
        let dev_uuid = self.nic(name)?.dev_uuid.clone();
        Self::validate_dev_uuid(name, &dev_uuid)?;
        self.write_driver_node(driver_module, "bind", &dev_uuid)?;
        if let Some(nic) = self.nics.get_mut(name) {
            nic.bound_driver = driver_module.to_string();
        }
        Ok(())
    }

    /// Whether a Microsoft Azure Network Adapter is on the PCI bus.
    pub fn is_mana_present(&self) -> Result<bool> {
        let out = self.node.run("lspci -m", &ExecOpts::new().sudo())?;
        Ok(pattern::pci_devices(&out.stdout).iter().any(|d| {
            d.device_class == "Ethernet controller"
                && d.vendor == "Microsoft Corporation"
                && d.device.contains("Device 00ba")
        }))
    }

    fn validate_dev_uuid(name: &str, dev_uuid: &str) -> Result<()> {
        if Uuid::parse_str(dev_uuid).is_err() {
            return Err(Error::InvalidDeviceUuid {
                nic: name.to_string(),
                uuid: dev_uuid.to_string(),
            });
        }
        Ok(())
    }

    // The write is fire-and-forget: the kernel reports rebind results
    // asynchronously, so only transport failures surface here.
    fn write_driver_node(&self, module: &str, op: &str, dev_uuid: &str) -> Result<()> {
        let out = self.node.run(
            &format!("echo {dev_uuid} | tee /sys/bus/vmbus/drivers/{module}/{op}"),
            &ExecOpts::new().shell().sudo(),
        )?;
        if !out.success() {
            warn!(
                "driver {op} write of {dev_uuid} exited {} on '{}'",
                out.exit_code,
                self.node.name()
            );
        }
        Ok(())
    }
}

impl fmt::Display for NicInventory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for nic in self.nics.values() {
            writeln!(f, "{nic}")?;
        }
        Ok(())
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::node::CmdOutput;
    use crate::TransportError;

    const ETH0_UUID: &str = "000d3a6e-4548-000d-3a6e-4548000d3a6e";
    const VF_SLOT: &str = "a8b4:00:02.0";

    // Replays canned responses and records the transcript. Commands
    // without an entry fail like a readlink probe on a missing path.
    struct FakeNode {
        name: String,
        responses: HashMap<String, CmdOutput>,
        log: Mutex<Vec<String>>,
    }

    impl FakeNode {
        fn new(name: &str) -> Self {
            FakeNode {
                name: name.to_string(),
                responses: HashMap::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn on(mut self, command: &str, exit_code: i32, stdout: &str) -> Self {
            self.responses
                .insert(command.to_string(), CmdOutput::new(stdout, exit_code));
            self
        }

        fn ok(self, command: &str, stdout: &str) -> Self {
            self.on(command, 0, stdout)
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn ran(&self, command: &str) -> bool {
            self.commands().iter().any(|c| c == command)
        }
    }

    impl NodeExecutor for FakeNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(
            &self,
            command: &str,
            _opts: &ExecOpts,
        ) -> std::result::Result<CmdOutput, TransportError> {
            self.log.lock().unwrap().push(command.to_string());
            Ok(self
                .responses
                .get(command)
                .cloned()
                .unwrap_or_else(|| CmdOutput::new("", 1)))
        }
    }

    fn addr_show(name: &str, ip: &str, mac: &str) -> String {
        format!(
            "2: {name}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc mq state UP group default qlen 1000\n    \
             link/ether {mac} brd ff:ff:ff:ff:ff:ff\n    \
             inet {ip}/24 brd 10.0.0.255 scope global {name}\n       \
             valid_lft forever preferred_lft forever\n"
        )
    }

    // One accelerated nic: eth0 backed by the VF enP30832s1.
    fn accelerated_node() -> FakeNode {
        FakeNode::new("vm-sriov")
            .ok("ls /sys/class/net/", "enP30832s1\neth0\nlo\n")
            .ok("ls /sys/devices/virtual/net", "lo\n")
            .ok("readlink /sys/class/net/enP30832s1/upper_eth0", "../eth0\n")
            .ok(
                "readlink /sys/class/net/enP30832s1/device",
                &format!("../../../{VF_SLOT}\n"),
            )
            .ok(
                "ip route show",
                "default via 10.0.0.1 dev eth0 proto dhcp src 10.0.0.4 metric 100\n\
                 10.0.0.0/24 dev eth0 proto kernel scope link src 10.0.0.4\n",
            )
            .ok(
                "ip addr show eth0",
                &addr_show("eth0", "10.0.0.4", "00:22:48:79:69:b4"),
            )
            .ok(
                "readlink /sys/class/net/eth0/device",
                &format!("../../../{ETH0_UUID}\n"),
            )
            .ok(
                "readlink -f /sys/class/net/eth0/device/driver",
                "/sys/bus/vmbus/drivers/hv_netvsc\n",
            )
    }

    // Three synthetic nics, no acceleration anywhere.
    fn synthetic_only_node() -> FakeNode {
        let mut node = FakeNode::new("vm-synthetic")
            .ok("ls /sys/class/net/", "eth0\neth1\neth2\nlo\n")
            .ok("ls /sys/devices/virtual/net", "lo\n")
            .ok(
                "ip route show",
                "default via 10.0.0.1 dev eth0 proto dhcp src 10.0.0.4 metric 100\n",
            );
        for (i, name) in ["eth0", "eth1", "eth2"].iter().enumerate() {
            node = node
                .ok(
                    &format!("ip addr show {name}"),
                    &addr_show(name, &format!("10.0.0.{}", i + 4), &format!("00:22:48:79:69:b{i}")),
                )
                .ok(
                    &format!("readlink /sys/class/net/{name}/device"),
                    &format!("../../../000d3a6e-4548-000d-3a6e-4548000d3a6e0{i}\n"),
                )
                .ok(
                    &format!("readlink -f /sys/class/net/{name}/device/driver"),
                    "/sys/bus/vmbus/drivers/hv_netvsc\n",
                );
        }
        node
    }

    fn discovered(node: &FakeNode) -> NicInventory {
        let mut inventory = NicInventory::new(node);
        inventory.discover().unwrap();
        inventory
    }

    #[test]
    fn test_discovery_pairs_accelerated_nic() {
        let node = accelerated_node();
        let inventory = discovered(&node);

        assert_eq!(inventory.len(), 1);
        let nic = inventory.nic("eth0").unwrap();
        assert_eq!(nic.upper, "eth0");
        assert_eq!(nic.lower, "enP30832s1");
        assert_eq!(nic.pci_slot, VF_SLOT);
        assert_eq!(nic.ip_addr, "10.0.0.4");
        assert_eq!(nic.mac_addr, "00:22:48:79:69:b4");
        assert_eq!(nic.dev_uuid, ETH0_UUID);
        assert_eq!(nic.bound_driver, "hv_netvsc");
        assert_eq!(nic.driver_sysfs_path, "/sys/bus/vmbus/drivers/hv_netvsc");
        assert!(nic.has_lower());

        assert!(inventory.unpaired_names().is_empty());
        assert_eq!(inventory.paired_lower_names(), vec!["enP30832s1"]);
        assert_eq!(inventory.occupied_pci_slots(), vec![VF_SLOT]);
        assert_eq!(inventory.default_nic(), "eth0");
    }

    #[test]
    fn test_discovery_probes_both_pair_directions() {
        let node = accelerated_node();
        discovered(&node);

        // Ordered probing covers both permutations of the candidates.
        assert!(node.ran("readlink /sys/class/net/enP30832s1/upper_eth0"));
        assert!(node.ran("readlink /sys/class/net/eth0/upper_enP30832s1"));
    }

    #[test]
    fn test_discovery_synthetic_only() {
        let node = synthetic_only_node();
        let inventory = discovered(&node);

        assert_eq!(inventory.len(), 3);
        assert_eq!(inventory.upper_names(), vec!["eth0", "eth1", "eth2"]);
        assert_eq!(inventory.unpaired_names(), vec!["eth0", "eth1", "eth2"]);
        assert_eq!(inventory.lower_names(), vec!["", "", ""]);
        assert!(inventory.paired_lower_names().is_empty());
        assert_eq!(inventory.pci_slots(), vec!["", "", ""]);
        assert!(inventory.occupied_pci_slots().is_empty());
        for nic in inventory.devices() {
            assert!(!nic.has_lower());
        }
    }

    #[test]
    fn test_discovery_accounts_for_every_candidate() {
        // eth0 paired with enP1, eth1 bare.
        let node = FakeNode::new("vm-mixed")
            .ok("ls /sys/class/net/", "enP1\neth0\neth1\nlo\n")
            .ok("ls /sys/devices/virtual/net", "lo\n")
            .ok("readlink /sys/class/net/enP1/upper_eth0", "../eth0\n")
            .ok(
                "readlink /sys/class/net/enP1/device",
                &format!("../../../{VF_SLOT}\n"),
            )
            .ok(
                "ip route show",
                "default via 10.0.0.1 dev eth0 proto dhcp src 10.0.0.4 metric 100\n",
            )
            .ok(
                "ip addr show eth0",
                &addr_show("eth0", "10.0.0.4", "00:22:48:79:69:b4"),
            )
            .ok(
                "ip addr show eth1",
                &addr_show("eth1", "10.0.0.5", "00:22:48:79:69:b5"),
            )
            .ok(
                "readlink /sys/class/net/eth0/device",
                &format!("../../../{ETH0_UUID}\n"),
            )
            .ok(
                "readlink /sys/class/net/eth1/device",
                "../../../000d3a6e-4548-000d-3a6e-4548000d3a6e01\n",
            )
            .ok(
                "readlink -f /sys/class/net/eth0/device/driver",
                "/sys/bus/vmbus/drivers/hv_netvsc\n",
            )
            .ok(
                "readlink -f /sys/class/net/eth1/device/driver",
                "/sys/bus/vmbus/drivers/hv_netvsc\n",
            );
        let inventory = discovered(&node);

        // Each candidate lands in exactly one place: upper, lower or
        // unpaired.
        assert_eq!(inventory.upper_names(), vec!["eth0", "eth1"]);
        assert_eq!(inventory.paired_lower_names(), vec!["enP1"]);
        assert_eq!(inventory.unpaired_names(), vec!["eth1"]);
        assert!(inventory.contains("eth0"));
        assert!(inventory.contains("eth1"));
        assert!(inventory.contains("enP1"));
        assert!(!inventory.contains("enP2"));
    }

    #[test]
    fn test_discovery_is_deterministic() {
        let node = accelerated_node();
        let mut inventory = NicInventory::new(&node);
        inventory.discover().unwrap();
        let first: Vec<NicDevice> = inventory.devices().cloned().collect();
        let first_default = inventory.default_nic().to_string();

        inventory.reload().unwrap();
        let second: Vec<NicDevice> = inventory.devices().cloned().collect();

        assert_eq!(first, second);
        assert_eq!(first_default, inventory.default_nic());
    }

    #[test]
    fn test_discovery_fails_without_candidates() {
        let node = FakeNode::new("vm-bare")
            .ok("ls /sys/class/net/", "lo\nvirbr0\n")
            .ok("ls /sys/devices/virtual/net", "lo\nvirbr0\n");
        let mut inventory = NicInventory::new(&node);
        assert!(matches!(
            inventory.discover(),
            Err(Error::Environment { node, .. }) if node == "vm-bare"
        ));
    }

    #[test]
    fn test_discovery_fails_without_default_route() {
        let node = synthetic_only_node().ok(
            "ip route show",
            "10.0.0.0/24 dev eth0 proto kernel scope link src 10.0.0.4\n",
        );
        let mut inventory = NicInventory::new(&node);
        let err = inventory.discover().unwrap_err();
        assert!(matches!(err, Error::Environment { .. }));
        assert!(err.to_string().contains("no default route"));
    }

    #[test]
    fn test_discovery_rejects_unknown_default_device() {
        let node = synthetic_only_node().ok(
            "ip route show",
            "default via 10.0.0.1 dev ziggy proto dhcp src 10.0.0.4 metric 100\n",
        );
        let mut inventory = NicInventory::new(&node);
        let err = inventory.discover().unwrap_err();
        assert!(err.to_string().contains("ziggy"));
    }

    #[test]
    fn test_discovery_rejects_lower_as_default_device() {
        let node = accelerated_node().ok(
            "ip route show",
            "default via 10.0.0.1 dev enP30832s1 proto dhcp src 10.0.0.4 metric 100\n",
        );
        let mut inventory = NicInventory::new(&node);
        let err = inventory.discover().unwrap_err();
        assert!(err.to_string().contains("lower device"));
    }

    #[test]
    fn test_discovery_requires_ip_and_mac() {
        let node = accelerated_node().ok(
            "ip addr show eth0",
            "2: eth0: <BROADCAST,MULTICAST> mtu 1500 qdisc mq state DOWN\n    \
             link/ether 00:22:48:79:69:b4 brd ff:ff:ff:ff:ff:ff\n",
        );
        let mut inventory = NicInventory::new(&node);
        assert!(matches!(
            inventory.discover(),
            Err(Error::Parse { what, .. }) if what == "interface ip/mac address"
        ));
    }

    #[test]
    fn test_discovery_rejects_non_pci_vf_device_link() {
        let node = accelerated_node().ok(
            "readlink /sys/class/net/enP30832s1/device",
            "../../../virtual\n",
        );
        let mut inventory = NicInventory::new(&node);
        let err = inventory.discover().unwrap_err();
        assert!(err.to_string().contains("pci slot"));
    }

    #[test]
    fn test_discovery_requires_device_link() {
        let node = accelerated_node().on("readlink /sys/class/net/eth0/device", 1, "");
        let mut inventory = NicInventory::new(&node);
        let err = inventory.discover().unwrap_err();
        assert!(err.to_string().contains("device link"));
    }

    #[test]
    fn test_discovery_requires_bound_driver() {
        let node = accelerated_node().on("readlink -f /sys/class/net/eth0/device/driver", 1, "");
        let mut inventory = NicInventory::new(&node);
        let err = inventory.discover().unwrap_err();
        assert!(err.to_string().contains("no driver"));
    }

    #[test]
    fn test_has_lower() {
        assert!(NicDevice::paired("eth0", "enP1", VF_SLOT).has_lower());
        assert!(NicDevice::paired("eth0", "enP1", "").has_lower());
        assert!(NicDevice::paired("eth0", "", VF_SLOT).has_lower());
        assert!(!NicDevice::new("eth0").has_lower());
    }

    #[test]
    fn test_nic_lookup_unknown_name() {
        let node = accelerated_node();
        let inventory = discovered(&node);
        let err = inventory.nic("doesnotexist").unwrap_err();
        assert!(matches!(err, Error::UnknownNic { ref name, .. } if name == "doesnotexist"));
        assert!(err.to_string().contains("doesnotexist"));

        // Lowers are not addressable records.
        assert!(inventory.nic("enP30832s1").is_err());
        assert!(inventory.contains("enP30832s1"));
    }

    #[test]
    fn test_nic_by_index_ordering() {
        let node = synthetic_only_node();
        let inventory = discovered(&node);
        assert_eq!(inventory.primary_nic().unwrap().upper, "eth0");
        assert_eq!(inventory.secondary_nic().unwrap().upper, "eth1");
        assert_eq!(inventory.nic_by_index(2).unwrap().upper, "eth2");
        assert!(matches!(
            inventory.nic_by_index(5),
            Err(Error::UnknownNic { name, .. }) if name == "index 5"
        ));
    }

    #[test]
    fn test_append_and_len() {
        let node = FakeNode::new("vm-manual");
        let mut inventory = NicInventory::new(&node);
        assert!(inventory.is_empty());

        inventory.append(NicDevice::new("eth0"));
        inventory.append(NicDevice::paired("eth1", "enP1", VF_SLOT));
        assert_eq!(inventory.len(), 2);

        // Same upper replaces the record.
        inventory.append(NicDevice::paired("eth0", "enP2", "beef:00:02.0"));
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.nic("eth0").unwrap().lower, "enP2");
    }

    #[test]
    fn test_unbind_writes_vmbus_node() {
        let node = accelerated_node()
            .ok("ip link show eth0", "2: eth0: <BROADCAST,MULTICAST,UP>\n")
            .ok("ip link set eth0 down", "");
        let mut inventory = NicInventory::new(&node);
        inventory.discover().unwrap();

        // The tee write is unscripted and "fails"; unbind must not care.
        inventory.unbind("eth0", "hv_netvsc").unwrap();

        let commands = node.commands();
        let link_down = commands.iter().position(|c| c == "ip link set eth0 down");
        let write = commands
            .iter()
            .position(|c| c == &format!("echo {ETH0_UUID} | tee /sys/bus/vmbus/drivers/hv_netvsc/unbind"));
        assert!(link_down.is_some());
        assert!(write.is_some());
        assert!(link_down < write);
    }

    #[test]
    fn test_unbind_skips_link_down_for_missing_interface() {
        let node = accelerated_node();
        let mut inventory = NicInventory::new(&node);
        inventory.discover().unwrap();

        // "ip link show eth0" is unscripted, so the interface counts as
        // already gone.
        inventory.unbind("eth0", "hv_netvsc").unwrap();
        assert!(!node.ran("ip link set eth0 down"));
        assert!(node.ran(&format!(
            "echo {ETH0_UUID} | tee /sys/bus/vmbus/drivers/hv_netvsc/unbind"
        )));
    }

    #[test]
    fn test_bind_writes_vmbus_node_and_updates_record() {
        let node = accelerated_node();
        let mut inventory = NicInventory::new(&node);
        inventory.discover().unwrap();

        inventory.bind("eth0", "uio_hv_generic").unwrap();
        assert!(node.ran(&format!(
            "echo {ETH0_UUID} | tee /sys/bus/vmbus/drivers/uio_hv_generic/bind"
        )));
        assert_eq!(inventory.nic("eth0").unwrap().bound_driver, "uio_hv_generic");
    }

    #[test]
    fn test_bind_rejects_malformed_uuid() {
        let node = FakeNode::new("vm-manual");
        let mut inventory = NicInventory::new(&node);
        let mut nic = NicDevice::new("eth0");
        nic.dev_uuid = "not-a-uuid".to_string();
        inventory.append(nic);

        assert!(matches!(
            inventory.bind("eth0", "hv_netvsc"),
            Err(Error::InvalidDeviceUuid { nic, uuid }) if nic == "eth0" && uuid == "not-a-uuid"
        ));
        // Nothing may reach the driver nodes.
        assert!(node.commands().is_empty());
    }

    #[test]
    fn test_set_link_reports_failure() {
        let node = accelerated_node().on("ip link set eth0 up", 2, "");
        let inventory = NicInventory::new(&node);
        assert!(matches!(
            inventory.set_link("eth0", LinkState::Up),
            Err(Error::Environment { .. })
        ));
    }

    #[test]
    fn test_packet_count() {
        let node = accelerated_node()
            .ok("cat /sys/class/net/eth0/statistics/tx_packets", "4021\n")
            .ok("cat /sys/class/net/eth0/statistics/rx_packets", "garbage\n");
        let inventory = NicInventory::new(&node);
        assert_eq!(
            inventory.packet_count("eth0", PacketCounter::Tx).unwrap(),
            4021
        );
        assert!(matches!(
            inventory.packet_count("eth0", PacketCounter::Rx),
            Err(Error::Parse { what, .. }) if what == "packet counter"
        ));
    }

    #[test]
    fn test_is_mana_present() {
        let with_mana = FakeNode::new("vm-mana").ok(
            "lspci -m",
            "2ad5:00:02.0 \"Ethernet controller\" \"Microsoft Corporation\" \"Device 00ba\" -p00 \"\" \"\"\n",
        );
        let inventory = NicInventory::new(&with_mana);
        assert!(inventory.is_mana_present().unwrap());

        let without_mana = FakeNode::new("vm-cx4").ok(
            "lspci -m",
            "a8b4:00:02.0 \"Ethernet controller\" \"Mellanox Technologies\" \"MT27710 Family [ConnectX-4 Lx Virtual Function]\" -r80 \"\" \"\"\n",
        );
        let inventory = NicInventory::new(&without_mana);
        assert!(!inventory.is_mana_present().unwrap());
    }

    #[test]
    fn test_nic_device_display() {
        let mut nic = NicDevice::paired("eth0", "enP1", VF_SLOT);
        nic.ip_addr = "10.0.0.4".to_string();
        nic.mac_addr = "00:22:48:79:69:b4".to_string();
        assert_eq!(
            nic.to_string(),
            format!("upper: eth0, lower: enP1, pci_slot: {VF_SLOT}, ip: 10.0.0.4, mac: 00:22:48:79:69:b4")
        );
    }

    #[test]
    fn test_nic_device_serializes() {
        let nic = NicDevice::paired("eth0", "enP1", VF_SLOT);
        let value = serde_json::to_value(&nic).unwrap();
        assert_eq!(value["upper"], "eth0");
        assert_eq!(value["lower"], "enP1");
        assert_eq!(value["pci_slot"], VF_SLOT);
        assert_eq!(value["bound_driver"], "hv_netvsc");
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("../../../a8b4:00:02.0"), "a8b4:00:02.0");
        assert_eq!(basename("plain"), "plain");
        assert_eq!(basename(""), "");
    }
}
