// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Regex extractors shared by the probing code.
//!
//! The patterns stay deliberately loose where the tooling output allows
//! it (the IPv4 quad accepts hex digits). Absence is `None`; whether a
//! missing match is fatal belongs to the call site.

use std::sync::LazyLock;

use regex::Regex;

static IPV4_ADDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"inet\s+([0-9a-fA-F]{1,3}\.[0-9a-fA-F]{1,3}\.[0-9a-fA-F]{1,3}\.[0-9a-fA-F]{1,3})")
        .unwrap()
});

static MAC_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ether\s+([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})").unwrap());

static DEFAULT_ROUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"default via\s+[0-9a-fA-F]{1,3}(?:\.[0-9a-fA-F]{1,3}){3}\s+dev\s+(\S+)").unwrap()
});

static ROOT_PARTITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\S+)\s+on\s+/\s+type\s+\S+").unwrap());

static PCI_SLOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-9a-fA-F]$").unwrap()
});

static PCI_DEVICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^(\S+)\s+"([^"]+)"\s+"([^"]+)"\s+"([^"]*)""#).unwrap());

/// First IPv4-looking token after an `inet` marker, as printed by
/// `ip addr show`. Does not match `inet6` lines.
pub fn ipv4_addr(text: &str) -> Option<&str> {
    IPV4_ADDR
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// First colon-separated hardware address after an `ether` marker.
pub fn mac_addr(text: &str) -> Option<&str> {
    MAC_ADDR
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Interface carrying the default route in `ip route show` output.
pub fn default_route_device(text: &str) -> Option<&str> {
    DEFAULT_ROUTE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Device token of the `/` entry in `mount` output.
pub fn root_partition(text: &str) -> Option<&str> {
    ROOT_PARTITION
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Whether `token` has the `dddd:bb:dd.f` shape of a PCI slot.
pub fn is_pci_slot(token: &str) -> bool {
    PCI_SLOT.is_match(token)
}

/// One record of machine-readable `lspci -m` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub slot: String,
    pub device_class: String,
    pub vendor: String,
    pub device: String,
}

/// Parse every device line out of `lspci -m` output.
pub fn pci_devices(text: &str) -> Vec<PciDeviceInfo> {
    PCI_DEVICE
        .captures_iter(text)
        .map(|c| PciDeviceInfo {
            slot: c[1].to_string(),
            device_class: c[2].to_string(),
            vendor: c[3].to_string(),
            device: c[4].to_string(),
        })
        .collect()
}
