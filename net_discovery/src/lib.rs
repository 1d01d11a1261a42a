// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

pub mod disk;
mod nic;
mod node;
pub mod pattern;
mod retry;

pub use nic::{LinkState, NicDevice, NicInventory, PacketCounter, DEFAULT_NETVSC_DRIVER};
pub use node::{CmdOutput, ExecOpts, NodeExecutor, TransportError};
pub use retry::RetryPolicy;

use thiserror::Error;

/// Errors raised while building or querying a NIC inventory.
#[derive(Error, Debug)]
pub enum Error {
    /// A required token was not found in command output.
    #[error("no {what} found in command output: {context:?}")]
    Parse { what: &'static str, context: String },

    /// The node state contradicts what discovery relies on. Never
    /// retried here; callers decide whether to re-run discovery.
    #[error("environment inconsistency on node '{node}': {reason}")]
    Environment { node: String, reason: String },

    /// The command could not be delivered to the node at all.
    #[error("command transport failed")]
    Transport(#[from] TransportError),

    /// Lookup of an interface name with no record in the inventory.
    #[error("unknown network interface '{name}', known interfaces: {known:?}")]
    UnknownNic { name: String, known: Vec<String> },

    /// The recorded device identity is not usable for driver writes.
    #[error("nic '{nic}' has malformed device uuid '{uuid}'")]
    InvalidDeviceUuid { nic: String, uuid: String },
}

pub type Result<T> = std::result::Result<T, Error>;
