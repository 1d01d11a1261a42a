// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::LazyLock;

use regex::Regex;

use crate::node::{ExecOpts, NodeExecutor};
use crate::{pattern, Error, Result};

static DISK_FROM_PARTITION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/dev/(\D+)").unwrap());

/// Device holding the root filesystem, taken from `mount` output.
/// Guessing a disk is never acceptable, so absence is an error.
pub fn os_disk_partition(node: &dyn NodeExecutor) -> Result<String> {
    let out = node.run("mount", &ExecOpts::new())?;
    match pattern::root_partition(&out.stdout) {
        Some(partition) => Ok(partition.to_string()),
        None => Err(Error::Parse {
            what: "root partition",
            context: out.stdout,
        }),
    }
}

/// Disk portion of a partition device name (`/dev/sda1` to `sda`).
pub fn partition_disk(partition: &str) -> Option<&str> {
    DISK_FROM_PARTITION
        .captures(partition)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
