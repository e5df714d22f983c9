//! Hypervisor CLI surface used by the pool engine
//!
//! Everything goes through `virsh` and `rbd` invoked via a [`Shell`], with
//! tabular output decoded by [`crate::tabular`].
//!
//! [`Shell`]: crate::execution::shell::Shell

pub mod templates;
mod virsh;

pub use virsh::Virsh;

use crate::execution::shell::ShellError;
use crate::tabular::DecodeError;
use thiserror::Error;

/// Default Ceph monitor port when the address carries none
pub const DEFAULT_MONITOR_PORT: u16 = 6789;

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("unexpected CLI output: {0}")]
    Decode(#[from] DecodeError),
    #[error("cannot stage definition file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected usage report: {0}")]
    Usage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub address: String,
    pub port: u16,
}

/// Split `"10.0.0.1:6789,10.0.0.2"` into monitor address/port pairs
pub fn parse_monitors(monitors: &str) -> Vec<Monitor> {
    monitors
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.split(':');
            let address = parts.next()?.trim().to_string();
            if address.is_empty() {
                return None;
            }
            let port = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(DEFAULT_MONITOR_PORT);
            Some(Monitor { address, port })
        })
        .collect()
}

/// Parse a virsh size such as `"20.00 GiB"` into bytes
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bytes" => 1.0,
        "kib" | "k" => 1024.0,
        "mib" | "m" => 1024.0_f64.powi(2),
        "gib" | "g" => 1024.0_f64.powi(3),
        "tib" | "t" => 1024.0_f64.powi(4),
        "pib" | "p" => 1024.0_f64.powi(5),
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// One row of `vol-list --details`
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub name: String,
    pub path: String,
    pub capacity: Option<u64>,
    pub allocation: Option<u64>,
}

/// Actual usage of one image as reported by `rbd du`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub provisioned: u64,
    pub used: u64,
}
