//! Small helpers shared across modules.

use serde::Serialize;

/// Hex-encode a byte slice (replacement for the `hex` crate, to avoid extra deps).
pub mod hex {
    use std::fmt::Write;

    pub fn encode(bytes: &[u8]) -> String {
        bytes
            .iter()
            .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
                let _ = write!(s, "{b:02x}");
                s
            })
    }
}

/// Resident and virtual memory of this process, from `/proc/self/status`.
///
/// All fields are zero on platforms without procfs.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessMemory {
    pub rss_kb: u64,
    pub vm_size_kb: u64,
    pub vm_peak_kb: u64,
}

/// Snapshot this process's memory usage.
pub fn process_memory() -> ProcessMemory {
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    parse_proc_status(&status)
}

fn parse_proc_status(status: &str) -> ProcessMemory {
    let mut mem = ProcessMemory::default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            mem.rss_kb = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            mem.vm_size_kb = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("VmPeak:") {
            mem.vm_peak_kb = parse_kb_value(rest);
        }
    }
    mem
}

fn parse_kb_value(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
