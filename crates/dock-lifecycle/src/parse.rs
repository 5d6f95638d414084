//! Defensive parsers for remote stat command output.
//!
//! Hosts answer with whatever their userland prints. Anything that does not
//! parse becomes zero — a bad sample must never abort a sweep.

/// CPU usage percentage from the `top`-derived snippet.
pub fn parse_cpu_pct(raw: &str) -> f64 {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Used/total memory in MiB from `free -m` output (`"<used> <total>"`).
pub fn parse_memory_mib(raw: &str) -> (u64, u64) {
    let mut fields = raw.split_whitespace();
    let used = fields.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    let total = fields.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    (used, total)
}

/// Disk usage percentage from `df -h` (`"43%"`).
pub fn parse_disk_pct(raw: &str) -> f64 {
    raw.trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Cumulative rx/tx byte counters from `/proc/net/dev` (`"<rx> <tx>"`).
pub fn parse_net_bytes(raw: &str) -> (u64, u64) {
    let mut fields = raw.split_whitespace();
    let rx = fields.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    let tx = fields.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    (rx, tx)
}
