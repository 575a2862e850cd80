//! Resident memory sampling
//!
//! The watchdog charges a run for its whole process group: every sandboxed
//! command is a session leader, so anything it forks shares its pgrp. The
//! leader's `VmHWM` is the kernel's own high-water mark, so short spikes
//! between samples are still seen for it.

/// Read a `kB` field of a procfs status file, in bytes
fn status_field_bytes(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != field {
            return None;
        }
        let kb = value.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
        Some(kb * 1024)
    })
}

/// Peak resident set size in bytes, from the contents of a procfs status file
pub fn parse_peak_rss(content: &str) -> Option<u64> {
    status_field_bytes(content, "VmHWM").or_else(|| status_field_bytes(content, "VmRSS"))
}

/// Current resident set size in bytes
pub fn parse_current_rss(content: &str) -> Option<u64> {
    status_field_bytes(content, "VmRSS")
}

/// Process group id, from the contents of `/proc/<pid>/stat`
pub fn parse_stat_pgrp(content: &str) -> Option<u32> {
    // The command name may hold spaces or parens; fields resume after the last ')'
    let (_, rest) = content.rsplit_once(')')?;
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Sample a live process; `None` once it has exited or been reaped
pub async fn sample_peak_rss(pid: u32) -> Option<u64> {
    let content = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
        .await
        .ok()?;
    parse_peak_rss(&content)
}

/// Live processes whose process group is `pgid`
pub async fn group_members(pgid: u32) -> Vec<u32> {
    let mut members = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir("/proc").await else {
        return members;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await else {
            continue;
        };
        if parse_stat_pgrp(&stat) == Some(pgid) {
            members.push(pid);
        }
    }
    members
}

/// Resident memory of a whole process group led by `pgid`
///
/// Sums the current RSS of every member and never reports less than the
/// leader's own peak. `None` once the group is gone.
pub async fn sample_group_rss(pgid: u32) -> Option<u64> {
    let leader_peak = sample_peak_rss(pgid).await;

    let mut total = None;
    for pid in group_members(pgid).await {
        let Ok(status) = tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await else {
            continue;
        };
        if let Some(rss) = parse_current_rss(&status) {
            total = Some(total.unwrap_or(0) + rss);
        }
    }

    match (total, leader_peak) {
        (Some(total), Some(peak)) => Some(total.max(peak)),
        (total, peak) => total.or(peak),
    }
}
