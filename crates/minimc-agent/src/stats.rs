use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);
const MIB: u64 = 1024 * 1024;
// cgroup v1 reports "no limit" as a page-rounded i64::MAX.
const V1_UNLIMITED_THRESHOLD: u64 = 1 << 60;

/// Point-in-time resource usage of the container the agent runs in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    /// `None` when the cgroup has no memory limit.
    pub memory_limit_mb: Option<u64>,
    pub disk_used_mb: u64,
    pub disk_total_mb: u64,
    pub disk_used_percent: f64,
}

impl ServerStats {
    pub fn summary(&self) -> String {
        let limit = self
            .memory_limit_mb
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unlimited".to_string());
        format!(
            "Stats: CPU {:.2}%, Memory {}/{} MB, Disk {:.2}% used ({}/{} MB)",
            self.cpu_percent,
            self.memory_used_mb,
            limit,
            self.disk_used_percent,
            self.disk_used_mb,
            self.disk_total_mb
        )
    }
}

fn parse_u64(text: &str) -> Option<u64> {
    text.trim().parse().ok()
}

/// `max` (v2) and the v1 sentinel both mean unlimited.
fn parse_limit(text: &str) -> Option<u64> {
    let text = text.trim();
    if text == "max" {
        return None;
    }
    parse_u64(text).filter(|&v| v < V1_UNLIMITED_THRESHOLD)
}

fn parse_usage_usec(cpu_stat: &str) -> Option<u64> {
    cpu_stat.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(v)) => v.parse().ok(),
            _ => None,
        }
    })
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

async fn memory(root: &Path) -> (u64, Option<u64>) {
    let candidates = [
        (root.join("memory.current"), root.join("memory.max")),
        (
            root.join("memory/memory.usage_in_bytes"),
            root.join("memory/memory.limit_in_bytes"),
        ),
    ];
    for (usage_path, limit_path) in candidates {
        let Some(used) = read_trimmed(&usage_path).await.as_deref().and_then(parse_u64) else {
            continue;
        };
        let limit = read_trimmed(&limit_path)
            .await
            .as_deref()
            .and_then(parse_limit);
        return (used / MIB, limit.map(|l| l / MIB));
    }
    (0, None)
}

async fn cpu_percent(root: &Path, window: Duration) -> f64 {
    let path = root.join("cpu.stat");
    let Some(first) = read_trimmed(&path).await.as_deref().and_then(parse_usage_usec) else {
        return 0.0;
    };
    tokio::time::sleep(window).await;
    let Some(second) = read_trimmed(&path).await.as_deref().and_then(parse_usage_usec) else {
        return 0.0;
    };
    let window_usec = window.as_micros().max(1) as f64;
    second.saturating_sub(first) as f64 / window_usec * 100.0
}

#[cfg(unix)]
fn disk_usage(p: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    let frsize = s.f_frsize as u64;
    let total = (s.f_blocks as u64).saturating_mul(frsize);
    let free = (s.f_bfree as u64).saturating_mul(frsize);
    Some((total.saturating_sub(free), total))
}

#[cfg(not(unix))]
fn disk_usage(_p: &Path) -> Option<(u64, u64)> {
    None
}

/// Samples CPU over a short window, so this takes about 100 ms.
pub async fn collect(data_dir: &Path) -> ServerStats {
    collect_from(Path::new(CGROUP_ROOT), data_dir, CPU_SAMPLE_WINDOW).await
}

async fn collect_from(cgroup_root: &Path, data_dir: &Path, window: Duration) -> ServerStats {
    let (memory_used_mb, memory_limit_mb) = memory(cgroup_root).await;
    let cpu_percent = cpu_percent(cgroup_root, window).await;

    let disk_path: PathBuf = if data_dir.exists() {
        data_dir.to_path_buf()
    } else {
        PathBuf::from("/")
    };
    let (used, total) = disk_usage(&disk_path).unwrap_or((0, 0));
    let disk_used_percent = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };

    ServerStats {
        cpu_percent,
        memory_used_mb,
        memory_limit_mb,
        disk_used_mb: used / MIB,
        disk_total_mb: total / MIB,
        disk_used_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_stat_usage_is_found() {
        let stat = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_usage_usec(stat), Some(123456));
        assert_eq!(parse_usage_usec("user_usec 1\n"), None);
    }

    #[test]
    fn limits_treat_max_and_v1_sentinel_as_unlimited() {
        assert_eq!(parse_limit("max\n"), None);
        assert_eq!(parse_limit("9223372036854771712"), None);
        assert_eq!(parse_limit("4294967296\n"), Some(4294967296));
        assert_eq!(parse_limit("garbage"), None);
    }

    #[tokio::test]
    async fn reads_cgroup_v2_files() {
        let cg = tempfile::tempdir().unwrap();
        std::fs::write(cg.path().join("memory.current"), "536870912\n").unwrap();
        std::fs::write(cg.path().join("memory.max"), "2147483648\n").unwrap();
        std::fs::write(cg.path().join("cpu.stat"), "usage_usec 1000\n").unwrap();

        let data = tempfile::tempdir().unwrap();
        let stats = collect_from(cg.path(), data.path(), Duration::from_millis(5)).await;
        assert_eq!(stats.memory_used_mb, 512);
        assert_eq!(stats.memory_limit_mb, Some(2048));
        // The counter did not move between samples.
        assert_eq!(stats.cpu_percent, 0.0);
        #[cfg(unix)]
        assert!(stats.disk_total_mb > 0);
    }

    #[tokio::test]
    async fn falls_back_to_cgroup_v1() {
        let cg = tempfile::tempdir().unwrap();
        std::fs::create_dir(cg.path().join("memory")).unwrap();
        std::fs::write(cg.path().join("memory/memory.usage_in_bytes"), "1048576").unwrap();
        std::fs::write(
            cg.path().join("memory/memory.limit_in_bytes"),
            "9223372036854771712",
        )
        .unwrap();

        let data = tempfile::tempdir().unwrap();
        let stats = collect_from(cg.path(), data.path(), Duration::from_millis(1)).await;
        assert_eq!(stats.memory_used_mb, 1);
        assert_eq!(stats.memory_limit_mb, None);
        assert!(stats.summary().contains("Memory 1/unlimited MB"));
    }
}
