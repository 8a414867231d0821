//! Raw CPU and memory counters for a server's resource scope.
//!
//! Counters are cumulative; percentages are derived by the telemetry
//! collector from two consecutive reads.

use std::{path::PathBuf, sync::OnceLock};

use crate::error::{Error, Result};

/// Cumulative usage at one instant. `cpu_usage` and `system_usage` share a
/// unit within one scope so only their ratio matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounters {
    pub cpu_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
    pub memory_used: u64,
    pub memory_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceScope {
    /// A bare child process, read from `/proc/<pid>`.
    Process { pid: u32 },
    /// A cgroup-v2 directory the server was placed in.
    Cgroup { path: PathBuf },
}

impl ResourceScope {
    pub async fn read(&self) -> Result<ResourceCounters> {
        match self {
            ResourceScope::Process { pid } => read_process(*pid).await,
            ResourceScope::Cgroup { path } => read_cgroup(path).await,
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

pub(crate) fn online_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn unavailable(what: impl std::fmt::Display) -> Error {
    Error::ResourceUnavailable(what.to_string())
}

async fn read_text(path: impl Into<PathBuf>) -> Result<String> {
    let path = path.into();
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| unavailable(format!("{}: {e}", path.display())))
}

/// utime + stime in clock ticks, from the text of `/proc/<pid>/stat`.
pub(crate) fn parse_proc_stat_ticks(s: &str) -> Option<u64> {
    // The comm field may contain spaces and parentheses; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

/// Sum of all jiffies on the aggregate `cpu` line of `/proc/stat`.
pub(crate) fn parse_system_ticks(s: &str) -> Option<u64> {
    let line = s.lines().find(|l| l.starts_with("cpu "))?;
    let mut total: u64 = 0;
    for field in line.split_whitespace().skip(1) {
        total = total.saturating_add(field.parse::<u64>().ok()?);
    }
    Some(total)
}

pub(crate) fn parse_statm_rss_pages(s: &str) -> Option<u64> {
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    it.next()?.parse().ok()
}

pub(crate) fn parse_meminfo_total(s: &str) -> Option<u64> {
    let line = s.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb.saturating_mul(1024))
}

pub(crate) fn parse_cgroup_usage_usec(s: &str) -> Option<u64> {
    s.lines()
        .find_map(|l| l.strip_prefix("usage_usec "))
        .and_then(|v| v.trim().parse().ok())
}

/// `memory.max` is either a byte count or the literal `max`.
pub(crate) fn parse_cgroup_memory_max(s: &str) -> Option<u64> {
    let v = s.trim();
    if v == "max" {
        return None;
    }
    v.parse().ok()
}

async fn host_memory_total() -> Result<u64> {
    let s = read_text("/proc/meminfo").await?;
    parse_meminfo_total(&s).ok_or_else(|| unavailable("MemTotal missing from /proc/meminfo"))
}

async fn system_ticks() -> Result<u64> {
    let s = read_text("/proc/stat").await?;
    parse_system_ticks(&s).ok_or_else(|| unavailable("malformed /proc/stat"))
}

async fn read_process(pid: u32) -> Result<ResourceCounters> {
    if !cfg!(target_os = "linux") {
        return Err(unavailable("process counters are only available on Linux"));
    }

    let stat = read_text(format!("/proc/{pid}/stat")).await?;
    let cpu_usage =
        parse_proc_stat_ticks(&stat).ok_or_else(|| unavailable(format!("malformed /proc/{pid}/stat")))?;
    let statm = read_text(format!("/proc/{pid}/statm")).await?;
    let rss_pages =
        parse_statm_rss_pages(&statm).ok_or_else(|| unavailable(format!("malformed /proc/{pid}/statm")))?;

    Ok(ResourceCounters {
        cpu_usage,
        // Aggregate jiffies already span every core, hence the online_cpus factor later.
        system_usage: system_ticks().await?,
        online_cpus: online_cpus(),
        memory_used: rss_pages.saturating_mul(page_size()),
        memory_limit: host_memory_total().await?,
    })
}

async fn read_cgroup(path: &std::path::Path) -> Result<ResourceCounters> {
    let cpu_stat = read_text(path.join("cpu.stat")).await?;
    let usage_usec = parse_cgroup_usage_usec(&cpu_stat)
        .ok_or_else(|| unavailable(format!("usage_usec missing in {}", path.display())))?;
    let current = read_text(path.join("memory.current")).await?;
    let memory_used: u64 = current
        .trim()
        .parse()
        .map_err(|_| unavailable(format!("malformed memory.current in {}", path.display())))?;
    let memory_limit = match read_text(path.join("memory.max"))
        .await
        .ok()
        .and_then(|s| parse_cgroup_memory_max(&s))
    {
        Some(v) => v,
        None => host_memory_total().await?,
    };

    // Convert host jiffies to microseconds so both counters share a unit.
    let system_usec = system_ticks()
        .await?
        .saturating_mul(1_000_000 / ticks_per_sec().max(1));

    Ok(ResourceCounters {
        cpu_usage: usage_usec,
        system_usage: system_usec,
        online_cpus: online_cpus(),
        memory_used,
        memory_limit,
    })
}

/// Place `pid` into a dedicated cgroup under `root`, optionally capping memory.
/// Returns the group path on success.
#[cfg(target_os = "linux")]
pub(crate) fn attach_to_cgroup(
    root: &std::path::Path,
    instance_id: &str,
    pid: u32,
    memory_limit_bytes: Option<u64>,
) -> std::io::Result<PathBuf> {
    let name: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let path = root.join(format!("craft.instance.{name}"));
    if let Err(e) = std::fs::create_dir(&path)
        && e.kind() != std::io::ErrorKind::AlreadyExists
    {
        return Err(e);
    }
    if let Some(limit) = memory_limit_bytes {
        std::fs::write(path.join("memory.max"), format!("{limit}\n"))?;
    }
    std::fs::write(path.join("cgroup.procs"), format!("{pid}\n"))?;
    Ok(path)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn attach_to_cgroup(
    _root: &std::path::Path,
    _instance_id: &str,
    _pid: u32,
    _memory_limit_bytes: Option<u64>,
) -> std::io::Result<PathBuf> {
    Err(std::io::Error::other("cgroups are only available on Linux"))
}

/// Bytes for a JVM-style size (`2G`, `512M`, `1024K`, bare bytes).
pub(crate) fn memory_bytes(normalized: &str) -> Option<u64> {
    let (digits, mult) = match normalized.chars().last()? {
        'K' => (&normalized[..normalized.len() - 1], 1024),
        'M' => (&normalized[..normalized.len() - 1], 1024 * 1024),
        'G' => (&normalized[..normalized.len() - 1], 1024 * 1024 * 1024),
        _ => (normalized, 1),
    };
    digits.parse::<u64>().ok().map(|v| v.saturating_mul(mult))
}

/// Lightweight per-pid read used by status calls.
pub(crate) async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    parse_proc_stat_ticks(&s)
}

pub(crate) async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm")).await.ok()?;
    parse_statm_rss_pages(&s).map(|p| p.saturating_mul(page_size()))
}

pub(crate) async fn read_host_memory_total() -> Option<u64> {
    host_memory_total().await.ok()
}

/// Percent of one core consumed between two tick readings.
pub(crate) fn cpu_percent_between(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    if cpu.is_finite() { (cpu * 100.0).round() / 100.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_stat_handles_parenthesised_comm() {
        // pid (comm) state ppid ... utime=14th, stime=15th field overall.
        let line = "4242 (java (server)) S 1 4242 4242 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 40 0 1000 0 0";
        assert_eq!(parse_proc_stat_ticks(line), Some(300));
        assert_eq!(parse_proc_stat_ticks("garbage"), None);
    }

    #[test]
    fn system_ticks_sum_aggregate_line_only() {
        let stat = "cpu  10 20 30 40 0 0 0 0 0 0\ncpu0 1 2 3 4 0 0 0 0 0 0\nintr 5\n";
        assert_eq!(parse_system_ticks(stat), Some(100));
        assert_eq!(parse_system_ticks("intr 5\n"), None);
    }

    #[test]
    fn meminfo_and_statm() {
        let meminfo = "MemTotal:       16384 kB\nMemFree:  1 kB\n";
        assert_eq!(parse_meminfo_total(meminfo), Some(16384 * 1024));
        assert_eq!(parse_statm_rss_pages("1000 250 10 1 0 100 0\n"), Some(250));
    }

    #[test]
    fn cgroup_files() {
        let cpu_stat = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_cgroup_usage_usec(cpu_stat), Some(123_456));
        assert_eq!(parse_cgroup_memory_max("max\n"), None);
        assert_eq!(parse_cgroup_memory_max("2147483648\n"), Some(2_147_483_648));
    }

    #[test]
    fn memory_bytes_from_jvm_sizes() {
        assert_eq!(memory_bytes("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(memory_bytes("512M"), Some(512 * 1024 * 1024));
        assert_eq!(memory_bytes("4096"), Some(4096));
        assert_eq!(memory_bytes(""), None);
    }

    #[tokio::test]
    async fn cgroup_scope_reads_counters_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpu.stat"), "usage_usec 5000\n").unwrap();
        std::fs::write(dir.path().join("memory.current"), "1048576\n").unwrap();
        std::fs::write(dir.path().join("memory.max"), "4194304\n").unwrap();

        let scope = ResourceScope::Cgroup {
            path: dir.path().to_path_buf(),
        };
        match scope.read().await {
            Ok(c) => {
                assert_eq!(c.cpu_usage, 5000);
                assert_eq!(c.memory_used, 1_048_576);
                assert_eq!(c.memory_limit, 4_194_304);
                assert!(c.online_cpus >= 1);
            }
            // Hosts without /proc/stat cannot provide the system counter.
            Err(e) => assert_eq!(e.code(), "resource_unavailable"),
        }
    }

    #[tokio::test]
    async fn missing_scope_is_resource_unavailable() {
        let scope = ResourceScope::Cgroup {
            path: PathBuf::from("/definitely/not/a/cgroup"),
        };
        let err = scope.read().await.unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable(_)));
    }
}
