use specta::Type;

/// Opaque, immutable identity of a managed server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    pub fn is_running(self) -> bool {
        matches!(self, ServerState::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_total_bytes: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerStatus {
    pub instance_id: InstanceId,
    pub state: ServerState,
    pub is_running: bool,
    pub pid: Option<u32>,
    pub started_at_unix_ms: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub version: String,
    pub max_players: u32,
    pub resources: Option<ResourceUsage>,
}

/// One telemetry observation. All series in a history are index-aligned
/// because every sample carries every series.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct MetricSample {
    pub timestamp_unix_ms: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_max_bytes: u64,
    pub tick_time_ms: f64,
    pub tick_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl PerformanceStatus {
    pub fn from_tick_rate(tick_rate: f64) -> Self {
        if tick_rate >= 19.5 {
            PerformanceStatus::Excellent
        } else if tick_rate >= 18.0 {
            PerformanceStatus::Good
        } else if tick_rate >= 15.0 {
            PerformanceStatus::Fair
        } else {
            PerformanceStatus::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct CurrentMetrics {
    pub sample: MetricSample,
    pub status: PerformanceStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct SeriesStats {
    pub current: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl SeriesStats {
    /// `None` for an empty series. Values are rounded to two decimals.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let current = *values.last()?;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let round = |v: f64| (v * 100.0).round() / 100.0;
        Some(Self {
            current: round(current),
            avg: round(sum / values.len() as f64),
            min: round(min),
            max: round(max),
        })
    }
}

/// Aggregates over the full retained telemetry window.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct MetricStatistics {
    pub sample_count: u32,
    pub cpu_percent: SeriesStats,
    pub memory_percent: SeriesStats,
    pub tick_rate: SeriesStats,
    pub tick_time_ms: SeriesStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    TickRate,
    Cpu,
    Memory,
    TickTime,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub value: f64,
}
