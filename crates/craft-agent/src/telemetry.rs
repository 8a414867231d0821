//! Per-instance performance telemetry: resource sampling on an interval plus
//! tick-rate extraction from console output.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use craft_process::{
    Alert, AlertCategory, AlertSeverity, CurrentMetrics, MetricSample, MetricStatistics,
    PerformanceStatus, SeriesStats,
};
use futures_util::stream::{BoxStream, StreamExt};
use regex::Regex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::console::ConsoleObserver;
use crate::error::Error;
use crate::resource::{ResourceCounters, ResourceScope};

const NOMINAL_TICK_RATE: f64 = 20.0;
const SNAPSHOT_CAPACITY: usize = 64;

/// Fixed-capacity FIFO; pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The newest `k` entries, oldest first.
    pub fn last(&self, k: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(k);
        self.items.iter().skip(skip).cloned().collect()
    }
}

// Minecraft formatting codes and ANSI colour escapes.
static COLOUR_CODES: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"§[0-9a-fk-orA-FK-OR]|\x1b\[[0-9;]*m").ok());
// "TPS from last 1m, 5m, 15m: 20.0, 20.0, 20.0" -> first value after the colon.
static TPS_AFTER_COLON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"TPS(?:\s+from[^:]*)?:\D*?(\d+(?:\.\d+)?)").ok());
static TPS_PLAIN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"TPS\D*?(\d+(?:\.\d+)?)").ok());
static MEAN_TICK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)tick[^0-9\n]*?(\d+(?:\.\d+)?)\s*ms").ok());

fn capture_f64(re: &LazyLock<Option<Regex>>, text: &str) -> Option<f64> {
    let re = re.as_ref()?;
    re.captures(text)?.get(1)?.as_str().parse::<f64>().ok()
}

fn strip_colour(line: &str) -> std::borrow::Cow<'_, str> {
    match COLOUR_CODES.as_ref() {
        Some(re) => re.replace_all(line, ""),
        None => std::borrow::Cow::Borrowed(line),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Tick rate reported directly after a `TPS` marker.
pub(crate) fn parse_tick_rate(line: &str) -> Option<f64> {
    let line = strip_colour(line);
    capture_f64(&TPS_AFTER_COLON, &line)
        .or_else(|| capture_f64(&TPS_PLAIN, &line))
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Mean tick duration in milliseconds. Zero is treated as no report.
pub(crate) fn parse_mean_tick_ms(line: &str) -> Option<f64> {
    let line = strip_colour(line);
    capture_f64(&MEAN_TICK, &line).filter(|v| v.is_finite() && *v > 0.0)
}

fn now_unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug)]
struct TelemetryState {
    samples: RingBuffer<MetricSample>,
    cpu_percent: f64,
    memory_percent: f64,
    memory_used_bytes: u64,
    memory_max_bytes: u64,
    tick_rate: f64,
    tick_time_ms: f64,
    prev: Option<ResourceCounters>,
}

impl TelemetryState {
    fn snapshot(&self, timestamp_unix_ms: u64) -> MetricSample {
        MetricSample {
            timestamp_unix_ms,
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            memory_used_bytes: self.memory_used_bytes,
            memory_max_bytes: self.memory_max_bytes,
            tick_time_ms: self.tick_time_ms,
            tick_rate: self.tick_rate,
        }
    }
}

pub struct TelemetryCollector {
    instance_id: String,
    interval: Duration,
    error_backoff: Duration,
    state: Mutex<TelemetryState>,
    snapshots: broadcast::Sender<CurrentMetrics>,
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("instance_id", &self.instance_id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl TelemetryCollector {
    pub fn new(
        instance_id: impl Into<String>,
        history: usize,
        interval: Duration,
        error_backoff: Duration,
    ) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self {
            instance_id: instance_id.into(),
            interval,
            error_backoff,
            state: Mutex::new(TelemetryState {
                samples: RingBuffer::new(history),
                cpu_percent: 0.0,
                memory_percent: 0.0,
                memory_used_bytes: 0,
                memory_max_bytes: 0,
                tick_rate: NOMINAL_TICK_RATE,
                tick_time_ms: 0.0,
                prev: None,
            }),
            snapshots,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TelemetryState) -> R) -> R {
        // A panic while holding the lock leaves plain numbers behind; keep going.
        let mut st = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut st)
    }

    /// Feed one console line through both tick extractors. When both match,
    /// whichever is applied last wins; a line carrying a duration keeps it as
    /// the tick time.
    pub fn observe_line(&self, line: &str) {
        let tick_ms = parse_mean_tick_ms(line);
        let tps = parse_tick_rate(line);
        if tick_ms.is_none() && tps.is_none() {
            return;
        }

        self.with_state(|st| {
            if let Some(ms) = tick_ms {
                st.tick_time_ms = round2(ms);
                st.tick_rate = round2((1000.0 / ms).min(NOMINAL_TICK_RATE));
            }
            if let Some(tps) = tps {
                st.tick_rate = round2(tps);
                if tick_ms.is_none() && tps > 0.0 {
                    st.tick_time_ms = round2(1000.0 / tps);
                }
            }
        });
    }

    /// Fold one counter reading into the current values and history.
    pub fn record(&self, counters: ResourceCounters) -> MetricSample {
        self.with_state(|st| {
            if let Some(prev) = st.prev {
                let system_delta = counters.system_usage.saturating_sub(prev.system_usage);
                if system_delta > 0 {
                    let cpu_delta = counters.cpu_usage.saturating_sub(prev.cpu_usage);
                    let pct = cpu_delta as f64 / system_delta as f64
                        * counters.online_cpus.max(1) as f64
                        * 100.0;
                    st.cpu_percent = round2(pct);
                }
            }
            st.prev = Some(counters);

            st.memory_used_bytes = counters.memory_used;
            st.memory_max_bytes = counters.memory_limit;
            if counters.memory_limit > 0 {
                st.memory_percent =
                    round2(counters.memory_used as f64 / counters.memory_limit as f64 * 100.0);
            }

            let sample = st.snapshot(now_unix_ms());
            st.samples.push(sample.clone());
            sample
        })
    }

    /// Forget the previous counters so the next reading starts a new delta.
    pub fn reset_counters(&self) {
        self.with_state(|st| st.prev = None);
    }

    pub fn current_metrics(&self) -> CurrentMetrics {
        let sample = self.with_state(|st| {
            let ts = st
                .samples
                .latest()
                .map(|s| s.timestamp_unix_ms)
                .unwrap_or_else(now_unix_ms);
            st.snapshot(ts)
        });
        CurrentMetrics {
            status: PerformanceStatus::from_tick_rate(sample.tick_rate),
            sample,
        }
    }

    /// At most `seconds` of the newest samples, oldest first.
    pub fn history(&self, seconds: u64) -> Vec<MetricSample> {
        let per_sample = self.interval.as_secs_f64().max(0.001);
        let count = (seconds as f64 / per_sample).ceil() as usize;
        self.with_state(|st| st.samples.last(count))
    }

    pub fn sample_count(&self) -> usize {
        self.with_state(|st| st.samples.len())
    }

    /// `None` until the first sample is recorded.
    pub fn statistics(&self) -> Option<MetricStatistics> {
        self.with_state(|st| {
            let series = |f: fn(&MetricSample) -> f64| -> Vec<f64> {
                st.samples.iter().map(f).collect()
            };
            Some(MetricStatistics {
                sample_count: st.samples.len() as u32,
                cpu_percent: SeriesStats::from_values(&series(|s| s.cpu_percent))?,
                memory_percent: SeriesStats::from_values(&series(|s| s.memory_percent))?,
                tick_rate: SeriesStats::from_values(&series(|s| s.tick_rate))?,
                tick_time_ms: SeriesStats::from_values(&series(|s| s.tick_time_ms))?,
            })
        })
    }

    pub fn alerts(&self) -> Vec<Alert> {
        let current = self.current_metrics().sample;
        evaluate_alerts(&current)
    }

    pub fn subscribe(&self) -> BoxStream<'static, CurrentMetrics> {
        let instance_id = self.instance_id.clone();
        BroadcastStream::new(self.snapshots.subscribe())
            .filter_map(move |item| {
                let snapshot = match item {
                    Ok(s) => Some(s),
                    Err(e) => {
                        tracing::debug!(instance_id = %instance_id, error = %e, "metrics subscriber lagged");
                        None
                    }
                };
                futures_util::future::ready(snapshot)
            })
            .boxed()
    }

    /// Run the sampling loop until the handle is aborted. `scope_rx` carries
    /// the live resource scope, `None` while the server is stopped.
    pub fn spawn(self: &Arc<Self>, mut scope_rx: watch::Receiver<Option<ResourceScope>>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_scope: Option<ResourceScope> = None;

            loop {
                ticker.tick().await;

                let scope = scope_rx.borrow_and_update().clone();
                if scope != last_scope {
                    this.reset_counters();
                    last_scope = scope.clone();
                }
                let Some(scope) = scope else {
                    continue;
                };

                match scope.read().await {
                    Ok(counters) => {
                        this.record(counters);
                        // Nobody listening is fine.
                        let _ = this.snapshots.send(this.current_metrics());
                    }
                    Err(Error::ResourceUnavailable(reason)) => {
                        tracing::debug!(instance_id = %this.instance_id, %reason, "resource sample skipped");
                        this.reset_counters();
                    }
                    Err(e) => {
                        tracing::warn!(instance_id = %this.instance_id, error = %e, "telemetry sampling failed; backing off");
                        tokio::time::sleep(this.error_backoff).await;
                    }
                }
            }
        })
    }
}

impl ConsoleObserver for TelemetryCollector {
    fn on_line(&self, line: &str) {
        self.observe_line(line);
    }
}

fn threshold_alert(
    category: AlertCategory,
    value: f64,
    critical: bool,
    warning: bool,
    describe: impl Fn(AlertSeverity) -> String,
) -> Option<Alert> {
    let severity = if critical {
        AlertSeverity::Critical
    } else if warning {
        AlertSeverity::Warning
    } else {
        return None;
    };
    Some(Alert {
        severity,
        category,
        message: describe(severity),
        value,
    })
}

fn qualifier(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "critically ",
        AlertSeverity::Warning => "",
    }
}

/// At most one alert per category; critical shadows warning.
pub fn evaluate_alerts(s: &MetricSample) -> Vec<Alert> {
    let tps = s.tick_rate;
    let cpu = s.cpu_percent;
    let mem = s.memory_percent;
    let mspt = s.tick_time_ms;

    [
        threshold_alert(AlertCategory::TickRate, tps, tps < 15.0, tps < 18.0, |sev| {
            format!("Tick rate is {}low: {tps:.2} TPS", qualifier(sev))
        }),
        threshold_alert(AlertCategory::Cpu, cpu, cpu > 90.0, cpu > 75.0, |sev| {
            format!("CPU usage is {}high: {cpu:.1}%", qualifier(sev))
        }),
        threshold_alert(AlertCategory::Memory, mem, mem > 90.0, mem > 80.0, |sev| {
            format!("Memory usage is {}high: {mem:.1}%", qualifier(sev))
        }),
        threshold_alert(AlertCategory::TickTime, mspt, mspt > 100.0, mspt > 70.0, |sev| {
            format!("Tick time is {}high: {mspt:.1}ms", qualifier(sev))
        }),
    ]
    .into_iter()
    .flatten()
    .collect()
}
