use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::backup::BackupStore;
use crate::config::write_atomic;
use crate::controller::ProcessController;
use crate::error::{Error, IoContext, Result};

const MAX_IDLE: Duration = Duration::from_secs(60);
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Backup,
    Restart,
    Command,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScheduledTask {
    /// Assigned on create when left empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub action: TaskAction,
    /// Five-field cron: minute hour day-of-month month day-of-week.
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// `command` holds the console command for command tasks.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, action: TaskAction, schedule: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            action,
            schedule: schedule.into(),
            enabled: true,
            last_run: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> Error {
    Error::InvalidSchedule {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn day_index(expr: &str, raw: &str) -> Result<usize> {
    if let Ok(n) = raw.parse::<usize>() {
        if n > 7 {
            return Err(invalid(expr, format!("day-of-week {n} out of range 0-7")));
        }
        return Ok(n);
    }
    DAY_NAMES
        .iter()
        .position(|d| d.eq_ignore_ascii_case(raw))
        .ok_or_else(|| invalid(expr, format!("unknown day-of-week {raw:?}")))
}

/// Rewrite a day-of-week field as day names. Numeric days follow the classic
/// convention (0 and 7 are Sunday), names are unambiguous to the parser.
fn normalize_day_of_week(expr: &str, field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::<usize>::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((b, s)) => {
                let step = s
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| invalid(expr, format!("bad step in {item:?}")))?;
                (b, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            (day_index(expr, a)?, day_index(expr, b)?)
        } else {
            let d = day_index(expr, base)?;
            (d, if step.is_some() { 6 } else { d })
        };
        if start > end {
            return Err(invalid(expr, format!("descending day range {item:?}")));
        }

        for d in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(d % 7);
        }
    }

    if days.len() == 7 {
        return Ok("*".to_string());
    }
    Ok(days
        .into_iter()
        .map(|d| DAY_NAMES[d])
        .collect::<Vec<_>>()
        .join(","))
}

fn split_fields(expr: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(invalid(
            expr,
            format!("expected 5 fields, found {}", parts.len()),
        ));
    }
    Ok(parts)
}

/// Convert five-field cron into the seconds-first form the parser expects.
pub fn normalize_cron_expr(expr: &str) -> Result<String> {
    let parts = split_fields(expr)?;
    let dow = normalize_day_of_week(expr, parts[4])?;
    Ok(format!("0 {} {} {} {} {dow}", parts[0], parts[1], parts[2], parts[3]))
}

/// A five-field cron schedule. When both day-of-month and day-of-week are
/// restricted, a day matching either one fires.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    parts: Vec<Schedule>,
}

impl CronSchedule {
    /// First firing strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.parts
            .iter()
            .filter_map(|s| s.after(after).next())
            .min()
    }

    pub fn next_from_now(&self) -> Option<DateTime<Local>> {
        self.next_after(&Local::now())
    }
}

pub fn parse_schedule(expr: &str) -> Result<CronSchedule> {
    let parts = split_fields(expr)?;
    let (minute, hour, dom, month) = (parts[0], parts[1], parts[2], parts[3]);
    let dow = normalize_day_of_week(expr, parts[4])?;

    // Classic cron: a day field starting with `*` does not restrict.
    let restricted = |field: &str| !field.starts_with(['*', '?']);
    let variants = if restricted(dom) && restricted(parts[4]) {
        vec![
            format!("0 {minute} {hour} {dom} {month} *"),
            format!("0 {minute} {hour} * {month} {dow}"),
        ]
    } else {
        vec![format!("0 {minute} {hour} {dom} {month} {dow}")]
    };
    let schedules = variants
        .iter()
        .map(|v| Schedule::from_str(v).map_err(|e| invalid(expr, e.to_string())))
        .collect::<Result<Vec<_>>>()?;

    let schedule = CronSchedule { parts: schedules };
    if schedule.next_from_now().is_none() {
        return Err(invalid(expr, "schedule never fires"));
    }
    Ok(schedule)
}

#[derive(Debug)]
struct Dispatch {
    schedule: CronSchedule,
    next: DateTime<Local>,
}

/// Scheduled tasks of one instance plus the live cron dispatch table.
pub struct TaskScheduler {
    instance_id: String,
    tasks_file: PathBuf,
    controller: Arc<ProcessController>,
    backups: BackupStore,
    tasks: Mutex<Vec<ScheduledTask>>,
    dispatch: std::sync::Mutex<HashMap<String, Dispatch>>,
    changed: Notify,
}

impl TaskScheduler {
    /// Load persisted tasks and register every enabled one.
    pub async fn load(
        instance_id: impl Into<String>,
        tasks_file: impl Into<PathBuf>,
        controller: Arc<ProcessController>,
        backups: BackupStore,
    ) -> Result<Arc<Self>> {
        let instance_id = instance_id.into();
        let tasks_file = tasks_file.into();
        let tasks = read_tasks(&tasks_file).await?;

        let this = Arc::new(Self {
            instance_id,
            tasks_file,
            controller,
            backups,
            tasks: Mutex::new(Vec::new()),
            dispatch: std::sync::Mutex::new(HashMap::new()),
            changed: Notify::new(),
        });
        for task in &tasks {
            if !task.enabled {
                continue;
            }
            match parse_schedule(&task.schedule) {
                Ok(schedule) => this.register(&task.id, schedule),
                Err(e) => tracing::warn!(
                    instance_id = %this.instance_id,
                    task_id = %task.id,
                    error = %e,
                    "stored task has an unusable schedule; not registered"
                ),
            }
        }
        *this.tasks.lock().await = tasks;
        Ok(this)
    }

    fn with_dispatch<R>(&self, f: impl FnOnce(&mut HashMap<String, Dispatch>) -> R) -> R {
        let mut guard = match self.dispatch.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn register(&self, id: &str, schedule: CronSchedule) {
        let Some(next) = schedule.next_from_now() else {
            return;
        };
        self.with_dispatch(|d| d.insert(id.to_string(), Dispatch { schedule, next }));
        self.changed.notify_one();
    }

    fn unregister(&self, id: &str) {
        if self.with_dispatch(|d| d.remove(id)).is_some() {
            self.changed.notify_one();
        }
    }

    pub fn dispatch_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.with_dispatch(|d| d.keys().cloned().collect());
        ids.sort();
        ids
    }

    pub fn has_dispatch(&self, id: &str) -> bool {
        self.with_dispatch(|d| d.contains_key(id))
    }

    async fn persist(&self, tasks: &[ScheduledTask]) -> Result<()> {
        let data = serde_json::to_vec_pretty(tasks).io_context(|| "serialize scheduled tasks".into())?;
        write_atomic(&self.tasks_file, &data)
            .await
            .io_context(|| format!("write {}", self.tasks_file.display()))
    }

    pub async fn list(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Result<ScheduledTask> {
        self.tasks
            .lock()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", id))
    }

    pub async fn create(&self, mut task: ScheduledTask) -> Result<ScheduledTask> {
        let schedule = parse_schedule(&task.schedule)?;
        if task.id.trim().is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(Error::InvalidArgument(format!("task id {} already exists", task.id)));
        }
        let mut next = tasks.clone();
        next.push(task.clone());
        self.persist(&next).await?;
        *tasks = next;

        if task.enabled {
            self.register(&task.id, schedule);
        }
        tracing::info!(instance_id = %self.instance_id, task_id = %task.id, schedule = %task.schedule, "task created");
        Ok(task)
    }

    pub async fn update(&self, id: &str, mut task: ScheduledTask) -> Result<ScheduledTask> {
        let mut tasks = self.tasks.lock().await;
        let Some(pos) = tasks.iter().position(|t| t.id == id) else {
            return Err(Error::not_found("task", id));
        };
        let schedule = parse_schedule(&task.schedule)?;

        task.id = id.to_string();
        if task.last_run.is_none() {
            task.last_run = tasks[pos].last_run;
        }
        let mut next = tasks.clone();
        next[pos] = task.clone();
        self.persist(&next).await?;
        *tasks = next;

        self.unregister(id);
        if task.enabled {
            self.register(id, schedule);
        }
        tracing::info!(instance_id = %self.instance_id, task_id = id, "task updated");
        Ok(task)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.iter().any(|t| t.id == id) {
            return Err(Error::not_found("task", id));
        }
        let next: Vec<ScheduledTask> = tasks.iter().filter(|t| t.id != id).cloned().collect();
        self.persist(&next).await?;
        *tasks = next;

        self.unregister(id);
        tracing::info!(instance_id = %self.instance_id, task_id = id, "task deleted");
        Ok(())
    }

    /// Fire a task immediately. `last_run` is recorded even when the action fails.
    pub async fn run_now(&self, id: &str) -> Result<()> {
        self.fire(id).await
    }

    async fn run_action(&self, task: &ScheduledTask) -> Result<()> {
        match task.action {
            TaskAction::Backup => self.backups.create().await.map(|_| ()),
            TaskAction::Restart => self.controller.restart().await,
            TaskAction::Command => {
                let command = task
                    .params
                    .get("command")
                    .map(|c| c.trim())
                    .filter(|c| !c.is_empty());
                match command {
                    Some(command) => self.controller.send_command(command).await,
                    None => {
                        tracing::debug!(task_id = %task.id, "command task without a command; skipped");
                        Ok(())
                    }
                }
            }
        }
    }

    async fn fire(&self, id: &str) -> Result<()> {
        let task = self.get(id).await?;
        tracing::info!(instance_id = %self.instance_id, task_id = id, action = ?task.action, "running task");
        let outcome = self.run_action(&task).await;

        let mut tasks = self.tasks.lock().await;
        let mut next = tasks.clone();
        // The task may have been deleted while the action ran.
        if let Some(t) = next.iter_mut().find(|t| t.id == id) {
            t.last_run = Some(Utc::now());
            match self.persist(&next).await {
                Ok(()) => *tasks = next,
                Err(e) => tracing::warn!(instance_id = %self.instance_id, task_id = id, error = %e, "failed to record task run"),
            }
        }
        outcome
    }

    /// Pop every entry due at `now` and re-arm it. Returns the due ids and
    /// the earliest upcoming firing.
    fn take_due(&self, now: DateTime<Local>) -> (Vec<String>, Option<DateTime<Local>>) {
        self.with_dispatch(|table| {
            let mut due = Vec::new();
            let mut exhausted = Vec::new();
            for (id, entry) in table.iter_mut() {
                if entry.next > now {
                    continue;
                }
                due.push(id.clone());
                match entry.schedule.next_after(&now) {
                    Some(next) => entry.next = next,
                    None => exhausted.push(id.clone()),
                }
            }
            for id in exhausted {
                table.remove(&id);
            }
            let earliest = table.values().map(|e| e.next).min();
            (due, earliest)
        })
    }

    /// Run the dispatch loop until the handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let (due, earliest) = this.take_due(now);
                for id in due {
                    let task_scheduler = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = task_scheduler.fire(&id).await {
                            tracing::warn!(
                                instance_id = %task_scheduler.instance_id,
                                task_id = %id,
                                error = %e,
                                "scheduled task failed"
                            );
                        }
                    });
                }

                let wait = match earliest {
                    Some(t) => (t - now).to_std().unwrap_or(Duration::ZERO),
                    None => MAX_IDLE,
                }
                .min(MAX_IDLE);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = this.changed.notified() => {}
                }
            }
        })
    }
}

async fn read_tasks(path: &std::path::Path) -> Result<Vec<ScheduledTask>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::Io {
                context: format!("read {}", path.display()),
                source,
            });
        }
    };
    match serde_json::from_slice::<Vec<ScheduledTask>>(&raw) {
        Ok(tasks) => Ok(tasks),
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            tracing::warn!(path = %path.display(), error = %e, "unreadable tasks file; starting empty");
            tokio::fs::rename(path, &aside)
                .await
                .io_context(|| format!("move aside {}", path.display()))?;
            Ok(Vec::new())
        }
    }
}
