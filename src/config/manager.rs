//! Job manager and worker pool configuration structures.

use serde::{Deserialize, Serialize};

use crate::core::QueuePosition;

/// Worker pool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolKind {
    /// One named thread per round.
    #[default]
    OnDemand,
    /// Fixed set of dedicated threads.
    Fixed,
    /// Tokio's blocking thread pool (feature `tokio-runtime`).
    Tokio,
}

impl std::str::FromStr for WorkerPoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_demand" | "on-demand" => Ok(Self::OnDemand),
            "fixed" => Ok(Self::Fixed),
            "tokio" => Ok(Self::Tokio),
            other => Err(format!("unknown worker pool kind `{other}`")),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Which pool to build.
    pub kind: WorkerPoolKind,
    /// Worker threads of a fixed pool.
    pub worker_count: usize,
    /// Queued rounds a fixed pool accepts before rejecting.
    pub max_queue_depth: usize,
    /// Stack size in bytes for threads the pool spawns.
    pub thread_stack_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            kind: WorkerPoolKind::OnDemand,
            worker_count: num_cpus::get(),
            max_queue_depth: 1024,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl WorkerPoolConfig {
    /// Defaults: on-demand pool, one worker per CPU for fixed pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: WorkerPoolKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, thread_stack_size: usize) -> Self {
        self.thread_stack_size = thread_stack_size;
        self
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Root job manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Worker pool the manager dispatches rounds to.
    pub worker_pool: WorkerPoolConfig,
    /// Queue position for submissions that do not choose one.
    pub default_queue_position: QueuePosition,
    /// Prefix for worker and timer thread names.
    pub thread_name_prefix: String,
    /// How long `shutdown` waits for running tasks to finish.
    pub shutdown_timeout_ms: u64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::default(),
            default_queue_position: QueuePosition::Tail,
            thread_name_prefix: "job".into(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl JobManagerConfig {
    /// Validate the manager and its worker pool configuration.
    ///
    /// # Errors
    ///
    /// A message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        if self.shutdown_timeout_ms == 0 {
            return Err("shutdown_timeout_ms must be greater than 0".into());
        }
        self.worker_pool
            .validate()
            .map_err(|e| format!("worker_pool invalid: {e}"))
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `JOB_MANAGER_*` environment variables, after
    /// loading a `.env` file if one exists.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `JOB_MANAGER_WORKER_POOL` | `worker_pool.kind` (`on_demand`, `fixed`, `tokio`) |
    /// | `JOB_MANAGER_WORKER_COUNT` | `worker_pool.worker_count` |
    /// | `JOB_MANAGER_MAX_QUEUE_DEPTH` | `worker_pool.max_queue_depth` |
    /// | `JOB_MANAGER_THREAD_STACK_SIZE` | `worker_pool.thread_stack_size` |
    /// | `JOB_MANAGER_QUEUE_POSITION` | `default_queue_position` (`head`, `tail`) |
    /// | `JOB_MANAGER_THREAD_NAME_PREFIX` | `thread_name_prefix` |
    /// | `JOB_MANAGER_SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout_ms` |
    ///
    /// # Errors
    ///
    /// Unparsable values or validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`JobManagerConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Unparsable values or validation failure.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(kind) = lookup("JOB_MANAGER_WORKER_POOL") {
            cfg.worker_pool.kind = kind.parse()?;
        }
        if let Some(count) = parse_var(&lookup, "JOB_MANAGER_WORKER_COUNT")? {
            cfg.worker_pool.worker_count = count;
        }
        if let Some(depth) = parse_var(&lookup, "JOB_MANAGER_MAX_QUEUE_DEPTH")? {
            cfg.worker_pool.max_queue_depth = depth;
        }
        if let Some(size) = parse_var(&lookup, "JOB_MANAGER_THREAD_STACK_SIZE")? {
            cfg.worker_pool.thread_stack_size = size;
        }
        if let Some(position) = lookup("JOB_MANAGER_QUEUE_POSITION") {
            cfg.default_queue_position = match position.trim().to_ascii_lowercase().as_str() {
                "head" => QueuePosition::Head,
                "tail" => QueuePosition::Tail,
                other => return Err(format!("unknown queue position `{other}`")),
            };
        }
        if let Some(prefix) = lookup("JOB_MANAGER_THREAD_NAME_PREFIX") {
            cfg.thread_name_prefix = prefix;
        }
        if let Some(timeout) = parse_var(&lookup, "JOB_MANAGER_SHUTDOWN_TIMEOUT_MS")? {
            cfg.shutdown_timeout_ms = timeout;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| format!("{key}: {e}")))
        .transpose()
}
