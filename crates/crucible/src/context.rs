//! Process-wide context: configuration, the KV handle, and cancellation.
//!
//! The context is constructed once at process start and passed by composition
//! into every component; there are no global singletons. Cancellation is
//! cooperative: every blocking loop polls its task token and the global
//! shutdown token between blocking calls.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};

use crate::config::CrucibleConfig;
use crate::kv::{FileKv, KvStore, MemoryKv};
use crate::queue::QueueFabric;

/// A cooperative cancellation token. Cheap to clone; cancellation is one-way.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep in short slices, returning early (false) if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        !self.is_cancelled()
    }
}

/// The explicit context object every component receives.
pub struct Ctx {
    pub config: CrucibleConfig,
    kv: Arc<dyn KvStore>,
    shutdown: CancelToken,
    task_cancels: Mutex<BTreeMap<String, CancelToken>>,
}

impl Ctx {
    /// Build a context from configuration, opening the KV backend named by
    /// `kv_endpoint` (`memory:` or `file:<path>`).
    pub fn initialize(config: CrucibleConfig) -> Result<Arc<Self>> {
        let kv: Arc<dyn KvStore> = match config.kv_endpoint.split_once(':') {
            Some(("memory", _)) => Arc::new(MemoryKv::new()),
            Some(("file", path)) if !path.is_empty() => Arc::new(
                FileKv::open(path).with_context(|| format!("failed to open kv at {path}"))?,
            ),
            _ => bail!("unsupported kv endpoint: {}", config.kv_endpoint),
        };
        Ok(Arc::new(Self {
            config,
            kv,
            shutdown: CancelToken::new(),
            task_cancels: Mutex::new(BTreeMap::new()),
        }))
    }

    /// Build a context over an existing store (tests, scenario suites).
    pub fn with_store(config: CrucibleConfig, kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            kv,
            shutdown: CancelToken::new(),
            task_cancels: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    pub fn queues(&self) -> QueueFabric<'_> {
        QueueFabric::with_visibility_timeout(self.kv.as_ref(), self.config.timers.visibility_timeout)
    }

    /// The global shutdown token, cancelled once on signal.
    pub fn shutdown(&self) -> &CancelToken {
        &self.shutdown
    }

    /// The cancellation token for one task; created on first use.
    pub fn task_cancel(&self, task_id: &str) -> CancelToken {
        self.task_cancels
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// Cancel all in-process work for a task.
    pub fn cancel_task(&self, task_id: &str) {
        self.task_cancel(task_id).cancel();
    }

    /// Cancel every task and the process.
    pub fn shutdown_all(&self) {
        for token in self.task_cancels.lock().unwrap().values() {
            token.cancel();
        }
        self.shutdown.cancel();
    }

    /// Whether work owned by `task_id` should stop.
    pub fn stopped(&self, task_id: &str) -> bool {
        self.shutdown.is_cancelled() || self.task_cancel(task_id).is_cancelled()
    }

    /// Consumer identity for queue reservations: hostname + pid.
    pub fn consumer_name(&self) -> String {
        format!(
            "{}-{}",
            gethostname::gethostname().to_string_lossy(),
            std::process::id()
        )
    }

    pub fn task_scratch(&self, task_id: &str) -> PathBuf {
        self.config.scratch_root.join(task_id)
    }

    pub fn blob_cache_dir(&self) -> PathBuf {
        self.config.scratch_root.join("blobs")
    }
}

/// Install the tracing subscriber from the configured log filter. Call once
/// per process, before any component starts.
pub fn init_logging(config: &CrucibleConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
