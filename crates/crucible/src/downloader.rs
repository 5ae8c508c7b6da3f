//! Downloader: fetches task sources, verifies digests, and publishes
//! `task_ready`.
//!
//! Downloads land in a content-addressed blob cache first, so a source shared
//! by concurrent tasks is fetched once. Placement into the task's scratch
//! tree is tmp + rename; a crashed downloader leaves no partial source dirs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crucible_retry::{RetryStrategyConfig, calculate_delay};
use crucible_types::{
    DownloadedSources, Failure, FailureKind, SourceDetail, Task, TaskDelete, TaskDownload,
    TaskReady, TaskRecord, TaskState,
};

use crate::catalog;
use crate::config::InboundAuthConfig;
use crate::context::Ctx;
use crate::events::{EventLog, TaskEventType};
use crate::queue::names;

const COMPONENT: &str = "downloader";

pub struct Downloader<'a> {
    ctx: &'a Ctx,
    http: Client,
    retry: RetryStrategyConfig,
}

impl<'a> Downloader<'a> {
    pub fn new(ctx: &'a Ctx) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("crucible/{}", env!("CARGO_PKG_VERSION")))
            .timeout(ctx.config.timers.download_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            ctx,
            http,
            retry: RetryStrategyConfig::download(),
        })
    }

    /// Override the download retry strategy (tests shrink the delays).
    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Process one `TaskDownload`. Validation problems surface as failures
    /// for the worker boundary to dead-letter; download exhaustion marks the
    /// task errored and emits `TaskDelete` here.
    pub fn handle(&self, download: &TaskDownload) -> Result<(), Failure> {
        let task = &download.task;
        let task_id = task.task_id.clone();

        if chrono::Utc::now() >= task.deadline {
            return Err(
                Failure::new(FailureKind::Validation, COMPONENT, "task deadline already passed")
                    .for_task(&task_id),
            );
        }
        task.validate_sources().map_err(|message| {
            Failure::new(FailureKind::Validation, COMPONENT, message).for_task(&task_id)
        })?;
        if let Some(auth) = &self.ctx.config.inbound_auth {
            verify_signature(task, auth).map_err(|message| {
                Failure::new(FailureKind::Validation, COMPONENT, message).for_task(&task_id)
            })?;
        }

        // Register the task; a redelivered message joins the existing record.
        let record = TaskRecord {
            task: task.clone(),
            state: TaskState::Pending,
            counters: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        catalog::tasks(self.ctx.kv())
            .insert_if_absent(&[&task_id], &record)
            .map_err(|e| transient(&task_id, e))?;

        let mut placed = Vec::new();
        for source in &task.sources {
            match self.fetch_source(task, source) {
                Ok(detail) => placed.push(detail),
                Err(failure) => {
                    if failure.kind == FailureKind::Validation {
                        return Err(failure);
                    }
                    warn!(task_id, error = %failure, "source download failed; deleting task");
                    self.mark_download_failed(&task_id)?;
                    return Ok(());
                }
            }
        }

        catalog::downloaded(self.ctx.kv())
            .put(
                &[&task_id],
                &DownloadedSources {
                    task_id: task_id.clone(),
                    sources: placed,
                },
            )
            .map_err(|e| transient(&task_id, e))?;

        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(&task_id), &task_id) {
            let _ = log.record(TaskEventType::SourcesReady);
        }
        self.ctx
            .queues()
            .push(names::TASK_READY, &TaskReady {
                task_id: task_id.clone(),
            })
            .map_err(|e| transient(&task_id, e))?;
        info!(task_id, "sources ready");
        Ok(())
    }

    /// Fetch one source through the blob cache and place it under
    /// `<scratch>/<task_id>/sources/<role>/`.
    fn fetch_source(&self, task: &Task, source: &SourceDetail) -> Result<SourceDetail, Failure> {
        let task_id = &task.task_id;
        let blob = self
            .fetch_blob(task_id, source)
            .map_err(|f| f.for_task(task_id))?;

        let dest_dir = self
            .ctx
            .task_scratch(task_id)
            .join("sources")
            .join(source.source_type.dir_name());
        place_blob(&blob, &source.url, &dest_dir).map_err(|e| transient(task_id, e))?;

        Ok(SourceDetail {
            local_path: Some(dest_dir),
            ..source.clone()
        })
    }

    /// Download into the content-addressed cache, deduplicating by sha256
    /// across tasks. Digest mismatch is a validation failure; transport
    /// errors retry with backoff, checking cancellation before each attempt.
    fn fetch_blob(&self, task_id: &str, source: &SourceDetail) -> Result<PathBuf, Failure> {
        let cache_dir = self.ctx.blob_cache_dir();
        let blob_path = cache_dir.join(&source.sha256);
        if blob_path.exists() {
            return Ok(blob_path);
        }
        fs::create_dir_all(&cache_dir)
            .context("failed to create blob cache")
            .map_err(|e| transient(task_id, e))?;

        let config = &self.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.ctx.stopped(task_id) || self.task_cancelled(task_id) {
                return Err(Failure::new(
                    FailureKind::Terminal,
                    COMPONENT,
                    "task cancelled during download",
                ));
            }

            match self.try_fetch(source, &cache_dir, &blob_path) {
                Ok(()) => return Ok(blob_path),
                Err(FetchError::DigestMismatch { actual }) => {
                    return Err(Failure::new(
                        FailureKind::Validation,
                        COMPONENT,
                        format!(
                            "sha256 mismatch for {}: expected {}, got {actual}",
                            source.url, source.sha256
                        ),
                    ));
                }
                Err(FetchError::Transport(e)) if attempt < config.max_attempts => {
                    warn!(
                        task_id,
                        url = source.url,
                        attempt,
                        error = %e,
                        "source fetch failed; retrying"
                    );
                    thread::sleep(calculate_delay(config, attempt));
                }
                Err(FetchError::Transport(e)) => {
                    return Err(Failure::new(
                        FailureKind::Transient,
                        COMPONENT,
                        format!("source fetch exhausted {} attempts: {e}", config.max_attempts),
                    ));
                }
            }
        }
    }

    fn try_fetch(
        &self,
        source: &SourceDetail,
        cache_dir: &Path,
        blob_path: &Path,
    ) -> Result<(), FetchError> {
        let response = self
            .http
            .get(&source.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::Transport(e.into()))?;
        let bytes = response
            .bytes()
            .map_err(|e| FetchError::Transport(e.into()))?;

        let actual = hex::encode(Sha256::digest(&bytes));
        if !actual.eq_ignore_ascii_case(&source.sha256) {
            return Err(FetchError::DigestMismatch { actual });
        }

        let tmp = cache_dir.join(format!("{}.tmp-{}", source.sha256, std::process::id()));
        (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&bytes)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp.display()))?;
            fs::rename(&tmp, blob_path)
                .with_context(|| format!("failed to rename into {}", blob_path.display()))?;
            Ok(())
        })()
        .map_err(FetchError::Transport)
    }

    fn task_cancelled(&self, task_id: &str) -> bool {
        catalog::tasks(self.ctx.kv())
            .get(&[task_id])
            .ok()
            .flatten()
            .is_some_and(|record| record.task.cancelled)
    }

    fn mark_download_failed(&self, task_id: &str) -> Result<(), Failure> {
        catalog::tasks(self.ctx.kv())
            .update(&[task_id], |record| {
                Ok(record.map(|mut record| {
                    *record.counters.entry("download_failed".to_string()).or_insert(0) += 1;
                    record.updated_at = chrono::Utc::now();
                    record
                }))
            })
            .map_err(|e| transient(task_id, e))?;
        self.ctx
            .queues()
            .push(names::TASK_DELETE, &TaskDelete {
                task_id: Some(task_id.to_string()),
                all: false,
            })
            .map_err(|e| transient(task_id, e))?;
        Ok(())
    }
}

enum FetchError {
    Transport(anyhow::Error),
    DigestMismatch { actual: String },
}

fn transient(task_id: &str, e: anyhow::Error) -> Failure {
    Failure::new(FailureKind::Transient, COMPONENT, e.to_string()).for_task(task_id)
}

/// Unpack or copy a cached blob into the destination directory. Tarballs are
/// unpacked; anything else is placed as a file named from the URL.
fn place_blob(blob: &Path, url: &str, dest_dir: &Path) -> Result<()> {
    if dest_dir.exists() {
        // Idempotent redelivery: the source is already placed.
        return Ok(());
    }
    let tmp_dir = dest_dir.with_extension(format!("tmp-{}", std::process::id()));
    fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("failed to create {}", tmp_dir.display()))?;

    let file_name = url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("source");
    if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
        let status = std::process::Command::new("tar")
            .arg("-xzf")
            .arg(blob)
            .arg("-C")
            .arg(&tmp_dir)
            .status()
            .context("failed to run tar")?;
        if !status.success() {
            anyhow::bail!("tar exited with {status} unpacking {url}");
        }
    } else {
        fs::copy(blob, tmp_dir.join(file_name))
            .with_context(|| format!("failed to copy blob into {}", tmp_dir.display()))?;
    }

    if let Some(parent) = dest_dir.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::rename(&tmp_dir, dest_dir)
        .with_context(|| format!("failed to rename into {}", dest_dir.display()))?;
    Ok(())
}

type HmacSha256 = Hmac<Sha256>;

/// Verify the preshared-key signature carried in task metadata. The MAC
/// covers `<task_id>.<deadline epoch ms>` keyed by the inbound key token.
pub fn verify_signature(task: &Task, auth: &InboundAuthConfig) -> Result<(), String> {
    let Some(signature) = task.metadata.get("signature") else {
        return Err("missing signature in task metadata".to_string());
    };
    let expected = sign_task(&task.task_id, task.deadline.timestamp_millis(), auth);
    if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err("task signature mismatch".to_string())
    }
}

/// Produce the signature the inbound API attaches to a task.
pub fn sign_task(task_id: &str, deadline_ms: i64, auth: &InboundAuthConfig) -> String {
    let mut mac = HmacSha256::new_from_slice(auth.key_token.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(format!("{task_id}.{deadline_ms}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use crucible_types::{SourceType, TaskType};
    use tempfile::tempdir;

    use crate::config::CrucibleConfig;
    use crate::kv::MemoryKv;

    use super::*;

    struct BlobServer {
        server: Arc<tiny_http::Server>,
        pub hits: Arc<AtomicUsize>,
        handle: Option<std::thread::JoinHandle<()>>,
    }

    impl BlobServer {
        fn start(body: &'static [u8]) -> (Self, String) {
            let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").expect("bind"));
            let url = format!("http://{}/blob.bin", server.server_addr());
            let hits = Arc::new(AtomicUsize::new(0));

            let thread_server = Arc::clone(&server);
            let thread_hits = Arc::clone(&hits);
            let handle = std::thread::spawn(move || {
                while let Ok(request) = thread_server.recv() {
                    thread_hits.fetch_add(1, Ordering::SeqCst);
                    let _ = request.respond(tiny_http::Response::from_data(body.to_vec()));
                }
            });

            (
                Self {
                    server,
                    hits,
                    handle: Some(handle),
                },
                url,
            )
        }
    }

    impl Drop for BlobServer {
        fn drop(&mut self) {
            self.server.unblock();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn test_ctx(scratch: &Path) -> Arc<Ctx> {
        let config = CrucibleConfig {
            scratch_root: scratch.to_path_buf(),
            ..CrucibleConfig::default()
        };
        Ctx::with_store(config, Arc::new(MemoryKv::new()))
    }

    fn task_with_sources(task_id: &str, sources: Vec<SourceDetail>) -> Task {
        Task {
            task_id: task_id.to_string(),
            task_type: TaskType::Full,
            project_name: "demo".to_string(),
            focus: None,
            deadline: Utc::now() + chrono::Duration::minutes(30),
            sources,
            metadata: BTreeMap::new(),
            cancelled: false,
        }
    }

    fn source_for(url: &str, body: &[u8], source_type: SourceType) -> SourceDetail {
        SourceDetail {
            source_type,
            url: url.to_string(),
            sha256: hex::encode(Sha256::digest(body)),
            local_path: None,
        }
    }

    #[test]
    fn happy_path_places_sources_and_publishes_ready() {
        const BODY: &[u8] = b"repo-bytes";
        let (server, url) = BlobServer::start(BODY);
        let td = tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());

        let task = task_with_sources(
            "t1",
            vec![
                source_for(&url, BODY, SourceType::Repo),
                source_for(&url, BODY, SourceType::FuzzTooling),
            ],
        );
        let downloader = Downloader::new(&ctx).expect("downloader");
        downloader
            .handle(&TaskDownload { task })
            .expect("download");

        // Same sha for both sources: the blob cache serves the second.
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        let placed = catalog::downloaded(ctx.kv())
            .get(&["t1"])
            .unwrap()
            .expect("downloaded index");
        assert_eq!(placed.sources.len(), 2);
        for source in &placed.sources {
            let dir = source.local_path.as_ref().expect("local path");
            assert!(dir.join("blob.bin").exists());
        }

        let ready = ctx
            .queues()
            .reserve(names::TASK_READY, "test", "c1", 1, std::time::Duration::ZERO)
            .unwrap();
        assert_eq!(ready.len(), 1);
        let record: TaskReady = ready[0].decode().unwrap();
        assert_eq!(record.task_id, "t1");

        assert!(
            catalog::tasks(ctx.kv()).get(&["t1"]).unwrap().is_some(),
            "task registered"
        );
    }

    #[test]
    fn blob_cache_dedups_across_tasks() {
        const BODY: &[u8] = b"shared-bytes";
        let (server, url) = BlobServer::start(BODY);
        let td = tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());
        let downloader = Downloader::new(&ctx).expect("downloader");

        for task_id in ["t1", "t2"] {
            let task = task_with_sources(
                task_id,
                vec![
                    source_for(&url, BODY, SourceType::Repo),
                    source_for(&url, BODY, SourceType::FuzzTooling),
                ],
            );
            downloader
                .handle(&TaskDownload { task })
                .expect("download");
        }

        assert_eq!(server.hits.load(Ordering::SeqCst), 1, "one fetch total");
    }

    #[test]
    fn digest_mismatch_is_a_validation_failure() {
        let (_server, url) = BlobServer::start(b"actual-bytes");
        let td = tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());

        let mut bad = source_for(&url, b"actual-bytes", SourceType::Repo);
        bad.sha256 = "00".repeat(32);
        let task = task_with_sources(
            "t1",
            vec![bad, source_for(&url, b"actual-bytes", SourceType::FuzzTooling)],
        );

        let failure = Downloader::new(&ctx)
            .expect("downloader")
            .handle(&TaskDownload { task })
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(failure.message.contains("sha256 mismatch"));
    }

    #[test]
    fn expired_deadline_is_rejected() {
        let td = tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());
        let mut task = task_with_sources("t1", vec![]);
        task.deadline = Utc::now() - chrono::Duration::minutes(1);

        let failure = Downloader::new(&ctx)
            .expect("downloader")
            .handle(&TaskDownload { task })
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Validation);
    }

    #[test]
    fn malformed_source_set_is_rejected() {
        let td = tempdir().expect("tempdir");
        let ctx = test_ctx(td.path());
        let task = task_with_sources("t1", vec![]);

        let failure = Downloader::new(&ctx)
            .expect("downloader")
            .handle(&TaskDownload { task })
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Validation);
    }

    #[test]
    fn unreachable_source_marks_task_failed_and_emits_delete() {
        let td = tempdir().expect("tempdir");
        let mut config = CrucibleConfig {
            scratch_root: td.path().to_path_buf(),
            ..CrucibleConfig::default()
        };
        config.timers.download_timeout = std::time::Duration::from_millis(300);
        let ctx = Ctx::with_store(config, Arc::new(MemoryKv::new()));

        let unreachable = SourceDetail {
            source_type: SourceType::Repo,
            url: "http://127.0.0.1:1/blob.bin".to_string(),
            sha256: "11".repeat(32),
            local_path: None,
        };
        let (_server, ok_url) = BlobServer::start(b"tooling");
        let task = task_with_sources(
            "t1",
            vec![
                unreachable,
                source_for(&ok_url, b"tooling", SourceType::FuzzTooling),
            ],
        );

        let fast_retry = RetryStrategyConfig {
            strategy: crucible_retry::RetryStrategyType::Constant,
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(10),
            max_delay: std::time::Duration::from_millis(10),
            jitter: 0.0,
        };
        Downloader::new(&ctx)
            .expect("downloader")
            .with_retry(fast_retry)
            .handle(&TaskDownload { task })
            .expect("handled terminally");

        let record = catalog::tasks(ctx.kv()).get(&["t1"]).unwrap().unwrap();
        assert_eq!(record.counters.get("download_failed"), Some(&1));

        let deletes = ctx
            .queues()
            .reserve(names::TASK_DELETE, "test", "c1", 1, std::time::Duration::ZERO)
            .unwrap();
        assert_eq!(deletes.len(), 1);
    }

    #[test]
    fn signature_round_trip_verifies() {
        let auth = InboundAuthConfig {
            key_id: "key".to_string(),
            key_token: "secret".to_string(),
        };
        let mut task = task_with_sources("t1", vec![]);
        let signature = sign_task(&task.task_id, task.deadline.timestamp_millis(), &auth);
        task.metadata.insert("signature".to_string(), signature);
        assert!(verify_signature(&task, &auth).is_ok());

        task.metadata
            .insert("signature".to_string(), "deadbeef".to_string());
        assert!(verify_signature(&task, &auth).is_err());

        task.metadata.remove("signature");
        assert!(verify_signature(&task, &auth).is_err());
    }
}
