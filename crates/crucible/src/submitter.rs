//! Submitter: the single writer to the external competition API.
//!
//! One logical actor per task, driven from the scheduler loop, with a
//! strictly serial send path. At-most-once external writes rest on two
//! mechanisms: a pre-write marker CAS-created in the KV store before any
//! POST (its client reference travels with the request, so a crashed
//! submitter can find an already-accepted artifact by reference instead of
//! re-POSTing), and the server id CAS-written into the ledger before the
//! next artifact is attempted. No POST is issued inside the hard window
//! before the task deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crucible_retry::{RetryStrategyConfig, calculate_delay, poll_delay};
use crucible_types::{
    Bundle, Failure, FailureKind, SubmissionEntry, SubmissionStatus,
};

use crate::api::{
    ApiError, BundleRequest, CompetitionClient, CreatedResponse, PatchSubmissionRequest,
    PovSubmissionRequest, SarifAssessmentRequest,
};
use crate::catalog;
use crate::context::Ctx;
use crate::events::{EventLog, TaskEventType};

const COMPONENT: &str = "submitter";

/// Pre-write marker: exists from just before the first POST attempt of an
/// artifact until the task is swept. Carries the client reference the server
/// can be queried by after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubmitMarker {
    reference: String,
    created_at: DateTime<Utc>,
}

fn marker_key(ipid: &str, artifact: &str) -> String {
    format!("submit_marker:{ipid}/{artifact}")
}

/// Leaky token bucket; one per task plus one global.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(per_sec: u32) -> Self {
        Self {
            capacity: per_sec as f64,
            tokens: per_sec as f64,
            refill_per_sec: per_sec as f64,
            last: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// In-memory poll schedule per (entry, artifact). Resets on restart, which
/// only makes the next poll earlier.
#[derive(Default)]
struct PollState {
    attempt: u32,
    next_at: Option<Instant>,
}

pub struct Submitter<'a> {
    ctx: &'a Ctx,
    client: CompetitionClient,
    retry: RetryStrategyConfig,
    task_buckets: Mutex<HashMap<String, TokenBucket>>,
    global_bucket: Mutex<TokenBucket>,
    polls: Mutex<HashMap<String, PollState>>,
}

impl<'a> Submitter<'a> {
    pub fn new(ctx: &'a Ctx) -> Result<Self> {
        Ok(Self {
            ctx,
            client: CompetitionClient::new(&ctx.config.external_api)?,
            retry: RetryStrategyConfig::external_api(),
            task_buckets: Mutex::new(HashMap::new()),
            global_bucket: Mutex::new(TokenBucket::new(
                ctx.config.limits.submitter_qps_global,
            )),
            polls: Mutex::new(HashMap::new()),
        })
    }

    /// Override the transport retry strategy (tests shrink the delays).
    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the hard window before `deadline` has begun: no POST may be
    /// issued and polling aborts.
    fn hard_stopped(&self, deadline: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.ctx.config.timers.hard_stop_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() >= deadline - window
    }

    /// One serial pass over a task's ledger: submit what is due, then poll
    /// what is in flight.
    pub fn tick_task(&self, task_id: &str) -> Result<(), Failure> {
        let Some(record) = catalog::tasks(self.ctx.kv())
            .get(&[task_id])
            .map_err(|e| transient(task_id, e))?
        else {
            return Ok(());
        };
        let deadline = record.task.deadline;

        let entries: Vec<SubmissionEntry> = catalog::submissions(self.ctx.kv())
            .scan(&[])
            .map_err(|e| transient(task_id, e))?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.task_id == task_id)
            .collect();

        for entry in entries {
            let ipid = entry.internal_patch_id.clone();
            if self.hard_stopped(deadline) {
                self.stop_entry(&ipid, "deadline hard stop")?;
                continue;
            }
            if !entry.stop {
                self.submit_due_povs(&entry, deadline)?;
                self.submit_due_patch(&ipid, deadline)?;
                self.submit_due_bundle(&ipid, deadline)?;
            }
            self.poll_entry(&ipid, deadline)?;
        }
        Ok(())
    }

    // -- PoVs ---------------------------------------------------------------

    fn submit_due_povs(&self, entry: &SubmissionEntry, deadline: DateTime<Utc>) -> Result<(), Failure> {
        let task_id = &entry.task_id;
        let ipid = &entry.internal_patch_id;
        for crash in &entry.crashes {
            if crash.competition_pov_id.is_some() || crash.status == SubmissionStatus::Errored {
                continue;
            }
            let artifact = format!("pov/{}", crash.crash_id);
            let reference = self
                .ensure_marker(ipid, &artifact)
                .map_err(|e| transient(task_id, e))?;

            // A marker can outlive a crashed submitter whose POST was
            // accepted; ask the server before POSTing again.
            let existing = self
                .client
                .find_pov_by_reference(task_id, &reference.reference)
                .map_err(|e| api_failure(task_id, e))?;
            let created = match existing {
                Some(found) => found,
                None => {
                    let testcase = self.read_testcase(task_id, &crash.crash_input)?;
                    let request = PovSubmissionRequest {
                        harness_name: crash.harness_name.clone(),
                        sanitizer: crash.sanitizer.clone(),
                        testcase,
                        reference_id: reference.reference.clone(),
                    };
                    match self.post_with_backoff(task_id, deadline, || {
                        self.client.submit_pov(task_id, &request)
                    })? {
                        PostOutcome::Created(created) => created,
                        PostOutcome::Rejected => {
                            self.mark_pov(ipid, &crash.crash_id, None, SubmissionStatus::Errored)?;
                            continue;
                        }
                        PostOutcome::Aborted => return Ok(()),
                    }
                }
            };

            info!(task_id, ipid, pov = created.id, "pov accepted");
            self.mark_pov(ipid, &crash.crash_id, Some(created.id.clone()), created.status)?;
            self.record_event(task_id, TaskEventType::PovSubmitted {
                internal_patch_id: ipid.clone(),
                competition_pov_id: created.id,
            });
            self.bump_counter(task_id, "povs_submitted")?;
        }
        Ok(())
    }

    fn mark_pov(
        &self,
        ipid: &str,
        crash_id: &str,
        competition_pov_id: Option<String>,
        status: SubmissionStatus,
    ) -> Result<(), Failure> {
        catalog::submissions(self.ctx.kv())
            .update(&[ipid], |entry| {
                Ok(entry.map(|mut entry| {
                    if let Some(crash) =
                        entry.crashes.iter_mut().find(|c| c.crash_id == crash_id)
                    {
                        if let Some(id) = &competition_pov_id {
                            crash.competition_pov_id = Some(id.clone());
                        }
                        crash.status = status;
                    }
                    entry
                }))
            })
            .map_err(|e| transient(ipid, e))?;
        Ok(())
    }

    // -- Patches ------------------------------------------------------------

    fn submit_due_patch(&self, ipid: &str, deadline: DateTime<Utc>) -> Result<(), Failure> {
        let Some(entry) = catalog::submissions(self.ctx.kv())
            .get(&[ipid])
            .map_err(|e| transient(ipid, e))?
        else {
            return Ok(());
        };
        let task_id = entry.task_id.clone();
        let patch_idx = entry.patch_idx;
        let Some(patch) = entry.patches.get(patch_idx) else {
            return Ok(());
        };
        if !patch.pov_passed
            || patch.competition_patch_id.is_some()
            || patch.status == SubmissionStatus::Errored
        {
            return Ok(());
        }
        // A patch is only worth submitting once a PoV is on file.
        if !entry
            .crashes
            .iter()
            .any(|c| c.competition_pov_id.is_some())
        {
            return Ok(());
        }

        let artifact = format!("patch/{patch_idx}");
        let reference = self
            .ensure_marker(ipid, &artifact)
            .map_err(|e| transient(&task_id, e))?;
        let existing = self
            .client
            .find_patch_by_reference(&task_id, &reference.reference)
            .map_err(|e| api_failure(&task_id, e))?;
        let created = match existing {
            Some(found) => found,
            None => {
                let request = PatchSubmissionRequest {
                    patch: patch.patch.clone(),
                    reference_id: reference.reference.clone(),
                };
                match self.post_with_backoff(&task_id, deadline, || {
                    self.client.submit_patch(&task_id, &request)
                })? {
                    PostOutcome::Created(created) => created,
                    PostOutcome::Rejected => {
                        self.mark_patch(ipid, patch_idx, None, SubmissionStatus::Errored)?;
                        return Ok(());
                    }
                    PostOutcome::Aborted => return Ok(()),
                }
            }
        };

        info!(task_id, ipid, patch = created.id, "patch accepted");
        self.mark_patch(ipid, patch_idx, Some(created.id.clone()), created.status)?;
        self.record_event(&task_id, TaskEventType::PatchSubmitted {
            internal_patch_id: ipid.to_string(),
            competition_patch_id: created.id,
        });
        self.bump_counter(&task_id, "patches_submitted")?;
        Ok(())
    }

    fn mark_patch(
        &self,
        ipid: &str,
        patch_idx: usize,
        competition_patch_id: Option<String>,
        status: SubmissionStatus,
    ) -> Result<(), Failure> {
        catalog::submissions(self.ctx.kv())
            .update(&[ipid], |entry| {
                Ok(entry.map(|mut entry| {
                    if let Some(patch) = entry.patches.get_mut(patch_idx) {
                        if let Some(id) = &competition_patch_id {
                            patch.competition_patch_id = Some(id.clone());
                        }
                        patch.status = status;
                    }
                    entry
                }))
            })
            .map_err(|e| transient(ipid, e))?;
        Ok(())
    }

    // -- Bundles ------------------------------------------------------------

    fn submit_due_bundle(&self, ipid: &str, deadline: DateTime<Utc>) -> Result<(), Failure> {
        let Some(entry) = catalog::submissions(self.ctx.kv())
            .get(&[ipid])
            .map_err(|e| transient(ipid, e))?
        else {
            return Ok(());
        };
        let task_id = entry.task_id.clone();
        if !entry.bundles.is_empty() {
            return Ok(());
        }
        let (Some(pov), Some(patch)) = (entry.passed_pov(), entry.passed_patch()) else {
            return Ok(());
        };
        let (Some(pov_id), Some(patch_id)) = (
            pov.competition_pov_id.clone(),
            patch.competition_patch_id.clone(),
        ) else {
            return Ok(());
        };

        // Same pre-write discipline as PoVs and patches: a crashed submitter
        // whose bundle POST was accepted recovers it by reference instead of
        // creating a second one.
        let reference = self
            .ensure_marker(ipid, "bundle/0")
            .map_err(|e| transient(&task_id, e))?;
        let existing = self
            .client
            .find_bundle_by_reference(&task_id, &reference.reference)
            .map_err(|e| api_failure(&task_id, e))?;
        let created = match existing {
            Some(found) => found,
            None => {
                let request = BundleRequest {
                    competition_pov_id: pov_id.clone(),
                    competition_patch_id: patch_id.clone(),
                    competition_sarif_id: None,
                    reference_id: Some(reference.reference.clone()),
                };
                match self.post_with_backoff(&task_id, deadline, || {
                    self.client.create_bundle(&task_id, &request)
                })? {
                    PostOutcome::Created(created) => created,
                    PostOutcome::Rejected | PostOutcome::Aborted => return Ok(()),
                }
            }
        };

        info!(task_id, ipid, bundle = created.id, "bundle created");
        catalog::submissions(self.ctx.kv())
            .update(&[ipid], |entry| {
                Ok(entry.map(|mut entry| {
                    if entry.bundles.is_empty() {
                        entry.bundles.push(Bundle {
                            bundle_id: Some(created.id.clone()),
                            competition_pov_id: pov_id.clone(),
                            competition_patch_id: patch_id.clone(),
                            competition_sarif_id: None,
                        });
                    }
                    entry
                }))
            })
            .map_err(|e| transient(&task_id, e))?;
        self.record_event(&task_id, TaskEventType::BundleSubmitted {
            internal_patch_id: ipid.to_string(),
            bundle_id: created.id,
        });
        Ok(())
    }

    /// Attach a SARIF assessment to an entry's bundle: submit the assessment,
    /// then PATCH the bundle with the SARIF id.
    pub fn attach_sarif(&self, ipid: &str, sarif_id: &str, assessment: &str) -> Result<(), Failure> {
        let Some(entry) = catalog::submissions(self.ctx.kv())
            .get(&[ipid])
            .map_err(|e| transient(ipid, e))?
        else {
            return Ok(());
        };
        let task_id = entry.task_id.clone();
        let Some(record) = catalog::tasks(self.ctx.kv())
            .get(&[&task_id])
            .map_err(|e| transient(&task_id, e))?
        else {
            return Ok(());
        };
        if self.hard_stopped(record.task.deadline) {
            return Ok(());
        }
        let Some(bundle) = entry.bundles.first() else {
            return Ok(());
        };
        let Some(bundle_id) = bundle.bundle_id.clone() else {
            return Ok(());
        };

        self.client
            .submit_sarif_assessment(&task_id, &SarifAssessmentRequest {
                sarif_id: sarif_id.to_string(),
                assessment: assessment.to_string(),
                description: format!("matches internal vulnerability {ipid}"),
            })
            .map_err(|e| api_failure(&task_id, e))?;

        let request = BundleRequest {
            competition_pov_id: bundle.competition_pov_id.clone(),
            competition_patch_id: bundle.competition_patch_id.clone(),
            competition_sarif_id: Some(sarif_id.to_string()),
            reference_id: None,
        };
        self.client
            .update_bundle(&task_id, &bundle_id, &request)
            .map_err(|e| api_failure(&task_id, e))?;

        catalog::submissions(self.ctx.kv())
            .update(&[ipid], |entry| {
                Ok(entry.map(|mut entry| {
                    if let Some(bundle) = entry.bundles.first_mut() {
                        bundle.competition_sarif_id = Some(sarif_id.to_string());
                    }
                    entry
                }))
            })
            .map_err(|e| transient(&task_id, e))?;
        Ok(())
    }

    // -- Polling ------------------------------------------------------------

    /// Poll non-terminal artifacts whose cadence is due: 2 s doubling to a
    /// 60 s cap, aborted inside the hard window.
    fn poll_entry(&self, ipid: &str, deadline: DateTime<Utc>) -> Result<(), Failure> {
        if self.hard_stopped(deadline) {
            return Ok(());
        }
        let Some(entry) = catalog::submissions(self.ctx.kv())
            .get(&[ipid])
            .map_err(|e| transient(ipid, e))?
        else {
            return Ok(());
        };
        let task_id = entry.task_id.clone();

        for crash in &entry.crashes {
            let Some(pov_id) = &crash.competition_pov_id else {
                continue;
            };
            if crash.status.is_terminal() || !self.poll_due(&format!("{ipid}/pov/{pov_id}")) {
                continue;
            }
            match self.client.pov_status(&task_id, pov_id) {
                Ok(status) => {
                    if status != crash.status {
                        self.mark_pov(ipid, &crash.crash_id, None, status)?;
                        self.record_event(&task_id, TaskEventType::GradingResult {
                            internal_patch_id: ipid.to_string(),
                            artifact: format!("pov/{pov_id}"),
                            status,
                        });
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(task_id, pov_id, error = %e, "pov poll failed; will retry")
                }
                Err(e) => return Err(api_failure(&task_id, e)),
            }
        }

        for (patch_idx, patch) in entry.patches.iter().enumerate() {
            let Some(patch_id) = &patch.competition_patch_id else {
                continue;
            };
            if patch.status.is_terminal() || !self.poll_due(&format!("{ipid}/patch/{patch_id}")) {
                continue;
            }
            match self.client.patch_status(&task_id, patch_id) {
                Ok(status) => {
                    if status != patch.status {
                        self.mark_patch(ipid, patch_idx, None, status)?;
                        self.record_event(&task_id, TaskEventType::GradingResult {
                            internal_patch_id: ipid.to_string(),
                            artifact: format!("patch/{patch_id}"),
                            status,
                        });
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(task_id, patch_id, error = %e, "patch poll failed; will retry")
                }
                Err(e) => return Err(api_failure(&task_id, e)),
            }
        }
        Ok(())
    }

    fn poll_due(&self, key: &str) -> bool {
        let mut polls = self.polls.lock().unwrap();
        let state = polls.entry(key.to_string()).or_default();
        match state.next_at {
            Some(at) if Instant::now() < at => false,
            _ => {
                state.attempt += 1;
                state.next_at = Some(Instant::now() + poll_delay(state.attempt));
                true
            }
        }
    }

    // -- Plumbing -----------------------------------------------------------

    /// Create (or load) the pre-write marker for an artifact. The CAS insert
    /// guarantees one reference per artifact across restarts.
    fn ensure_marker(&self, ipid: &str, artifact: &str) -> Result<SubmitMarker> {
        let key = marker_key(ipid, artifact);
        let fresh = SubmitMarker {
            reference: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&fresh)?;
        if self.ctx.kv().compare_and_swap(&key, None, Some(&bytes))? {
            return Ok(fresh);
        }
        let existing = self
            .ctx
            .kv()
            .get(&key)?
            .context("submit marker vanished after conflict")?;
        Ok(serde_json::from_slice(&existing)?)
    }

    fn read_testcase(&self, task_id: &str, path: &std::path::Path) -> Result<String, Failure> {
        use base64::Engine as _;
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read crash input {}", path.display()))
            .map_err(|e| transient(task_id, e))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// POST with rate limiting and full-jitter backoff on transient errors.
    fn post_with_backoff<F>(
        &self,
        task_id: &str,
        deadline: DateTime<Utc>,
        post: F,
    ) -> Result<PostOutcome, Failure>
    where
        F: Fn() -> Result<CreatedResponse, ApiError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.hard_stopped(deadline) || self.ctx.stopped(task_id) {
                return Ok(PostOutcome::Aborted);
            }
            self.take_tokens(task_id);

            match post() {
                Ok(created) => return Ok(PostOutcome::Created(created)),
                Err(e) if !e.is_retryable() => {
                    warn!(task_id, error = %e, "submission rejected");
                    return Ok(PostOutcome::Rejected);
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    warn!(task_id, attempt, error = %e, "submission failed; backing off");
                    self.ctx
                        .task_cancel(task_id)
                        .sleep(calculate_delay(&self.retry, attempt));
                }
                Err(e) => {
                    return Err(Failure::new(
                        FailureKind::Transient,
                        COMPONENT,
                        format!("submission exhausted {} attempts: {e}", self.retry.max_attempts),
                    )
                    .for_task(task_id));
                }
            }
        }
    }

    /// Block until both the per-task and global buckets yield a token.
    fn take_tokens(&self, task_id: &str) {
        loop {
            let task_ok = {
                let mut buckets = self.task_buckets.lock().unwrap();
                buckets
                    .entry(task_id.to_string())
                    .or_insert_with(|| TokenBucket::new(self.ctx.config.limits.submitter_qps_per_task))
                    .try_take()
            };
            let global_ok = task_ok && self.global_bucket.lock().unwrap().try_take();
            if task_ok && global_ok {
                return;
            }
            if !self
                .ctx
                .shutdown()
                .sleep(Duration::from_millis(25))
            {
                return;
            }
        }
    }

    fn stop_entry(&self, ipid: &str, reason: &str) -> Result<(), Failure> {
        let updated = catalog::submissions(self.ctx.kv())
            .update(&[ipid], |entry| {
                Ok(entry.map(|mut entry| {
                    entry.stop = true;
                    entry
                }))
            })
            .map_err(|e| transient(ipid, e))?;
        if let Some(entry) = updated {
            self.record_event(&entry.task_id, TaskEventType::SubmissionsStopped {
                internal_patch_id: ipid.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn record_event(&self, task_id: &str, event: TaskEventType) {
        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(task_id), task_id) {
            let _ = log.record(event);
        }
    }

    fn bump_counter(&self, task_id: &str, counter: &str) -> Result<(), Failure> {
        catalog::tasks(self.ctx.kv())
            .update(&[task_id], |record| {
                Ok(record.map(|mut record| {
                    *record.counters.entry(counter.to_string()).or_insert(0) += 1;
                    record.updated_at = Utc::now();
                    record
                }))
            })
            .map_err(|e| transient(task_id, e))?;
        Ok(())
    }
}

enum PostOutcome {
    Created(CreatedResponse),
    /// 4xx: terminal for this artifact.
    Rejected,
    /// Hard window or cancellation; nothing was sent.
    Aborted,
}

fn transient(scope: &str, e: anyhow::Error) -> Failure {
    Failure::new(FailureKind::Transient, COMPONENT, e.to_string()).for_task(scope)
}

fn api_failure(task_id: &str, e: ApiError) -> Failure {
    Failure::new(e.failure_kind(), COMPONENT, e.to_string()).for_task(task_id)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crucible_types::{
        CrashSubmission, PatchSubmission, Task, TaskRecord, TaskState, TaskType,
    };
    use tempfile::tempdir;

    use crate::config::{CrucibleConfig, ExternalApiConfig};
    use crate::kv::MemoryKv;

    use super::*;

    /// Scripted competition API: routes by method + path substring, counts
    /// POSTs, and answers 404 to by-reference lookups unless told otherwise.
    struct ScriptedApi {
        server: Arc<tiny_http::Server>,
        pub posts: Arc<AtomicUsize>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl ScriptedApi {
        fn start(known_reference: Option<String>) -> (Self, String) {
            let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").expect("bind"));
            let endpoint = format!("http://{}", server.server_addr());
            let posts = Arc::new(AtomicUsize::new(0));

            let thread_server = Arc::clone(&server);
            let thread_posts = Arc::clone(&posts);
            let handle = thread::spawn(move || {
                while let Ok(request) = thread_server.recv() {
                    let method = request.method().as_str().to_string();
                    let url = request.url().to_string();
                    let (status, body) = if url.contains("/by-reference/") {
                        match &known_reference {
                            Some(reference) if url.ends_with(reference.as_str()) => {
                                (200, r#"{"id":"recovered-1","status":"accepted"}"#.to_string())
                            }
                            _ => (404, "not found".to_string()),
                        }
                    } else if method == "POST" && url.contains("/pov") {
                        thread_posts.fetch_add(1, Ordering::SeqCst);
                        (200, r#"{"id":"pov-1","status":"accepted"}"#.to_string())
                    } else if method == "POST" && url.contains("/patch") {
                        thread_posts.fetch_add(1, Ordering::SeqCst);
                        (200, r#"{"id":"patch-1","status":"accepted"}"#.to_string())
                    } else if method == "POST" && url.contains("/bundle") {
                        thread_posts.fetch_add(1, Ordering::SeqCst);
                        (200, r#"{"id":"bundle-1","status":"accepted"}"#.to_string())
                    } else if method == "GET" {
                        (200, r#"{"status":"passed"}"#.to_string())
                    } else {
                        (500, "unexpected".to_string())
                    };
                    let response = tiny_http::Response::from_string(body)
                        .with_status_code(status)
                        .with_header(
                            tiny_http::Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"application/json"[..],
                            )
                            .unwrap(),
                        );
                    let _ = request.respond(response);
                }
            });

            (
                Self {
                    server,
                    posts,
                    handle: Some(handle),
                },
                endpoint,
            )
        }
    }

    impl Drop for ScriptedApi {
        fn drop(&mut self) {
            self.server.unblock();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn test_ctx(endpoint: &str, scratch: &std::path::Path) -> Arc<Ctx> {
        let config = CrucibleConfig {
            scratch_root: scratch.to_path_buf(),
            external_api: ExternalApiConfig {
                endpoint: endpoint.to_string(),
                key_id: "key".to_string(),
                key_token: "secret".to_string(),
            },
            ..CrucibleConfig::default()
        };
        Ctx::with_store(config, Arc::new(MemoryKv::new()))
    }

    fn seed_task(ctx: &Ctx, task_id: &str, minutes_left: i64) {
        let record = TaskRecord {
            task: Task {
                task_id: task_id.to_string(),
                task_type: TaskType::Full,
                project_name: "demo".to_string(),
                focus: None,
                deadline: Utc::now() + chrono::Duration::minutes(minutes_left),
                sources: vec![],
                metadata: BTreeMap::new(),
                cancelled: false,
            },
            state: TaskState::Submitting,
            counters: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        catalog::tasks(ctx.kv()).put(&[task_id], &record).unwrap();
    }

    fn seed_entry(ctx: &Ctx, scratch: &std::path::Path) -> SubmissionEntry {
        let input = scratch.join("crash-input");
        std::fs::write(&input, b"crash bytes").unwrap();
        let mut entry = SubmissionEntry::new("ipid-1".to_string(), "t1".to_string());
        entry.crashes.push(CrashSubmission {
            crash_id: "c1".to_string(),
            harness_name: "fuzz_http".to_string(),
            sanitizer: "address".to_string(),
            crash_input: input,
            competition_pov_id: None,
            status: SubmissionStatus::None,
        });
        catalog::submissions(ctx.kv()).put(&["ipid-1"], &entry).unwrap();
        entry
    }

    fn fast_retry() -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: crucible_retry::RetryStrategyType::Constant,
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[test]
    fn pov_is_posted_once_and_recorded() {
        let td = tempdir().expect("tempdir");
        let (api, endpoint) = ScriptedApi::start(None);
        let ctx = test_ctx(&endpoint, td.path());
        seed_task(&ctx, "t1", 60);
        seed_entry(&ctx, td.path());

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();

        let entry = catalog::submissions(ctx.kv()).get(&["ipid-1"]).unwrap().unwrap();
        assert_eq!(entry.crashes[0].competition_pov_id.as_deref(), Some("pov-1"));
        assert_eq!(api.posts.load(Ordering::SeqCst), 1);

        // Second tick: nothing new to POST.
        submitter.tick_task("t1").unwrap();
        assert_eq!(api.posts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_after_accepted_post_does_not_repost() {
        let td = tempdir().expect("tempdir");
        // A previous submitter wrote the marker and its POST was accepted,
        // but the ledger never saw the server id.
        let reference = "ref-crashed".to_string();
        let (api, endpoint) = ScriptedApi::start(Some(reference.clone()));
        let ctx = test_ctx(&endpoint, td.path());
        seed_task(&ctx, "t1", 60);
        seed_entry(&ctx, td.path());
        let marker = SubmitMarker {
            reference,
            created_at: Utc::now(),
        };
        ctx.kv()
            .put(
                &marker_key("ipid-1", "pov/c1"),
                &serde_json::to_vec(&marker).unwrap(),
            )
            .unwrap();

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();

        let entry = catalog::submissions(ctx.kv()).get(&["ipid-1"]).unwrap().unwrap();
        assert_eq!(
            entry.crashes[0].competition_pov_id.as_deref(),
            Some("recovered-1")
        );
        assert_eq!(api.posts.load(Ordering::SeqCst), 0, "no duplicate POST");
    }

    #[test]
    fn restart_after_bundle_post_does_not_repost() {
        let td = tempdir().expect("tempdir");
        // A previous submitter wrote the bundle marker and its POST was
        // accepted, but it died before the ledger update.
        let reference = "ref-bundle-crashed".to_string();
        let (api, endpoint) = ScriptedApi::start(Some(reference.clone()));
        let ctx = test_ctx(&endpoint, td.path());
        seed_task(&ctx, "t1", 60);
        let mut entry = seed_entry(&ctx, td.path());
        entry.crashes[0].competition_pov_id = Some("pov-1".to_string());
        entry.crashes[0].status = SubmissionStatus::Passed;
        entry.patches.push(PatchSubmission {
            patch: "--- fix".to_string(),
            competition_patch_id: Some("patch-1".to_string()),
            build_outputs: vec![],
            status: SubmissionStatus::Passed,
            pov_passed: true,
        });
        catalog::submissions(ctx.kv()).put(&["ipid-1"], &entry).unwrap();
        let marker = SubmitMarker {
            reference,
            created_at: Utc::now(),
        };
        ctx.kv()
            .put(
                &marker_key("ipid-1", "bundle/0"),
                &serde_json::to_vec(&marker).unwrap(),
            )
            .unwrap();

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();

        let entry = catalog::submissions(ctx.kv()).get(&["ipid-1"]).unwrap().unwrap();
        assert_eq!(entry.bundles.len(), 1);
        assert_eq!(entry.bundles[0].bundle_id.as_deref(), Some("recovered-1"));
        assert_eq!(api.posts.load(Ordering::SeqCst), 0, "no duplicate bundle POST");
    }

    #[test]
    fn no_post_inside_the_hard_window() {
        let td = tempdir().expect("tempdir");
        let (api, endpoint) = ScriptedApi::start(None);
        let ctx = test_ctx(&endpoint, td.path());
        // 30 seconds to deadline; hard window is one minute.
        seed_task(&ctx, "t1", 0);
        catalog::tasks(ctx.kv())
            .update(&["t1"], |record| {
                Ok(record.map(|mut record| {
                    record.task.deadline = Utc::now() + chrono::Duration::seconds(30);
                    record
                }))
            })
            .unwrap();
        seed_entry(&ctx, td.path());

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();

        assert_eq!(api.posts.load(Ordering::SeqCst), 0);
        let entry = catalog::submissions(ctx.kv()).get(&["ipid-1"]).unwrap().unwrap();
        assert!(entry.stop, "entry stopped at the hard window");
    }

    #[test]
    fn stopped_entries_submit_nothing() {
        let td = tempdir().expect("tempdir");
        let (api, endpoint) = ScriptedApi::start(None);
        let ctx = test_ctx(&endpoint, td.path());
        seed_task(&ctx, "t1", 60);
        seed_entry(&ctx, td.path());
        catalog::submissions(ctx.kv())
            .update(&["ipid-1"], |entry| {
                Ok(entry.map(|mut entry| {
                    entry.stop = true;
                    entry
                }))
            })
            .unwrap();

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();
        assert_eq!(api.posts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn passed_pov_and_patch_produce_one_bundle() {
        let td = tempdir().expect("tempdir");
        let (api, endpoint) = ScriptedApi::start(None);
        let ctx = test_ctx(&endpoint, td.path());
        seed_task(&ctx, "t1", 60);
        let mut entry = seed_entry(&ctx, td.path());
        entry.crashes[0].competition_pov_id = Some("pov-1".to_string());
        entry.crashes[0].status = SubmissionStatus::Passed;
        entry.patches.push(PatchSubmission {
            patch: "--- fix".to_string(),
            competition_patch_id: Some("patch-1".to_string()),
            build_outputs: vec![],
            status: SubmissionStatus::Passed,
            pov_passed: true,
        });
        catalog::submissions(ctx.kv()).put(&["ipid-1"], &entry).unwrap();

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();

        let entry = catalog::submissions(ctx.kv()).get(&["ipid-1"]).unwrap().unwrap();
        assert_eq!(entry.bundles.len(), 1);
        assert_eq!(entry.bundles[0].bundle_id.as_deref(), Some("bundle-1"));
        assert_eq!(api.posts.load(Ordering::SeqCst), 1, "only the bundle POST");

        // Ticking again does not create a second bundle.
        submitter.tick_task("t1").unwrap();
        assert_eq!(api.posts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn polling_updates_grading_status() {
        let td = tempdir().expect("tempdir");
        let (_api, endpoint) = ScriptedApi::start(None);
        let ctx = test_ctx(&endpoint, td.path());
        seed_task(&ctx, "t1", 60);
        let mut entry = seed_entry(&ctx, td.path());
        entry.crashes[0].competition_pov_id = Some("pov-1".to_string());
        entry.crashes[0].status = SubmissionStatus::Accepted;
        catalog::submissions(ctx.kv()).put(&["ipid-1"], &entry).unwrap();

        let submitter = Submitter::new(&ctx).unwrap().with_retry(fast_retry());
        submitter.tick_task("t1").unwrap();

        let entry = catalog::submissions(ctx.kv()).get(&["ipid-1"]).unwrap().unwrap();
        assert_eq!(entry.crashes[0].status, SubmissionStatus::Passed);
    }

    #[test]
    fn marker_reference_is_stable_across_calls() {
        let td = tempdir().expect("tempdir");
        let (_api, endpoint) = ScriptedApi::start(None);
        let ctx = test_ctx(&endpoint, td.path());
        let submitter = Submitter::new(&ctx).unwrap();

        let a = submitter.ensure_marker("ipid-1", "pov/c1").unwrap();
        let b = submitter.ensure_marker("ipid-1", "pov/c1").unwrap();
        assert_eq!(a.reference, b.reference);

        let other = submitter.ensure_marker("ipid-1", "pov/c2").unwrap();
        assert_ne!(a.reference, other.reference);
    }

    #[test]
    fn token_bucket_limits_burst_and_refills() {
        let mut bucket = TokenBucket::new(2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take(), "burst capacity exhausted");

        thread::sleep(Duration::from_millis(600));
        assert!(bucket.try_take(), "refilled after waiting");
    }
}
