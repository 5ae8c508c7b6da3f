//! Domain records and status enums for the crucible orchestration plane.
//!
//! Everything that crosses a queue or lives in a registry catalogue is
//! defined here, together with the failure taxonomy used at worker
//! boundaries. The wire framing for these records lives in [`frame`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod frame;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// Tasks and sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Whole-project analysis.
    Full,
    /// Analysis scoped to a diff against a base tree.
    Delta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// The project source tree. Exactly one per task.
    Repo,
    /// Fuzzing harness tooling. Exactly one per task.
    FuzzTooling,
    /// Diff for delta tasks. At most one per task.
    Diff,
}

impl SourceType {
    /// Directory name under `<scratch>/<task_id>/sources/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            SourceType::Repo => "repo",
            SourceType::FuzzTooling => "fuzz-tooling",
            SourceType::Diff => "diff",
        }
    }
}

/// One remote source of a task, verified by content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDetail {
    pub source_type: SourceType,
    /// Fetch URL.
    pub url: String,
    /// Hex sha256 the fetched bytes must hash to.
    pub sha256: String,
    /// Where the unpacked source landed, once downloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// A single analysis challenge: a project tree plus optional diff plus deadline.
///
/// Immutable after creation except `cancelled` may flip to true and `deadline`
/// may only be reduced externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: TaskType,
    pub project_name: String,
    /// Optional focus hint (a subdirectory or component name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    /// Hard deadline; no external submission may happen after it.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub deadline: DateTime<Utc>,
    pub sources: Vec<SourceDetail>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl Task {
    pub fn source(&self, source_type: SourceType) -> Option<&SourceDetail> {
        self.sources.iter().find(|s| s.source_type == source_type)
    }

    /// Structural validation of the source set: exactly one repo, exactly one
    /// fuzz-tooling, at most one diff, and a diff only on delta tasks.
    pub fn validate_sources(&self) -> Result<(), String> {
        let count = |t: SourceType| self.sources.iter().filter(|s| s.source_type == t).count();
        if count(SourceType::Repo) != 1 {
            return Err("task must carry exactly one repo source".to_string());
        }
        if count(SourceType::FuzzTooling) != 1 {
            return Err("task must carry exactly one fuzz-tooling source".to_string());
        }
        let diffs = count(SourceType::Diff);
        if diffs > 1 {
            return Err("task may carry at most one diff source".to_string());
        }
        if diffs == 1 && self.task_type != TaskType::Delta {
            return Err("diff source is only valid on delta tasks".to_string());
        }
        Ok(())
    }
}

/// The downloaded-source index for one task: every source verified and placed
/// on the shared filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedSources {
    pub task_id: String,
    pub sources: Vec<SourceDetail>,
}

/// Lifecycle states of a task. Transitions only move along the DAG encoded in
/// [`TaskState::may_transition`]; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Downloading,
    Ready,
    Fuzzing,
    Vulnerabilities,
    PatchWait,
    PatchBuild,
    PatchValidate,
    Submitting,
    Succeeded,
    Failed,
    Errored,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Errored | TaskState::Cancelled
        )
    }

    /// Whether a transition from `self` to `to` follows the lifecycle DAG.
    ///
    /// Every state may fall to `Errored` or `Cancelled`; terminal states admit
    /// nothing. The patch loop states are mutually reachable.
    pub fn may_transition(&self, to: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Errored | Cancelled) {
            return true;
        }
        match (self, to) {
            (Pending, Downloading) => true,
            (Downloading, Ready) => true,
            (Downloading, Failed) => true,
            (Ready, Fuzzing) => true,
            (Fuzzing, Vulnerabilities) => true,
            (Vulnerabilities, Fuzzing) => true,
            (Vulnerabilities, PatchWait) => true,
            (PatchWait, PatchBuild) => true,
            (PatchWait, Fuzzing) => true,
            (PatchBuild, PatchValidate) => true,
            (PatchBuild, PatchWait) => true,
            // Every candidate's build can fail before a validation round
            // ever runs; a stopped entry resolves straight from PatchBuild.
            (PatchBuild, Submitting) => true,
            (PatchValidate, PatchWait) => true,
            (PatchValidate, Submitting) => true,
            (Submitting, Succeeded) => true,
            (Submitting, Failed) => true,
            _ => false,
        }
    }
}

/// The catalogued form of a task: the immutable task plus live lifecycle state
/// and observability counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub state: TaskState,
    /// Monotone counters for the status surface (crashes_seen, povs_passed, ...).
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    /// Instrumented build the fuzzer fleet runs.
    Fuzzer,
    /// Coverage-instrumented build.
    Coverage,
    /// Build with a candidate patch applied.
    Patch,
    /// Pre-diff tree build for delta tasks (differential analysis).
    TracerNoDiff,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Fuzzer => "fuzzer",
            BuildType::Coverage => "coverage",
            BuildType::Patch => "patch",
            BuildType::TracerNoDiff => "tracer_no_diff",
        }
    }
}

/// Identity of a build: the catalogue key components for one build output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildRef {
    pub task_id: String,
    pub build_type: BuildType,
    pub sanitizer: String,
    /// Present only for `patch` builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_patch_id: Option<String>,
}

impl BuildRef {
    /// Artifact directory name under `<scratch>/<task_id>/`.
    pub fn artifact_dir(&self) -> String {
        match &self.internal_patch_id {
            Some(ipid) => format!("build-{}-{}-{}", self.build_type.as_str(), self.sanitizer, ipid),
            None => format!("build-{}-{}", self.build_type.as_str(), self.sanitizer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Build in flight; the record is a dispatcher placeholder.
    Pending,
    Ok,
    Errored { message: String },
}

/// A finished (or failed, or in-flight) build, keyed by its [`BuildRef`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub build: BuildRef,
    /// Fuzzing engine the build targets (e.g. libfuzzer).
    pub engine: String,
    /// Artifact directory on the shared filesystem.
    pub task_dir: PathBuf,
    /// Whether the task diff was applied before building.
    pub apply_diff: bool,
    pub outcome: BuildOutcome,
    /// When the dispatcher claimed this identity; stale pending placeholders
    /// are taken over after the build timeout.
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Harness weights
// ---------------------------------------------------------------------------

/// Scheduling weight for one fuzzing harness. Zero suspends scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedHarness {
    pub task_id: String,
    pub package: String,
    pub harness: String,
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// Crashes and vulnerabilities
// ---------------------------------------------------------------------------

/// A crash as reported by a fuzzer worker, before dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCrash {
    pub task_id: String,
    /// The build the crash was observed on.
    pub target: BuildRef,
    pub harness_name: String,
    /// Path of the crashing input on the shared filesystem.
    pub crash_input: PathBuf,
    pub stacktrace: String,
}

/// A deduplicated crash. Uniqueness is enforced within (task_id, crash_token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crash {
    pub crash_id: String,
    pub task_id: String,
    pub target: BuildRef,
    pub harness_name: String,
    pub crash_input: PathBuf,
    pub stacktrace: String,
    /// Deterministic fingerprint of the normalised stacktrace.
    pub crash_token: String,
}

/// A crash that reproduced under the tracer build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedCrash {
    pub crash: Crash,
    pub tracer_stacktrace: String,
}

/// A group of crashes sharing a root cause, paired with patch attempts under
/// one `internal_patch_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedVulnerability {
    pub internal_patch_id: String,
    pub task_id: String,
    /// At least one, except for SARIF-only entries awaiting a crash.
    pub crashes: Vec<TracedCrash>,
    /// Patch worker currently assigned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
}

pub fn new_internal_patch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_crash_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Submissions
// ---------------------------------------------------------------------------

/// Grading status reported by the competition API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Accepted,
    Passed,
    Failed,
    Errored,
    Inconclusive,
    DeadlineExceeded,
    #[default]
    None,
}

impl SubmissionStatus {
    /// A terminal status will never change on further polling.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Accepted | SubmissionStatus::None)
    }
}

/// One PoV submission within a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashSubmission {
    pub crash_id: String,
    pub harness_name: String,
    pub sanitizer: String,
    pub crash_input: PathBuf,
    /// Server-minted id; present once the first POST succeeded. A present id
    /// with `status == None` is a pre-write marker awaiting its first poll.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competition_pov_id: Option<String>,
    #[serde(default)]
    pub status: SubmissionStatus,
}

/// One patch submission within a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSubmission {
    /// Unified-diff patch text.
    pub patch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competition_patch_id: Option<String>,
    /// Patch builds produced while validating this patch.
    #[serde(default)]
    pub build_outputs: Vec<BuildRef>,
    #[serde(default)]
    pub status: SubmissionStatus,
    /// Set once PoV reproduction passed against every patch build.
    #[serde(default)]
    pub pov_passed: bool,
}

/// A grouping the competition API maintains linking a PoV, a patch, and
/// optional SARIF evidence. `bundle_id` is minted by the server on first POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub competition_pov_id: String,
    pub competition_patch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competition_sarif_id: Option<String>,
}

/// The submission ledger for one `internal_patch_id`. Owned by the submitter;
/// at most one in-flight competition submission per entry at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEntry {
    pub internal_patch_id: String,
    pub task_id: String,
    pub crashes: Vec<CrashSubmission>,
    pub patches: Vec<PatchSubmission>,
    #[serde(default)]
    pub bundles: Vec<Bundle>,
    /// Index of the patch currently under validation; monotone.
    #[serde(default)]
    pub patch_idx: usize,
    /// How many times a fresh patch has been requested after exhaustion.
    #[serde(default)]
    pub patch_submission_attempts: u32,
    /// Once set, no new submissions are issued for this entry.
    #[serde(default)]
    pub stop: bool,
}

impl SubmissionEntry {
    pub fn new(internal_patch_id: String, task_id: String) -> Self {
        Self {
            internal_patch_id,
            task_id,
            crashes: Vec::new(),
            patches: Vec::new(),
            bundles: Vec::new(),
            patch_idx: 0,
            patch_submission_attempts: 0,
            stop: false,
        }
    }

    pub fn passed_pov(&self) -> Option<&CrashSubmission> {
        self.crashes
            .iter()
            .find(|c| c.status == SubmissionStatus::Passed)
    }

    pub fn passed_patch(&self) -> Option<&PatchSubmission> {
        self.patches
            .iter()
            .find(|p| p.status == SubmissionStatus::Passed)
    }

    /// All submissions have reached a terminal grading status.
    pub fn all_terminal(&self) -> bool {
        self.crashes.iter().all(|c| c.status.is_terminal())
            && self.patches.iter().all(|p| p.status.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Queue payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDownload {
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReady {
    pub task_id: String,
}

/// Broadcast cancellation. `all` wipes every live task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDelete {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub build: BuildRef,
    pub engine: String,
    #[serde(default)]
    pub apply_diff: bool,
    /// Patch text for `patch` builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRequest {
    pub internal_patch_id: String,
    pub task_id: String,
    /// 1-based attempt counter across re-requests.
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchResult {
    pub internal_patch_id: String,
    pub task_id: String,
    pub patch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PovReproduceRequest {
    pub task_id: String,
    pub internal_patch_id: String,
    /// Build to reproduce against (patched or base).
    pub build: BuildRef,
    pub crash_id: String,
    pub harness_name: String,
    pub crash_input: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PovReproduceResponse {
    pub request: PovReproduceRequest,
    /// Whether the input crashed the referenced build.
    pub did_crash: bool,
}

/// Work order for the seed-generation fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRequest {
    pub task_id: String,
    pub package: String,
    pub harness: String,
}

/// Work order for the LLM vulnerability-discovery fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnDiscoveryRequest {
    pub task_id: String,
    pub package: String,
    pub harness: String,
}

/// Reason a record was dropped to the dead-letter queue. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MalformedFrame,
    UnknownVariant,
    MissingField,
    DigestMismatch,
    InvalidRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_queue: String,
    pub reason: DeadLetterReason,
    pub detail: String,
    /// The offending frame, kept verbatim for forensics.
    pub frame: Vec<u8>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// The five failure kinds every worker translates errors into at its queue
/// boundary. Nothing else escapes a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// KV unreachable, reservation lost, network blip. Retried with backoff.
    Transient,
    /// Malformed record, missing field, digest mismatch. Dead-lettered.
    Validation,
    /// Scratch full, build OOM, persistent high-water. Back-pressure + alert.
    Exhaustion,
    /// Cancelled, deadline passed, attempts exhausted. Terminal, no retry.
    Terminal,
    /// Competition API error; 4xx terminal, 5xx transient, per sub-rule.
    ExternalApi,
}

impl FailureKind {
    /// Soft failures pause and retry; hard failures terminate the work item.
    pub fn is_soft(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Exhaustion)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Validation => "validation",
            FailureKind::Exhaustion => "exhaustion",
            FailureKind::Terminal => "terminal",
            FailureKind::ExternalApi => "external_api",
        };
        f.write_str(s)
    }
}

/// A classified failure, carrying enough context for the boundary log line.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind} failure in {component}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, component: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            component: component.to_string(),
            task_id: None,
            message: message.into(),
        }
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}
