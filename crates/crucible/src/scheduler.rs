//! Per-task scheduler: the state machine that pilots a task from download to
//! terminal cleanup.
//!
//! Each task is owned by exactly one scheduler shard (`hash(task_id) %
//! shards`), so per-task events are totally ordered; shards run in parallel
//! across tasks. Transitions are a sum type the tick loop interprets
//! deterministically; every applied transition is CAS-written to the tasks
//! catalogue and appended to the task's event log.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crucible_types::{
    BuildOutcome, BuildRequest, BuildType, Failure, FailureKind, SeedRequest, TaskDelete,
    TaskRecord, TaskState, VulnDiscoveryRequest,
};

use crate::catalog;
use crate::context::Ctx;
use crate::events::{EventLog, TaskEventType};
use crate::gc;
use crate::queue::names;
use crate::weights::WeightAllocator;

const COMPONENT: &str = "scheduler";

/// Outcome of evaluating one task tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Advance(TaskState),
    Stay,
    Fail(FailureKind, String),
}

/// Which shard owns a task.
pub fn shard_for(task_id: &str, shards: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    task_id.hash(&mut hasher);
    hasher.finish() % shards.max(1)
}

#[derive(Debug, Serialize, Deserialize)]
struct ShardLock {
    pid: u32,
    hostname: String,
    acquired_at: chrono::DateTime<Utc>,
}

pub struct TaskScheduler<'a> {
    ctx: &'a Ctx,
}

impl<'a> TaskScheduler<'a> {
    pub fn new(ctx: &'a Ctx) -> Self {
        Self { ctx }
    }

    /// Tick every non-terminal task owned by `shard` (all tasks when None).
    pub fn tick_all(&self, shard: Option<u64>) -> Result<Vec<(String, TaskState)>> {
        let shards = self.ctx.config.limits.scheduler_shards;
        let mut out = Vec::new();
        for (_, record) in catalog::tasks(self.ctx.kv()).scan(&[])? {
            let task_id = record.task.task_id.clone();
            if record.state.is_terminal() {
                continue;
            }
            if let Some(shard) = shard {
                if shard_for(&task_id, shards) != shard {
                    continue;
                }
            }
            match self.tick(&task_id) {
                Ok(state) => out.push((task_id, state)),
                Err(failure) => {
                    warn!(task_id, kind = %failure.kind, message = failure.message, "tick failed");
                }
            }
        }
        Ok(out)
    }

    /// One tick of one task. Returns the (possibly unchanged) state.
    pub fn tick(&self, task_id: &str) -> Result<TaskState, Failure> {
        let record = catalog::tasks(self.ctx.kv())
            .get(&[task_id])
            .map_err(|e| transient(task_id, e))?
            .with_context(|| format!("no task record for {task_id}"))
            .map_err(|e| {
                Failure::new(FailureKind::Validation, COMPONENT, e.to_string()).for_task(task_id)
            })?;
        if record.state.is_terminal() {
            return Ok(record.state);
        }

        let now = Utc::now();
        let deadline = record.task.deadline;
        let hard_window = self.ctx.config.timers.hard_stop_window;

        // Hard stop: inside the last window no submission may start.
        if deadline - now
            <= chrono::Duration::from_std(hard_window).unwrap_or_else(|_| chrono::Duration::zero())
        {
            self.force_stop_entries(task_id)?;
        }

        // Cancellation and deadline expiry override the state machine.
        let expired = now
            >= deadline
                - chrono::Duration::from_std(hard_window)
                    .unwrap_or_else(|_| chrono::Duration::zero());
        if record.task.cancelled || self.ctx.task_cancel(task_id).is_cancelled() || expired {
            let transition = self.cancel_path(&record)?;
            return self.apply(&record, transition);
        }

        let transition = self.evaluate(&record)?;
        self.apply(&record, transition)
    }

    /// Evaluate the state machine for one live task.
    fn evaluate(&self, record: &TaskRecord) -> Result<Transition, Failure> {
        let task_id = &record.task.task_id;
        match record.state {
            TaskState::Pending => Ok(Transition::Advance(TaskState::Downloading)),

            TaskState::Downloading => {
                if record.counters.get("download_failed").copied().unwrap_or(0) > 0 {
                    return Ok(Transition::Fail(
                        FailureKind::Terminal,
                        "source download failed".to_string(),
                    ));
                }
                let downloaded = catalog::downloaded(self.ctx.kv())
                    .get(&[task_id])
                    .map_err(|e| transient(task_id, e))?;
                if downloaded.is_some() {
                    self.request_initial_builds(record)?;
                    Ok(Transition::Advance(TaskState::Ready))
                } else {
                    Ok(Transition::Stay)
                }
            }

            TaskState::Ready => {
                let builds = catalog::builds(self.ctx.kv())
                    .scan(&[task_id])
                    .map_err(|e| transient(task_id, e))?;
                let fuzzer_builds: Vec<_> = builds
                    .iter()
                    .filter(|(_, b)| b.build.build_type == BuildType::Fuzzer)
                    .collect();
                if fuzzer_builds
                    .iter()
                    .any(|(_, b)| b.outcome == BuildOutcome::Ok)
                {
                    self.start_fuzzing(record)?;
                    return Ok(Transition::Advance(TaskState::Fuzzing));
                }
                if !fuzzer_builds.is_empty()
                    && fuzzer_builds
                        .iter()
                        .all(|(_, b)| matches!(b.outcome, BuildOutcome::Errored { .. }))
                {
                    return Ok(Transition::Fail(
                        FailureKind::Terminal,
                        "every fuzzer build errored".to_string(),
                    ));
                }
                Ok(Transition::Stay)
            }

            TaskState::Fuzzing => {
                let vulns = catalog::vulnerabilities(self.ctx.kv())
                    .scan(&[])
                    .map_err(|e| transient(task_id, e))?;
                if vulns.iter().any(|(_, v)| &v.task_id == task_id) {
                    Ok(Transition::Advance(TaskState::Vulnerabilities))
                } else {
                    Ok(Transition::Stay)
                }
            }

            TaskState::Vulnerabilities => {
                let entries = self.task_entries(task_id)?;
                let pov_accepted = entries.iter().any(|entry| {
                    entry.crashes.iter().any(|c| {
                        c.competition_pov_id.is_some()
                            && c.status != crucible_types::SubmissionStatus::Errored
                    })
                });
                if pov_accepted {
                    Ok(Transition::Advance(TaskState::PatchWait))
                } else {
                    Ok(Transition::Stay)
                }
            }

            TaskState::PatchWait => {
                let entries = self.task_entries(task_id)?;
                if entries.iter().any(|e| !e.patches.is_empty()) {
                    Ok(Transition::Advance(TaskState::PatchBuild))
                } else {
                    Ok(Transition::Stay)
                }
            }

            TaskState::PatchBuild => {
                let entries = self.task_entries(task_id)?;
                let builds_done = entries.iter().any(|entry| {
                    entry
                        .patches
                        .get(entry.patch_idx)
                        .is_some_and(|p| !p.build_outputs.is_empty())
                });
                let stopped = !entries.is_empty() && entries.iter().all(|e| e.stop);
                if builds_done {
                    Ok(Transition::Advance(TaskState::PatchValidate))
                } else if stopped {
                    Ok(Transition::Advance(TaskState::Submitting))
                } else {
                    Ok(Transition::Stay)
                }
            }

            TaskState::PatchValidate => {
                let entries = self.task_entries(task_id)?;
                let validated = entries
                    .iter()
                    .any(|entry| entry.patches.iter().any(|p| p.pov_passed));
                let stopped = !entries.is_empty() && entries.iter().all(|e| e.stop);
                if validated || stopped {
                    Ok(Transition::Advance(TaskState::Submitting))
                } else {
                    Ok(Transition::Stay)
                }
            }

            TaskState::Submitting => {
                let entries = self.task_entries(task_id)?;
                let resolved = !entries.is_empty()
                    && entries.iter().all(|e| e.stop || e.all_terminal());
                if !resolved {
                    return Ok(Transition::Stay);
                }
                let succeeded = entries
                    .iter()
                    .any(|e| e.passed_pov().is_some() && e.passed_patch().is_some());
                if succeeded {
                    Ok(Transition::Advance(TaskState::Succeeded))
                } else {
                    Ok(Transition::Advance(TaskState::Failed))
                }
            }

            // Terminal states are filtered before evaluate.
            _ => Ok(Transition::Stay),
        }
    }

    /// Cancellation: stop all ledger entries, fan out `TaskDelete` once, and
    /// finish only when the fleets have acknowledged the purge.
    fn cancel_path(&self, record: &TaskRecord) -> Result<Transition, Failure> {
        let task_id = &record.task.task_id;
        self.force_stop_entries(task_id)?;
        self.ctx.cancel_task(task_id);

        let already_sent = record.counters.get("task_delete_sent").copied().unwrap_or(0) > 0;
        if !already_sent {
            self.ctx
                .queues()
                .push(names::TASK_DELETE, &TaskDelete {
                    task_id: Some(task_id.clone()),
                    all: false,
                })
                .map_err(|e| transient(task_id, e))?;
            self.bump_counter(task_id, "task_delete_sent")?;
            info!(task_id, "task delete fanned out");
        }

        if gc::acks_complete(self.ctx.kv(), task_id).map_err(|e| transient(task_id, e))? {
            Ok(Transition::Advance(TaskState::Cancelled))
        } else {
            Ok(Transition::Stay)
        }
    }

    /// Apply a transition: validate against the lifecycle DAG, CAS the task
    /// record, and append to the event log.
    fn apply(&self, record: &TaskRecord, transition: Transition) -> Result<TaskState, Failure> {
        let task_id = &record.task.task_id;
        let target = match transition {
            Transition::Stay => return Ok(record.state),
            Transition::Advance(state) => state,
            Transition::Fail(kind, message) => {
                warn!(task_id, kind = %kind, message, "task failed");
                TaskState::Errored
            }
        };

        if !record.state.may_transition(target) {
            return Err(Failure::new(
                FailureKind::Validation,
                COMPONENT,
                format!("illegal transition {:?} -> {:?}", record.state, target),
            )
            .for_task(task_id));
        }

        let from = record.state;
        catalog::tasks(self.ctx.kv())
            .update(&[task_id], |current| {
                Ok(current.map(|mut current| {
                    // Only move forward if nobody else already did.
                    if current.state == from && current.state.may_transition(target) {
                        current.state = target;
                        current.updated_at = Utc::now();
                    }
                    current
                }))
            })
            .map_err(|e| transient(task_id, e))?;

        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(task_id), task_id) {
            let _ = log.record(TaskEventType::StateChanged { from, to: target });
        }
        info!(task_id, ?from, to = ?target, "state transition");
        Ok(target)
    }

    /// Side effect of `download_ok`: request the fuzzer and coverage builds
    /// for every declared sanitizer. Idempotent; the builder dispatcher
    /// dedups by identity.
    fn request_initial_builds(&self, record: &TaskRecord) -> Result<(), Failure> {
        let task_id = &record.task.task_id;
        let apply_diff = record.task.task_type == crucible_types::TaskType::Delta;
        for sanitizer in declared_sanitizers(record) {
            for build_type in [BuildType::Fuzzer, BuildType::Coverage] {
                let request = BuildRequest {
                    build: crucible_types::BuildRef {
                        task_id: task_id.clone(),
                        build_type,
                        sanitizer: sanitizer.clone(),
                        internal_patch_id: None,
                    },
                    engine: self.ctx.config.builder.default_engine.clone(),
                    apply_diff,
                    patch: None,
                };
                self.ctx
                    .queues()
                    .push(names::BUILD_REQUEST, &request)
                    .map_err(|e| transient(task_id, e))?;
            }
        }
        // Delta tasks also get the pre-diff tracer build.
        if apply_diff {
            for sanitizer in declared_sanitizers(record) {
                let request = BuildRequest {
                    build: crucible_types::BuildRef {
                        task_id: task_id.clone(),
                        build_type: BuildType::TracerNoDiff,
                        sanitizer,
                        internal_patch_id: None,
                    },
                    engine: self.ctx.config.builder.default_engine.clone(),
                    apply_diff: false,
                    patch: None,
                };
                self.ctx
                    .queues()
                    .push(names::BUILD_REQUEST, &request)
                    .map_err(|e| transient(task_id, e))?;
            }
        }
        Ok(())
    }

    /// Side effect of `first_build_ok`: register harness weights and wake the
    /// seed and discovery fleets.
    fn start_fuzzing(&self, record: &TaskRecord) -> Result<(), Failure> {
        let task_id = &record.task.task_id;
        let harnesses = declared_harnesses(record);
        WeightAllocator::new(self.ctx.kv())
            .init_task(task_id, &harnesses)
            .map_err(|e| transient(task_id, e))?;

        for (package, harness) in &harnesses {
            self.ctx
                .queues()
                .push(names::SEED_INIT, &SeedRequest {
                    task_id: task_id.clone(),
                    package: package.clone(),
                    harness: harness.clone(),
                })
                .map_err(|e| transient(task_id, e))?;
            self.ctx
                .queues()
                .push(names::VULN_DISCOVERY, &VulnDiscoveryRequest {
                    task_id: task_id.clone(),
                    package: package.clone(),
                    harness: harness.clone(),
                })
                .map_err(|e| transient(task_id, e))?;
        }
        Ok(())
    }

    fn force_stop_entries(&self, task_id: &str) -> Result<(), Failure> {
        let submissions = catalog::submissions(self.ctx.kv());
        for (_, entry) in submissions.scan(&[]).map_err(|e| transient(task_id, e))? {
            if entry.task_id != task_id || entry.stop {
                continue;
            }
            let ipid = entry.internal_patch_id.clone();
            submissions
                .update(&[&ipid], |entry| {
                    Ok(entry.map(|mut entry| {
                        entry.stop = true;
                        entry
                    }))
                })
                .map_err(|e| transient(task_id, e))?;
        }
        Ok(())
    }

    fn task_entries(&self, task_id: &str) -> Result<Vec<crucible_types::SubmissionEntry>, Failure> {
        Ok(catalog::submissions(self.ctx.kv())
            .scan(&[])
            .map_err(|e| transient(task_id, e))?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.task_id == task_id)
            .collect())
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

/// Sanitizers declared in task metadata (`sanitizers = "address,undefined"`),
/// defaulting to address.
pub fn declared_sanitizers(record: &TaskRecord) -> Vec<String> {
    record
        .task
        .metadata
        .get("sanitizers")
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["address".to_string()])
}

/// Harnesses declared in task metadata
/// (`harnesses = "pkg/fuzz_a,pkg/fuzz_b"`), as (package, harness) pairs.
pub fn declared_harnesses(record: &TaskRecord) -> Vec<(String, String)> {
    record
        .task
        .metadata
        .get("harnesses")
        .map(|s| {
            s.split(',')
                .filter_map(|pair| {
                    let (package, harness) = pair.trim().split_once('/')?;
                    Some((package.to_string(), harness.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One scheduler shard: holds the shard lock and ticks its tasks.
pub struct SchedulerShard<'a> {
    ctx: &'a Ctx,
    shard: u64,
}

impl<'a> SchedulerShard<'a> {
    pub fn new(ctx: &'a Ctx, shard: u64) -> Self {
        Self { ctx, shard }
    }

    fn lock_key(&self) -> String {
        format!("scheduler_lock:{}", self.shard)
    }

    /// Claim the shard, taking over stale locks (3 missed ticks).
    pub fn try_acquire(&self) -> Result<bool> {
        let stale_after = self.ctx.config.timers.scheduler_tick * 3;
        let lock = ShardLock {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&lock)?;

        if self.ctx.kv().compare_and_swap(&self.lock_key(), None, Some(&bytes))? {
            return Ok(true);
        }
        let Some(current) = self.ctx.kv().get(&self.lock_key())? else {
            return Ok(false);
        };
        let holder: ShardLock = match serde_json::from_slice(&current) {
            Ok(holder) => holder,
            Err(_) => {
                // Corrupt lock record; replace it.
                return self
                    .ctx
                    .kv()
                    .compare_and_swap(&self.lock_key(), Some(&current), Some(&bytes));
            }
        };
        let same_owner =
            holder.pid == lock.pid && holder.hostname == lock.hostname;
        let age = (Utc::now() - holder.acquired_at).to_std().unwrap_or_default();
        if same_owner || age > stale_after {
            return self
                .ctx
                .kv()
                .compare_and_swap(&self.lock_key(), Some(&current), Some(&bytes));
        }
        Ok(false)
    }

    pub fn release(&self) -> Result<()> {
        self.ctx.kv().delete(&self.lock_key())
    }

    /// Drive the shard until shutdown: renew the lock, tick tasks, sleep.
    pub fn run(&self) -> Result<()> {
        let scheduler = TaskScheduler::new(self.ctx);
        while !self.ctx.shutdown().is_cancelled() {
            if self.try_acquire()? {
                scheduler.tick_all(Some(self.shard))?;
            }
            self.ctx
                .shutdown()
                .sleep(self.ctx.config.timers.scheduler_tick);
        }
        self.release()
    }
}

fn transient(task_id: &str, e: anyhow::Error) -> Failure {
    Failure::new(FailureKind::Transient, COMPONENT, e.to_string()).for_task(task_id)
}
