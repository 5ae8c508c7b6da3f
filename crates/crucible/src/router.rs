//! Patch-request router: pairs confirmed vulnerabilities with patch workers
//! and drives each candidate patch through build and PoV reproduction.
//!
//! A patch passes only if every original crash input stops crashing under
//! every patched build while still crashing under the unpatched build (a
//! patched build that "fixes" a crash the base build cannot reproduce is a
//! sanitizer blind spot, not a fix). Failures advance `patch_idx`; exhausted
//! patch lists are re-requested up to the attempt bound, then stopped.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crucible_types::{
    BuildOutcome, BuildOutput, BuildRequest, BuildType, ConfirmedVulnerability, Failure,
    FailureKind, PatchRequest, PatchResult, PatchSubmission, PovReproduceRequest,
    PovReproduceResponse, SubmissionEntry,
};

use crate::catalog;
use crate::context::Ctx;
use crate::events::{EventLog, TaskEventType};
use crate::queue::names;

const COMPONENT: &str = "patch-router";

/// Re-request bound: a vulnerability gets at most this many fresh patch
/// lists before its entry is stopped.
pub const MAX_PATCH_ATTEMPTS: u32 = 3;

/// Progress of one (internal_patch_id, patch_idx) PoV reproduction round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReproduceRound {
    expected: usize,
    seen: usize,
    /// Crashes that still fired under a patched build.
    patched_crashes: usize,
    /// Crashes the unpatched build failed to reproduce.
    base_misses: usize,
}

impl ReproduceRound {
    fn complete(&self) -> bool {
        self.seen >= self.expected
    }

    fn passed(&self) -> bool {
        self.complete() && self.patched_crashes == 0 && self.base_misses == 0
    }
}

/// Whether the scheduler has frozen new patch requests for this deadline.
pub fn patching_frozen(deadline: chrono::DateTime<Utc>, freeze_window: std::time::Duration) -> bool {
    let remaining = deadline - Utc::now();
    remaining.to_std().map(|r| r < freeze_window).unwrap_or(true)
}

pub struct PatchRouter<'a> {
    ctx: &'a Ctx,
}

impl<'a> PatchRouter<'a> {
    pub fn new(ctx: &'a Ctx) -> Self {
        Self { ctx }
    }

    /// A vulnerability arrived (fuzzer-found or SARIF-fed): open its ledger
    /// entry and request the first patch.
    pub fn handle_confirmed(&self, vuln: &ConfirmedVulnerability) -> Result<(), Failure> {
        let task_id = vuln.task_id.clone();
        let ipid = vuln.internal_patch_id.clone();

        let entry = SubmissionEntry {
            crashes: vuln
                .crashes
                .iter()
                .map(|traced| crucible_types::CrashSubmission {
                    crash_id: traced.crash.crash_id.clone(),
                    harness_name: traced.crash.harness_name.clone(),
                    sanitizer: traced.crash.target.sanitizer.clone(),
                    crash_input: traced.crash.crash_input.clone(),
                    competition_pov_id: None,
                    status: Default::default(),
                })
                .collect(),
            ..SubmissionEntry::new(ipid.clone(), task_id.clone())
        };
        let inserted = catalog::submissions(self.ctx.kv())
            .insert_if_absent(&[&ipid], &entry)
            .map_err(|e| transient(&task_id, e))?;
        if !inserted {
            // Redelivery: the entry (and its first request) already exist.
            return Ok(());
        }

        self.request_patch(&task_id, &ipid, 1)
    }

    /// A patch came back from the patcher fleet: append it to the ledger and
    /// build it against every sanitizer the task fuzzes with.
    pub fn handle_patch_result(&self, result: &PatchResult) -> Result<(), Failure> {
        let task_id = result.task_id.clone();
        let ipid = result.internal_patch_id.clone();

        let entry = catalog::submissions(self.ctx.kv())
            .update(&[&ipid], |entry| {
                let mut entry = entry
                    .with_context(|| format!("patch result for unknown entry {ipid}"))?;
                let known = entry.patches.iter().any(|p| p.patch == result.patch);
                if !known {
                    entry.patches.push(PatchSubmission {
                        patch: result.patch.clone(),
                        competition_patch_id: None,
                        build_outputs: Vec::new(),
                        status: Default::default(),
                        pov_passed: false,
                    });
                }
                Ok(Some(entry))
            })
            .map_err(|e| validation_or_transient(&task_id, e))?
            .context("submission entry vanished")
            .map_err(|e| transient(&task_id, e))?;

        if entry.stop {
            return Ok(());
        }

        let sanitizers = self.task_sanitizers(&task_id)?;
        let patch_idx = entry.patches.len() - 1;
        for sanitizer in &sanitizers {
            let request = BuildRequest {
                build: crucible_types::BuildRef {
                    task_id: task_id.clone(),
                    build_type: BuildType::Patch,
                    sanitizer: sanitizer.clone(),
                    internal_patch_id: Some(ipid.clone()),
                },
                engine: self.ctx.config.builder.default_engine.clone(),
                apply_diff: false,
                patch: Some(result.patch.clone()),
            };
            self.ctx
                .queues()
                .push(names::BUILD_REQUEST, &request)
                .map_err(|e| transient(&task_id, e))?;
        }
        info!(
            task_id,
            ipid,
            patch_idx,
            sanitizers = sanitizers.len(),
            "patch received; builds dispatched"
        );
        Ok(())
    }

    /// A patch build finished. Once every sanitizer's patch build is in,
    /// dispatch the PoV reproduction round.
    pub fn handle_build_output(&self, output: &BuildOutput) -> Result<(), Failure> {
        if output.build.build_type != BuildType::Patch {
            return Ok(());
        }
        let task_id = output.build.task_id.clone();
        let Some(ipid) = output.build.internal_patch_id.clone() else {
            return Err(Failure::new(
                FailureKind::Validation,
                COMPONENT,
                "patch build output without internal_patch_id",
            )
            .for_task(&task_id));
        };

        if let BuildOutcome::Errored { message } = &output.outcome {
            warn!(task_id, ipid, message, "patch build failed; advancing patch");
            return self.fail_current_patch(&task_id, &ipid);
        }

        let expected = self.task_sanitizers(&task_id)?;
        let entry = catalog::submissions(self.ctx.kv())
            .update(&[&ipid], |entry| {
                let mut entry =
                    entry.with_context(|| format!("build output for unknown entry {ipid}"))?;
                let patch_idx = entry.patch_idx;
                if let Some(patch) = entry.patches.get_mut(patch_idx) {
                    if !patch.build_outputs.iter().any(|b| b == &output.build) {
                        patch.build_outputs.push(output.build.clone());
                    }
                }
                Ok(Some(entry))
            })
            .map_err(|e| validation_or_transient(&task_id, e))?
            .context("submission entry vanished")
            .map_err(|e| transient(&task_id, e))?;

        if entry.stop {
            return Ok(());
        }
        let Some(patch) = entry.patches.get(entry.patch_idx) else {
            return Ok(());
        };
        let done: Vec<&str> = patch
            .build_outputs
            .iter()
            .map(|b| b.sanitizer.as_str())
            .collect();
        if !expected.iter().all(|s| done.contains(&s.as_str())) {
            return Ok(());
        }

        self.dispatch_reproduction(&task_id, &ipid, &entry)
    }

    /// Fan out one reproduction round: every crash against every patched
    /// build, plus every crash against its original unpatched build.
    fn dispatch_reproduction(
        &self,
        task_id: &str,
        ipid: &str,
        entry: &SubmissionEntry,
    ) -> Result<(), Failure> {
        let patch = &entry.patches[entry.patch_idx];
        let mut requests = Vec::new();
        for crash in &entry.crashes {
            for build in &patch.build_outputs {
                requests.push(PovReproduceRequest {
                    task_id: task_id.to_string(),
                    internal_patch_id: ipid.to_string(),
                    build: build.clone(),
                    crash_id: crash.crash_id.clone(),
                    harness_name: crash.harness_name.clone(),
                    crash_input: crash.crash_input.clone(),
                });
            }
            // Base-build sanity: the input must still crash without the patch.
            requests.push(PovReproduceRequest {
                task_id: task_id.to_string(),
                internal_patch_id: ipid.to_string(),
                build: crucible_types::BuildRef {
                    task_id: task_id.to_string(),
                    build_type: BuildType::Fuzzer,
                    sanitizer: crash.sanitizer.clone(),
                    internal_patch_id: None,
                },
                crash_id: crash.crash_id.clone(),
                harness_name: crash.harness_name.clone(),
                crash_input: crash.crash_input.clone(),
            });
        }

        if requests.is_empty() {
            // SARIF-only entry: nothing to reproduce yet.
            return Ok(());
        }

        let round = ReproduceRound {
            expected: requests.len(),
            ..ReproduceRound::default()
        };
        self.put_round(ipid, entry.patch_idx, &round)
            .map_err(|e| transient(task_id, e))?;
        for request in &requests {
            self.ctx
                .queues()
                .push(names::POV_REPRODUCE_REQUEST, request)
                .map_err(|e| transient(task_id, e))?;
        }
        info!(
            task_id,
            ipid,
            patch_idx = entry.patch_idx,
            requests = requests.len(),
            "reproduction round dispatched"
        );
        Ok(())
    }

    /// One reproduction response. When the round completes, pass or fail the
    /// candidate patch.
    pub fn handle_reproduce_response(&self, response: &PovReproduceResponse) -> Result<(), Failure> {
        let task_id = response.request.task_id.clone();
        let ipid = response.request.internal_patch_id.clone();

        let entry = catalog::submissions(self.ctx.kv())
            .get(&[&ipid])
            .map_err(|e| transient(&task_id, e))?
            .context("reproduce response for unknown entry")
            .map_err(|e| {
                Failure::new(FailureKind::Validation, COMPONENT, e.to_string()).for_task(&task_id)
            })?;
        if entry.stop {
            return Ok(());
        }
        let patch_idx = entry.patch_idx;

        let round = self
            .update_round(&ipid, patch_idx, |mut round| {
                round.seen += 1;
                match response.request.build.build_type {
                    BuildType::Patch if response.did_crash => round.patched_crashes += 1,
                    BuildType::Patch => {}
                    _ if !response.did_crash => round.base_misses += 1,
                    _ => {}
                }
                round
            })
            .map_err(|e| transient(&task_id, e))?;

        if !round.complete() {
            return Ok(());
        }

        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(&task_id), &task_id) {
            let _ = log.record(TaskEventType::PatchValidated {
                internal_patch_id: ipid.clone(),
                patch_idx,
                passed: round.passed(),
            });
        }

        if round.passed() {
            info!(task_id, ipid, patch_idx, "patch passed PoV reproduction");
            catalog::submissions(self.ctx.kv())
                .update(&[&ipid], |entry| {
                    Ok(entry.map(|mut entry| {
                        if let Some(patch) = entry.patches.get_mut(patch_idx) {
                            patch.pov_passed = true;
                        }
                        entry
                    }))
                })
                .map_err(|e| transient(&task_id, e))?;
            self.bump_counter(&task_id, "patches_validated")?;
            Ok(())
        } else {
            warn!(
                task_id,
                ipid,
                patch_idx,
                patched_crashes = round.patched_crashes,
                base_misses = round.base_misses,
                "patch failed PoV reproduction"
            );
            self.fail_current_patch(&task_id, &ipid)
        }
    }

    /// Advance past a failed candidate: next patch, a fresh request, or stop.
    fn fail_current_patch(&self, task_id: &str, ipid: &str) -> Result<(), Failure> {
        let deadline = catalog::tasks(self.ctx.kv())
            .get(&[task_id])
            .map_err(|e| transient(task_id, e))?
            .map(|record| record.task.deadline);

        let entry = catalog::submissions(self.ctx.kv())
            .update(&[ipid], |entry| {
                let mut entry = entry.context("submission entry vanished")?;
                if entry.stop {
                    return Ok(Some(entry));
                }
                entry.patch_idx += 1;
                if entry.patch_idx >= entry.patches.len() {
                    if entry.patch_submission_attempts < MAX_PATCH_ATTEMPTS {
                        entry.patch_submission_attempts += 1;
                    } else {
                        entry.stop = true;
                    }
                }
                Ok(Some(entry))
            })
            .map_err(|e| transient(task_id, e))?
            .context("submission entry vanished")
            .map_err(|e| transient(task_id, e))?;

        if entry.stop {
            if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(task_id), task_id) {
                let _ = log.record(TaskEventType::SubmissionsStopped {
                    internal_patch_id: ipid.to_string(),
                    reason: "patch attempts exhausted".to_string(),
                });
            }
            return Ok(());
        }

        if entry.patch_idx < entry.patches.len() {
            // Another candidate is already on file; build it.
            let patch = entry.patches[entry.patch_idx].patch.clone();
            return self.handle_patch_result(&PatchResult {
                internal_patch_id: ipid.to_string(),
                task_id: task_id.to_string(),
                patch,
            });
        }

        // Exhausted the list; ask the patcher fleet again unless frozen.
        let frozen = deadline
            .map(|d| patching_frozen(d, self.ctx.config.timers.freeze_window))
            .unwrap_or(false);
        if frozen {
            info!(task_id, ipid, "deadline freeze window; not re-requesting a patch");
            return Ok(());
        }
        self.request_patch(task_id, ipid, entry.patch_submission_attempts + 1)
    }

    fn request_patch(&self, task_id: &str, ipid: &str, attempt: u32) -> Result<(), Failure> {
        self.ctx
            .queues()
            .push(names::PATCH_REQUEST, &PatchRequest {
                internal_patch_id: ipid.to_string(),
                task_id: task_id.to_string(),
                attempt,
            })
            .map_err(|e| transient(task_id, e))?;
        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(task_id), task_id) {
            let _ = log.record(TaskEventType::PatchRequested {
                internal_patch_id: ipid.to_string(),
                attempt,
            });
        }
        Ok(())
    }

    /// Sanitizers the task fuzzes with, from its fuzzer builds. Falls back
    /// to address when no build has landed yet.
    fn task_sanitizers(&self, task_id: &str) -> Result<Vec<String>, Failure> {
        let mut sanitizers: Vec<String> = catalog::builds(self.ctx.kv())
            .scan(&[task_id])
            .map_err(|e| transient(task_id, e))?
            .into_iter()
            .map(|(_, b)| b.build)
            .filter(|b| b.build_type == BuildType::Fuzzer)
            .map(|b| b.sanitizer)
            .collect();
        sanitizers.sort();
        sanitizers.dedup();
        if sanitizers.is_empty() {
            sanitizers.push("address".to_string());
        }
        Ok(sanitizers)
    }

    fn round_key(ipid: &str, patch_idx: usize) -> String {
        format!("pov_round:{ipid}/{patch_idx}")
    }

    fn put_round(&self, ipid: &str, patch_idx: usize, round: &ReproduceRound) -> Result<()> {
        self.ctx
            .kv()
            .put(&Self::round_key(ipid, patch_idx), &serde_json::to_vec(round)?)
    }

    fn update_round<F>(&self, ipid: &str, patch_idx: usize, f: F) -> Result<ReproduceRound>
    where
        F: Fn(ReproduceRound) -> ReproduceRound,
    {
        let key = Self::round_key(ipid, patch_idx);
        let updated = crate::kv::cas_loop(self.ctx.kv(), &key, |current| {
            let round: ReproduceRound = match current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => ReproduceRound::default(),
            };
            Ok(Some(serde_json::to_vec(&f(round))?))
        })?
        .context("reproduction round vanished")?;
        Ok(serde_json::from_slice(&updated)?)
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

fn transient(task_id: &str, e: anyhow::Error) -> Failure {
    Failure::new(FailureKind::Transient, COMPONENT, e.to_string()).for_task(task_id)
}

/// Unknown-entry errors are validation (the record references nothing we
/// know); everything else infrastructure.
fn validation_or_transient(task_id: &str, e: anyhow::Error) -> Failure {
    let message = e.to_string();
    let kind = if message.contains("unknown entry") {
        FailureKind::Validation
    } else {
        FailureKind::Transient
    };
    Failure::new(kind, COMPONENT, message).for_task(task_id)
}
