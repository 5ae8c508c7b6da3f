//! Cancellation and garbage collection.
//!
//! `TaskDelete` is observed by every worker fleet; the GC worker is the one
//! that purges queued records, tears down the scratch tree, and acknowledges
//! the purge so the scheduler can complete its Cancelled transition. A
//! periodic sweep removes every trace of terminal tasks once their deadline
//! has passed.

use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crucible_types::{Failure, FailureKind, TaskDelete};

use crate::catalog;
use crate::context::Ctx;
use crate::kv::{KvStore, cas_loop};
use crate::queue::names;

const COMPONENT: &str = "gc";

/// Fleet name this worker acknowledges deletes under.
pub const FLEET: &str = "gc";

/// Fleets whose acknowledgement the scheduler requires before marking a task
/// Cancelled. External fleets (fuzzers, tracers, patchers) abort on their own
/// cancellation tokens and do not gate the transition.
pub const REQUIRED_ACKS: &[&str] = &[FLEET];

fn acks_key(task_id: &str) -> String {
    format!("delete_acks:{task_id}")
}

/// Record that `fleet` finished purging `task_id`.
pub fn ack_delete(kv: &dyn KvStore, task_id: &str, fleet: &str) -> Result<()> {
    cas_loop(kv, &acks_key(task_id), |current| {
        let mut acks: Vec<String> = match current {
            Some(bytes) => serde_json::from_slice(bytes).unwrap_or_default(),
            None => Vec::new(),
        };
        if !acks.iter().any(|a| a == fleet) {
            acks.push(fleet.to_string());
        }
        Ok(Some(serde_json::to_vec(&acks)?))
    })?;
    Ok(())
}

/// Whether every required fleet has acknowledged the delete.
pub fn acks_complete(kv: &dyn KvStore, task_id: &str) -> Result<bool> {
    let acks: Vec<String> = match kv.get(&acks_key(task_id))? {
        Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        None => Vec::new(),
    };
    Ok(REQUIRED_ACKS
        .iter()
        .all(|required| acks.iter().any(|a| a == required)))
}

pub struct GcWorker<'a> {
    ctx: &'a Ctx,
}

impl<'a> GcWorker<'a> {
    pub fn new(ctx: &'a Ctx) -> Self {
        Self { ctx }
    }

    /// Handle a broadcast delete: purge one task, or every live task when
    /// `all` is set. The cross-task blob cache survives either way.
    pub fn handle_delete(&self, delete: &TaskDelete) -> Result<(), Failure> {
        if delete.all {
            let records = catalog::tasks(self.ctx.kv())
                .scan(&[])
                .map_err(|e| transient(e))?;
            for (_, record) in records {
                self.purge_task(&record.task.task_id)
                    .map_err(|e| transient(e))?;
            }
            return Ok(());
        }
        let Some(task_id) = &delete.task_id else {
            return Err(Failure::new(
                FailureKind::Validation,
                COMPONENT,
                "task delete names no task and is not `all`",
            ));
        };
        self.purge_task(task_id).map_err(|e| transient(e))
    }

    /// Abort in-process work, drop the task's queued records, delete its
    /// scratch tree, and acknowledge.
    pub fn purge_task(&self, task_id: &str) -> Result<()> {
        self.ctx.cancel_task(task_id);

        let queues = self.ctx.queues();
        for queue in names::ALL {
            if *queue == names::DEAD_LETTER {
                // Dead letters are forensic; they outlive their task.
                continue;
            }
            let purged = queues.purge_task(queue, task_id)?;
            if purged > 0 {
                info!(task_id, queue, purged, "queued records purged");
            }
        }

        let scratch = self.ctx.task_scratch(task_id);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)
                .with_context(|| format!("failed to remove scratch {}", scratch.display()))?;
        }

        ack_delete(self.ctx.kv(), task_id, FLEET)?;
        info!(task_id, "task purged");
        Ok(())
    }

    /// Remove every catalogue entry for tasks that are terminal with their
    /// deadline passed. Returns how many tasks were swept.
    pub fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut swept = 0;
        for (_, record) in catalog::tasks(self.ctx.kv()).scan(&[])? {
            let task_id = record.task.task_id.clone();
            if !record.state.is_terminal() || now < record.task.deadline {
                continue;
            }
            if let Err(e) = self.sweep_task(&task_id) {
                warn!(task_id, error = %e, "sweep failed; will retry");
                continue;
            }
            swept += 1;
        }
        for queue in names::ALL {
            let _ = self.ctx.queues().trim_acked(queue);
        }
        Ok(swept)
    }

    fn sweep_task(&self, task_id: &str) -> Result<()> {
        let kv = self.ctx.kv();

        // Submission-keyed state first: entries know their ipids.
        let entries: Vec<String> = catalog::submissions(kv)
            .scan(&[])?
            .into_iter()
            .filter(|(_, e)| e.task_id == task_id)
            .map(|(_, e)| e.internal_patch_id)
            .collect();
        for ipid in &entries {
            for (key, _) in kv.scan_prefix(&format!("pov_round:{ipid}/"))? {
                kv.delete(&key)?;
            }
            for (key, _) in kv.scan_prefix(&format!("submit_marker:{ipid}/"))? {
                kv.delete(&key)?;
            }
            catalog::submissions(kv).delete(&[ipid])?;
        }
        let vulns: Vec<String> = catalog::vulnerabilities(kv)
            .scan(&[])?
            .into_iter()
            .filter(|(_, v)| v.task_id == task_id)
            .map(|(_, v)| v.internal_patch_id)
            .collect();
        for ipid in &vulns {
            catalog::vulnerabilities(kv).delete(&[ipid])?;
        }

        catalog::crashes(kv).clear(&[task_id])?;
        catalog::builds(kv).clear(&[task_id])?;
        catalog::harness_weights(kv).clear(&[task_id])?;
        catalog::downloaded(kv).delete(&[task_id])?;
        for (key, _) in kv.scan_prefix(&format!("crash_bag:{task_id}/"))? {
            kv.delete(&key)?;
        }
        kv.delete(&acks_key(task_id))?;

        let scratch = self.ctx.task_scratch(task_id);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)
                .with_context(|| format!("failed to remove scratch {}", scratch.display()))?;
        }

        catalog::tasks(kv).delete(&[task_id])?;
        info!(task_id, "task swept");
        Ok(())
    }
}

fn transient(e: anyhow::Error) -> Failure {
    Failure::new(FailureKind::Transient, COMPONENT, e.to_string())
}
