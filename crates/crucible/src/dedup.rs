//! Fuzzer merge and dedup: crash tokens, first-writer-wins insertion, and
//! promotion of traced crashes to confirmed vulnerabilities.
//!
//! The crash token is a deterministic fingerprint of the normalised
//! stacktrace plus the sanitizer, so the same root cause reported by many
//! fuzzer workers collapses to one catalogue entry per task.

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crucible_types::{
    ConfirmedVulnerability, Crash, Failure, FailureKind, RawCrash, TracedCrash,
    new_crash_id, new_internal_patch_id,
};

use crate::catalog;
use crate::context::Ctx;
use crate::events::{EventLog, TaskEventType};
use crate::queue::names;

const COMPONENT: &str = "crash-merge";

/// Frames kept in the normalised trace.
pub const TOP_FRAMES: usize = 5;

/// Runtime and interceptor frames that carry no signal about the root cause.
const RUNTIME_FRAMES: &[&str] = &[
    "__asan",
    "__ubsan",
    "__msan",
    "__sanitizer",
    "__interceptor",
    "__libc_start_main",
    "_start",
];

/// Normalise a raw sanitizer stacktrace down to its top symbolic frames.
///
/// Strips report preambles and summaries, scrubs addresses and file:line
/// suffixes, drops sanitizer runtime frames, and keeps the first
/// [`TOP_FRAMES`] function names in order. The exact trimming policy is
/// validated against a crash corpus before changes; see the snapshot tests.
pub fn normalize_stacktrace(stacktrace: &str) -> Vec<String> {
    let mut frames = Vec::new();
    for line in stacktrace.lines() {
        let line = line.trim();
        // Frame lines look like: `#3 0x55ae41 in parse_header /src/http.c:120:7`.
        if !line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let _index = parts.next();
        let Some(mut symbol) = parts.next() else {
            continue;
        };
        // Skip the address and the `in` keyword when present.
        if symbol.starts_with("0x") {
            match (parts.next(), parts.next()) {
                (Some("in"), Some(name)) => symbol = name,
                (Some(name), _) if name != "in" => symbol = name,
                _ => continue,
            }
        }
        let symbol = scrub_symbol(symbol);
        if symbol.is_empty() || RUNTIME_FRAMES.iter().any(|r| symbol.starts_with(r)) {
            continue;
        }
        frames.push(symbol);
        if frames.len() == TOP_FRAMES {
            break;
        }
    }
    frames
}

/// Drop file:line:col suffixes, template noise, and trailing punctuation
/// from a frame symbol.
fn scrub_symbol(symbol: &str) -> String {
    let symbol = symbol.split('(').next().unwrap_or(symbol);
    let symbol = symbol.split_once(".c:").map(|(s, _)| s).unwrap_or(symbol);
    symbol.trim_end_matches([',', ')']).to_string()
}

/// Deterministic crash fingerprint: sha256 over the sanitizer and the
/// normalised frames, hex-encoded.
pub fn crash_token(sanitizer: &str, frames: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sanitizer.as_bytes());
    for frame in frames {
        hasher.update(b"\n");
        hasher.update(frame.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub struct CrashMerger<'a> {
    ctx: &'a Ctx,
}

impl<'a> CrashMerger<'a> {
    pub fn new(ctx: &'a Ctx) -> Self {
        Self { ctx }
    }

    /// Dedup one raw crash. The first report of a token becomes the
    /// canonical `Crash` and goes to the tracer; duplicates only contribute
    /// their input path to the per-token forensic bag.
    pub fn handle_raw(&self, raw: &RawCrash) -> Result<(), Failure> {
        let task_id = raw.task_id.clone();
        if raw.stacktrace.trim().is_empty() {
            return Err(Failure::new(
                FailureKind::Validation,
                COMPONENT,
                "crash report carries no stacktrace",
            )
            .for_task(&task_id));
        }

        let frames = normalize_stacktrace(&raw.stacktrace);
        if frames.is_empty() {
            return Err(Failure::new(
                FailureKind::Validation,
                COMPONENT,
                "no symbolic frames survived normalisation",
            )
            .for_task(&task_id));
        }
        let token = crash_token(&raw.target.sanitizer, &frames);

        let crash = Crash {
            crash_id: new_crash_id(),
            task_id: task_id.clone(),
            target: raw.target.clone(),
            harness_name: raw.harness_name.clone(),
            crash_input: raw.crash_input.clone(),
            stacktrace: raw.stacktrace.clone(),
            crash_token: token.clone(),
        };

        let inserted = catalog::crashes(self.ctx.kv())
            .insert_if_absent(&[&task_id, &token], &crash)
            .map_err(|e| transient(&task_id, e))?;

        if inserted {
            info!(task_id, token, harness = raw.harness_name, "new crash accepted");
            if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(&task_id), &task_id) {
                let _ = log.record(TaskEventType::CrashAccepted {
                    crash_token: token.clone(),
                    harness: raw.harness_name.clone(),
                });
            }
            self.bump_counter(&task_id, "crashes_unique")?;
            self.ctx
                .queues()
                .push(names::TRACER, &crash)
                .map_err(|e| transient(&task_id, e))?;
        } else {
            debug!(task_id, token, "duplicate crash discarded");
            self.append_to_bag(&task_id, &token, raw)
                .map_err(|e| transient(&task_id, e))?;
            self.bump_counter(&task_id, "crashes_duplicate")?;
        }
        Ok(())
    }

    /// Promote a tracer-enriched crash: append to an existing vulnerability
    /// that subsumes its token, or confirm a new one with a fresh internal
    /// patch id.
    pub fn handle_traced(&self, traced: &TracedCrash) -> Result<(), Failure> {
        let task_id = traced.crash.task_id.clone();
        let token = traced.crash.crash_token.clone();
        let vulnerabilities = catalog::vulnerabilities(self.ctx.kv());

        let existing = vulnerabilities
            .scan(&[])
            .map_err(|e| transient(&task_id, e))?
            .into_iter()
            .map(|(_, v)| v)
            .find(|v| {
                v.task_id == task_id && v.crashes.iter().any(|c| c.crash.crash_token == token)
            });

        if let Some(vuln) = existing {
            let ipid = vuln.internal_patch_id.clone();
            vulnerabilities
                .update(&[&ipid], |current| {
                    Ok(current.map(|mut vuln| {
                        let already = vuln
                            .crashes
                            .iter()
                            .any(|c| c.crash.crash_id == traced.crash.crash_id);
                        if !already {
                            vuln.crashes.push(traced.clone());
                        }
                        vuln
                    }))
                })
                .map_err(|e| transient(&task_id, e))?;
            debug!(task_id, token, ipid, "crash joined existing vulnerability");
            return Ok(());
        }

        let ipid = new_internal_patch_id();
        let vuln = ConfirmedVulnerability {
            internal_patch_id: ipid.clone(),
            task_id: task_id.clone(),
            crashes: vec![traced.clone()],
            assigned_worker: None,
        };
        let inserted = vulnerabilities
            .insert_if_absent(&[&ipid], &vuln)
            .map_err(|e| transient(&task_id, e))?;
        if !inserted {
            // UUID collision cannot realistically happen; treat as conflict.
            return Err(transient(
                &task_id,
                anyhow::anyhow!("freshly minted internal patch id already exists"),
            ));
        }

        info!(task_id, token, ipid, "vulnerability confirmed");
        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(&task_id), &task_id) {
            let _ = log.record(TaskEventType::VulnerabilityConfirmed {
                internal_patch_id: ipid.clone(),
            });
        }
        self.bump_counter(&task_id, "vulnerabilities")?;
        self.ctx
            .queues()
            .push(names::CONFIRMED_VULNERABILITY, &vuln)
            .map_err(|e| transient(&task_id, e))?;
        Ok(())
    }

    /// Forensic bag: newline-separated input paths per (task, token).
    fn append_to_bag(&self, task_id: &str, token: &str, raw: &RawCrash) -> Result<()> {
        let key = format!("crash_bag:{task_id}/{token}");
        crate::kv::cas_loop(self.ctx.kv(), &key, |current| {
            let mut bag = current
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            if !bag.is_empty() {
                bag.push('\n');
            }
            bag.push_str(&raw.crash_input.display().to_string());
            Ok(Some(bag.into_bytes()))
        })?;
        Ok(())
    }

    fn bump_counter(&self, task_id: &str, counter: &str) -> Result<(), Failure> {
        catalog::tasks(self.ctx.kv())
            .update(&[task_id], |record| {
                Ok(record.map(|mut record| {
                    *record.counters.entry(counter.to_string()).or_insert(0) += 1;
                    record.updated_at = chrono::Utc::now();
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
