//! Builder dispatcher: at-most-one concurrent build per identity.
//!
//! A build is identified by (task, build_type, sanitizer, internal_patch_id).
//! Before invoking the external build tool the dispatcher CAS-inserts a
//! pending placeholder into the builds catalogue; a duplicate request joins
//! the placeholder and receives the same eventual output. Placeholders left
//! behind by a crashed dispatcher are taken over once the build timeout has
//! lapsed.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crucible_types::frame;
use crucible_types::{
    BuildOutcome, BuildOutput, BuildRequest, BuildType, Failure, FailureKind,
};

use crate::catalog::{self, build_parts};
use crate::context::Ctx;
use crate::events::{EventLog, TaskEventType};
use crate::process::run_command;
use crate::queue::names;

const COMPONENT: &str = "builder";

pub struct Builder<'a> {
    ctx: &'a Ctx,
}

impl<'a> Builder<'a> {
    pub fn new(ctx: &'a Ctx) -> Self {
        Self { ctx }
    }

    /// Process one build request: execute, join, or take over, per the
    /// placeholder state for this identity.
    pub fn handle(&self, request: &BuildRequest) -> Result<(), Failure> {
        let task_id = request.build.task_id.clone();
        let parts = build_parts(&request.build);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let builds = catalog::builds(self.ctx.kv());

        let placeholder = BuildOutput {
            build: request.build.clone(),
            engine: request.engine.clone(),
            task_dir: self
                .ctx
                .task_scratch(&task_id)
                .join(request.build.artifact_dir()),
            apply_diff: request.apply_diff,
            outcome: BuildOutcome::Pending,
            started_at: Utc::now(),
        };

        let claimed = builds
            .insert_if_absent(&parts, &placeholder)
            .map_err(|e| transient(&task_id, e))?;
        if claimed {
            return self.execute(request, &parts, &placeholder);
        }

        let existing = builds
            .get(&parts)
            .map_err(|e| transient(&task_id, e))?
            .context("build placeholder vanished under us")
            .map_err(|e| transient(&task_id, e))?;

        match existing.outcome {
            BuildOutcome::Pending => {
                let age = (Utc::now() - existing.started_at)
                    .to_std()
                    .unwrap_or_default();
                if age > self.ctx.config.timers.build_timeout {
                    // The executing dispatcher died; take the identity over.
                    let taken = self
                        .take_over(&parts, &existing, &placeholder)
                        .map_err(|e| transient(&task_id, e))?;
                    if taken {
                        return self.execute(request, &parts, &placeholder);
                    }
                }
                self.join(&parts, &task_id)
            }
            _ => {
                // Already terminal: re-publish so the requester sees it.
                self.publish(&existing).map_err(|e| transient(&task_id, e))
            }
        }
    }

    fn take_over(
        &self,
        parts: &[&str],
        stale: &BuildOutput,
        fresh: &BuildOutput,
    ) -> Result<bool> {
        let key_expected = frame::encode_value(stale)?;
        let key_new = frame::encode_value(fresh)?;
        self.ctx.kv().compare_and_swap(
            &format!("builds:{}", parts.join("/")),
            Some(&key_expected),
            Some(&key_new),
        )
    }

    /// Wait for the executing dispatcher to finish, then re-publish its
    /// output. Gives up (transiently) at the build timeout.
    fn join(&self, parts: &[&str], task_id: &str) -> Result<(), Failure> {
        let builds = catalog::builds(self.ctx.kv());
        let deadline = Instant::now() + self.ctx.config.timers.build_timeout;
        let cancel = self.ctx.task_cancel(task_id);
        loop {
            if self.ctx.shutdown().is_cancelled() || cancel.is_cancelled() {
                return Err(Failure::new(
                    FailureKind::Terminal,
                    COMPONENT,
                    "cancelled while joining a build",
                )
                .for_task(task_id));
            }
            let current = builds
                .get(parts)
                .map_err(|e| transient(task_id, e))?
                .context("build placeholder vanished while joining")
                .map_err(|e| transient(task_id, e))?;
            if current.outcome != BuildOutcome::Pending {
                return self.publish(&current).map_err(|e| transient(task_id, e));
            }
            if Instant::now() >= deadline {
                return Err(Failure::new(
                    FailureKind::Transient,
                    COMPONENT,
                    "timed out joining an in-flight build",
                )
                .for_task(task_id));
            }
            cancel.sleep(std::time::Duration::from_millis(200));
        }
    }

    fn execute(
        &self,
        request: &BuildRequest,
        parts: &[&str],
        placeholder: &BuildOutput,
    ) -> Result<(), Failure> {
        let task_id = &request.build.task_id;
        let output = self
            .run_build(request, placeholder)
            .map_err(|e| transient(task_id, e))?;

        let finished = BuildOutput {
            outcome: output.clone(),
            ..placeholder.clone()
        };
        catalog::builds(self.ctx.kv())
            .update(parts, |_| Ok(Some(finished.clone())))
            .map_err(|e| transient(task_id, e))?;

        if let Ok(mut log) = EventLog::open(&self.ctx.task_scratch(task_id), task_id) {
            let _ = log.record(TaskEventType::BuildFinished {
                build: request.build.artifact_dir(),
                ok: finished.outcome == BuildOutcome::Ok,
            });
        }
        self.publish(&finished).map_err(|e| transient(task_id, e))
    }

    /// Invoke the external build tool and classify its exit.
    fn run_build(&self, request: &BuildRequest, placeholder: &BuildOutput) -> Result<BuildOutcome> {
        let task_id = &request.build.task_id;
        let tool = self.resolve_tool()?;
        let sources = self.ctx.task_scratch(task_id).join("sources").join("repo");
        let out_dir = &placeholder.task_dir;
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        let build_type = request.build.build_type.as_str().to_string();
        let sources_str = sources.display().to_string();
        let out_str = out_dir.display().to_string();
        let mut args: Vec<&str> = vec![
            "build",
            "--source",
            &sources_str,
            "--out",
            &out_str,
            "--sanitizer",
            &request.build.sanitizer,
            "--engine",
            &request.engine,
            "--build-type",
            &build_type,
        ];
        // tracer_no_diff builds the pre-diff tree; every other delta build
        // applies the diff first.
        if request.apply_diff && request.build.build_type != BuildType::TracerNoDiff {
            args.push("--apply-diff");
        }
        let patch_file = out_dir.join("candidate.patch");
        if let Some(patch) = &request.patch {
            fs::write(&patch_file, patch)
                .with_context(|| format!("failed to write {}", patch_file.display()))?;
        }
        let patch_str = patch_file.display().to_string();
        if request.patch.is_some() {
            args.push("--patch");
            args.push(&patch_str);
        }

        info!(task_id, build = request.build.artifact_dir(), "starting build");
        let result = run_command(
            &tool,
            &args,
            &self.ctx.task_scratch(task_id),
            &[],
            self.ctx.config.timers.build_timeout,
            self.ctx.config.timers.subprocess_grace,
            &self.ctx.task_cancel(task_id),
            self.ctx.config.limits.output_lines,
        )?;

        if result.success() {
            Ok(BuildOutcome::Ok)
        } else {
            warn!(
                task_id,
                build = request.build.artifact_dir(),
                exit = result.exit_code,
                "build failed"
            );
            Ok(BuildOutcome::Errored {
                message: result.stderr_tail,
            })
        }
    }

    fn resolve_tool(&self) -> Result<String> {
        let tool = &self.ctx.config.builder.tool;
        if PathBuf::from(tool).is_absolute() {
            return Ok(tool.clone());
        }
        let resolved = which::which(tool)
            .with_context(|| format!("build tool {tool} not found on PATH"))?;
        Ok(resolved.display().to_string())
    }

    fn publish(&self, output: &BuildOutput) -> Result<()> {
        self.ctx.queues().push(names::BUILD_OUTPUT, output)?;
        Ok(())
    }
}

fn transient(task_id: &str, e: anyhow::Error) -> Failure {
    Failure::new(FailureKind::Transient, COMPONENT, e.to_string()).for_task(task_id)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;

    use crucible_types::BuildRef;
    use tempfile::tempdir;

    use crate::config::CrucibleConfig;
    use crate::kv::MemoryKv;

    use super::*;

    /// Install a fake build tool that logs an invocation marker and exits
    /// with the given code.
    fn fake_tool(dir: &std::path::Path, exit_code: i32, sleep_ms: u64) -> String {
        let path = dir.join("fake-build");
        fs::write(
            &path,
            format!(
                "#!/usr/bin/env sh\nsleep_ms={sleep_ms}\n[ \"$sleep_ms\" -gt 0 ] && sleep \"$(awk \"BEGIN {{print $sleep_ms/1000}}\")\"\necho \"invoked $$\" >> \"$(dirname \"$0\")/invocations.log\"\necho build-stderr >&2\nexit {exit_code}\n"
            ),
        )
        .expect("write tool");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path.display().to_string()
    }

    fn invocation_count(tool: &str) -> usize {
        let log = std::path::Path::new(tool).parent().unwrap().join("invocations.log");
        fs::read_to_string(log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn test_ctx(scratch: &std::path::Path, tool: String) -> Arc<Ctx> {
        let mut config = CrucibleConfig {
            scratch_root: scratch.to_path_buf(),
            ..CrucibleConfig::default()
        };
        config.builder.tool = tool;
        config.timers.build_timeout = Duration::from_secs(10);
        Ctx::with_store(config, Arc::new(MemoryKv::new()))
    }

    fn request(task_id: &str, build_type: BuildType, ipid: Option<&str>) -> BuildRequest {
        BuildRequest {
            build: BuildRef {
                task_id: task_id.to_string(),
                build_type,
                sanitizer: "address".to_string(),
                internal_patch_id: ipid.map(str::to_string),
            },
            engine: "libfuzzer".to_string(),
            apply_diff: false,
            patch: None,
        }
    }

    #[test]
    fn successful_build_records_ok_and_publishes_output() {
        let td = tempdir().expect("tempdir");
        let tool = fake_tool(td.path(), 0, 0);
        let ctx = test_ctx(td.path(), tool);

        Builder::new(&ctx)
            .handle(&request("t1", BuildType::Fuzzer, None))
            .expect("build");

        let stored = catalog::builds(ctx.kv())
            .get(&["t1", "fuzzer", "address"])
            .unwrap()
            .expect("stored");
        assert_eq!(stored.outcome, BuildOutcome::Ok);
        assert!(stored.task_dir.ends_with("build-fuzzer-address"));

        let outputs = ctx
            .queues()
            .reserve(names::BUILD_OUTPUT, "test", "c1", 1, Duration::ZERO)
            .unwrap();
        assert_eq!(outputs.len(), 1);
        let record: BuildOutput = outputs[0].decode().unwrap();
        assert_eq!(record.outcome, BuildOutcome::Ok);
    }

    #[test]
    fn failing_build_records_errored_with_stderr_tail() {
        let td = tempdir().expect("tempdir");
        let tool = fake_tool(td.path(), 7, 0);
        let ctx = test_ctx(td.path(), tool);

        Builder::new(&ctx)
            .handle(&request("t1", BuildType::Fuzzer, None))
            .expect("handled");

        let stored = catalog::builds(ctx.kv())
            .get(&["t1", "fuzzer", "address"])
            .unwrap()
            .expect("stored");
        match stored.outcome {
            BuildOutcome::Errored { message } => assert!(message.contains("build-stderr")),
            other => panic!("expected errored outcome, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_request_after_completion_republishes_without_rebuilding() {
        let td = tempdir().expect("tempdir");
        let tool = fake_tool(td.path(), 0, 0);
        let ctx = test_ctx(td.path(), tool.clone());
        let builder = Builder::new(&ctx);

        builder
            .handle(&request("t1", BuildType::Fuzzer, None))
            .expect("first");
        builder
            .handle(&request("t1", BuildType::Fuzzer, None))
            .expect("second");

        assert_eq!(invocation_count(&tool), 1, "tool ran once");
        let outputs = ctx
            .queues()
            .reserve(names::BUILD_OUTPUT, "test", "c1", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(outputs.len(), 2, "both requesters see the output");
    }

    #[test]
    fn concurrent_requests_run_the_tool_once() {
        let td = tempdir().expect("tempdir");
        let tool = fake_tool(td.path(), 0, 300);
        let ctx = test_ctx(td.path(), tool.clone());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let ctx = Arc::clone(&ctx);
            handles.push(std::thread::spawn(move || {
                Builder::new(&ctx).handle(&request("t1", BuildType::Fuzzer, None))
            }));
        }
        for handle in handles {
            handle.join().expect("thread").expect("handle");
        }

        assert_eq!(invocation_count(&tool), 1, "identity built once");
    }

    #[test]
    fn patch_build_writes_candidate_patch_file() {
        let td = tempdir().expect("tempdir");
        let tool = fake_tool(td.path(), 0, 0);
        let ctx = test_ctx(td.path(), tool);

        let mut build_request = request("t1", BuildType::Patch, Some("ipid-1"));
        build_request.patch = Some("--- a/f.c\n+++ b/f.c\n".to_string());
        Builder::new(&ctx).handle(&build_request).expect("build");

        let patch_file = ctx
            .task_scratch("t1")
            .join("build-patch-address-ipid-1")
            .join("candidate.patch");
        assert!(patch_file.exists());

        let stored = catalog::builds(ctx.kv())
            .get(&["t1", "patch", "address", "ipid-1"])
            .unwrap()
            .expect("stored");
        assert_eq!(stored.outcome, BuildOutcome::Ok);
    }

    #[test]
    fn missing_tool_is_a_transient_failure() {
        let td = tempdir().expect("tempdir");
        let ctx = test_ctx(td.path(), "definitely-not-a-real-build-tool".to_string());

        let failure = Builder::new(&ctx)
            .handle(&request("t1", BuildType::Fuzzer, None))
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
    }

    #[test]
    fn stale_pending_placeholder_is_taken_over() {
        let td = tempdir().expect("tempdir");
        let tool = fake_tool(td.path(), 0, 0);
        let mut config = CrucibleConfig {
            scratch_root: td.path().to_path_buf(),
            ..CrucibleConfig::default()
        };
        config.builder.tool = tool.clone();
        config.timers.build_timeout = Duration::from_millis(50);
        let ctx = Ctx::with_store(config, Arc::new(MemoryKv::new()));

        // A dispatcher claimed the identity and died an hour ago.
        let stale = BuildOutput {
            build: request("t1", BuildType::Fuzzer, None).build,
            engine: "libfuzzer".to_string(),
            task_dir: ctx.task_scratch("t1").join("build-fuzzer-address"),
            apply_diff: false,
            outcome: BuildOutcome::Pending,
            started_at: Utc::now() - chrono::Duration::hours(1),
        };
        catalog::builds(ctx.kv())
            .put(&["t1", "fuzzer", "address"], &stale)
            .unwrap();

        Builder::new(&ctx)
            .handle(&request("t1", BuildType::Fuzzer, None))
            .expect("take over");

        let stored = catalog::builds(ctx.kv())
            .get(&["t1", "fuzzer", "address"])
            .unwrap()
            .expect("stored");
        assert_eq!(stored.outcome, BuildOutcome::Ok);
        assert_eq!(invocation_count(&tool), 1);
    }
}
