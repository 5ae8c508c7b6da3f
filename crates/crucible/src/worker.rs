//! Worker harness: the reserve → handle → ack loop every fleet runs.
//!
//! The harness is where the failure taxonomy is enforced: handlers return a
//! classified [`Failure`], and the boundary acks, dead-letters, or leaves the
//! message for redelivery accordingly. Nothing else escapes. Every failure
//! writes one structured log line carrying task, component, kind, and
//! message.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, warn};

use crucible_types::{DeadLetterReason, Failure, FailureKind};

use crate::builder::Builder;
use crate::context::Ctx;
use crate::dedup::CrashMerger;
use crate::downloader::Downloader;
use crate::gc::GcWorker;
use crate::queue::{Delivery, names};
use crate::router::PatchRouter;

/// A queue consumer: one fixed queue, one consumer group, one handler.
pub trait QueueWorker: Send {
    fn queue(&self) -> &'static str;
    fn group(&self) -> &'static str;
    fn component(&self) -> &'static str;
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure>;

    /// Housekeeping between reservations (high-water marks, reclaim).
    fn maintain(&mut self, _ctx: &Ctx) -> Result<()> {
        Ok(())
    }
}

/// Drive one worker until shutdown.
pub fn run_worker(ctx: &Ctx, worker: &mut dyn QueueWorker) -> Result<()> {
    let consumer = ctx.consumer_name();
    while !ctx.shutdown().is_cancelled() {
        worker.maintain(ctx)?;
        let deliveries = ctx.queues().reserve(
            worker.queue(),
            worker.group(),
            &consumer,
            1,
            ctx.config.timers.reserve_block,
        )?;
        for delivery in deliveries {
            process_delivery(ctx, worker, &delivery)?;
        }
    }
    Ok(())
}

/// Handle one delivery and settle it per the failure kind:
/// validation dead-letters and acks, terminal and external-API failures ack,
/// transient and exhaustion failures leave the reservation to expire and be
/// redelivered.
pub fn process_delivery(
    ctx: &Ctx,
    worker: &mut dyn QueueWorker,
    delivery: &Delivery,
) -> Result<()> {
    let queues = ctx.queues();
    match worker.handle(delivery) {
        Ok(()) => queues.ack(worker.queue(), worker.group(), delivery.msg_id),
        Err(failure) => {
            log_failure(worker.component(), &failure);
            match failure.kind {
                FailureKind::Validation => {
                    queues.dead_letter(
                        worker.queue(),
                        DeadLetterReason::InvalidRecord,
                        failure.message.clone(),
                        delivery.bytes.clone(),
                    )?;
                    queues.ack(worker.queue(), worker.group(), delivery.msg_id)
                }
                FailureKind::Terminal | FailureKind::ExternalApi => {
                    queues.ack(worker.queue(), worker.group(), delivery.msg_id)
                }
                FailureKind::Transient | FailureKind::Exhaustion => {
                    // No ack: the reservation expires and redelivers.
                    Ok(())
                }
            }
        }
    }
}

fn log_failure(component: &str, failure: &Failure) {
    let task_id = failure.task_id.as_deref().unwrap_or("-");
    match failure.kind {
        FailureKind::Transient | FailureKind::Exhaustion => {
            warn!(task_id, component, kind = %failure.kind, message = failure.message, "worker failure")
        }
        _ => {
            error!(task_id, component, kind = %failure.kind, message = failure.message, "worker failure")
        }
    }
}

fn decode_failure(component: &str, e: impl std::fmt::Display) -> Failure {
    Failure::new(FailureKind::Validation, component, format!("bad frame: {e}"))
}

// ---------------------------------------------------------------------------
// Concrete fleet workers
// ---------------------------------------------------------------------------

/// `task_download_queue` → Downloader.
pub struct DownloadWorker {
    ctx: Arc<Ctx>,
}

impl DownloadWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for DownloadWorker {
    fn queue(&self) -> &'static str {
        names::TASK_DOWNLOAD
    }
    fn group(&self) -> &'static str {
        "downloader"
    }
    fn component(&self) -> &'static str {
        "downloader"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        Downloader::new(&self.ctx)
            .map_err(|e| Failure::new(FailureKind::Transient, self.component(), e.to_string()))?
            .handle(&record)
    }
}

/// `build_request_queue` → Builder dispatcher.
pub struct BuildWorker {
    ctx: Arc<Ctx>,
}

impl BuildWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for BuildWorker {
    fn queue(&self) -> &'static str {
        names::BUILD_REQUEST
    }
    fn group(&self) -> &'static str {
        "builder"
    }
    fn component(&self) -> &'static str {
        "builder"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        Builder::new(&self.ctx).handle(&record)
    }
}

/// `raw_crash_queue` → crash dedup. Maintains the queue's high-water mark so
/// fuzzer-side producers can pause.
pub struct RawCrashWorker {
    ctx: Arc<Ctx>,
}

impl RawCrashWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for RawCrashWorker {
    fn queue(&self) -> &'static str {
        names::RAW_CRASH
    }
    fn group(&self) -> &'static str {
        "crash-merge"
    }
    fn component(&self) -> &'static str {
        "crash-merge"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        CrashMerger::new(&self.ctx).handle_raw(&record)
    }
    fn maintain(&mut self, ctx: &Ctx) -> Result<()> {
        ctx.queues()
            .check_high_water(names::RAW_CRASH, ctx.config.limits.queue_high_water)?;
        Ok(())
    }
}

/// `traced_crash_queue` → vulnerability promotion.
pub struct TracedCrashWorker {
    ctx: Arc<Ctx>,
}

impl TracedCrashWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for TracedCrashWorker {
    fn queue(&self) -> &'static str {
        names::TRACED_CRASH
    }
    fn group(&self) -> &'static str {
        "crash-merge"
    }
    fn component(&self) -> &'static str {
        "crash-merge"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        CrashMerger::new(&self.ctx).handle_traced(&record)
    }
}

/// `confirmed_vulnerability_queue` → patch router.
pub struct ConfirmedVulnWorker {
    ctx: Arc<Ctx>,
}

impl ConfirmedVulnWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for ConfirmedVulnWorker {
    fn queue(&self) -> &'static str {
        names::CONFIRMED_VULNERABILITY
    }
    fn group(&self) -> &'static str {
        "patch-router"
    }
    fn component(&self) -> &'static str {
        "patch-router"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        PatchRouter::new(&self.ctx).handle_confirmed(&record)
    }
}

/// `patch_result_queue` → patch router.
pub struct PatchResultWorker {
    ctx: Arc<Ctx>,
}

impl PatchResultWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for PatchResultWorker {
    fn queue(&self) -> &'static str {
        names::PATCH_RESULT
    }
    fn group(&self) -> &'static str {
        "patch-router"
    }
    fn component(&self) -> &'static str {
        "patch-router"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        PatchRouter::new(&self.ctx).handle_patch_result(&record)
    }
}

/// `build_output_queue` → patch router (patch-build completions).
pub struct BuildOutputWorker {
    ctx: Arc<Ctx>,
}

impl BuildOutputWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for BuildOutputWorker {
    fn queue(&self) -> &'static str {
        names::BUILD_OUTPUT
    }
    fn group(&self) -> &'static str {
        "patch-router"
    }
    fn component(&self) -> &'static str {
        "patch-router"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        PatchRouter::new(&self.ctx).handle_build_output(&record)
    }
}

/// `pov_reproduce_response_queue` → patch router (validation rounds).
pub struct ReproduceResponseWorker {
    ctx: Arc<Ctx>,
}

impl ReproduceResponseWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for ReproduceResponseWorker {
    fn queue(&self) -> &'static str {
        names::POV_REPRODUCE_RESPONSE
    }
    fn group(&self) -> &'static str {
        "patch-router"
    }
    fn component(&self) -> &'static str {
        "patch-router"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        PatchRouter::new(&self.ctx).handle_reproduce_response(&record)
    }
}

/// `task_delete_queue` → GC.
pub struct GcDeleteWorker {
    ctx: Arc<Ctx>,
}

impl GcDeleteWorker {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }
}

impl QueueWorker for GcDeleteWorker {
    fn queue(&self) -> &'static str {
        names::TASK_DELETE
    }
    fn group(&self) -> &'static str {
        "gc"
    }
    fn component(&self) -> &'static str {
        "gc"
    }
    fn handle(&mut self, delivery: &Delivery) -> Result<(), Failure> {
        let record = delivery
            .decode()
            .map_err(|e| decode_failure(self.component(), e))?;
        GcWorker::new(&self.ctx).handle_delete(&record)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crucible_types::{DeadLetter, TaskReady};

    use crate::config::CrucibleConfig;
    use crate::kv::MemoryKv;

    use super::*;

    struct FlakyWorker {
        fail_with: Option<FailureKind>,
        handled: usize,
    }

    impl QueueWorker for FlakyWorker {
        fn queue(&self) -> &'static str {
            "test_queue"
        }
        fn group(&self) -> &'static str {
            "test"
        }
        fn component(&self) -> &'static str {
            "test-worker"
        }
        fn handle(&mut self, _delivery: &Delivery) -> Result<(), Failure> {
            self.handled += 1;
            match self.fail_with {
                None => Ok(()),
                Some(kind) => Err(Failure::new(kind, "test-worker", "boom")),
            }
        }
    }

    fn test_ctx() -> Arc<Ctx> {
        let mut config = CrucibleConfig::default();
        // Immediate redelivery for transient-failure tests.
        config.timers.visibility_timeout = Duration::ZERO;
        Ctx::with_store(config, Arc::new(MemoryKv::new()))
    }

    fn push_one(ctx: &Ctx) {
        ctx.queues()
            .push("test_queue", &TaskReady {
                task_id: "t1".to_string(),
            })
            .unwrap();
    }

    fn reserve_and_process(ctx: &Ctx, worker: &mut FlakyWorker) {
        let deliveries = ctx
            .queues()
            .reserve("test_queue", "test", "c1", 1, Duration::ZERO)
            .unwrap();
        for delivery in deliveries {
            process_delivery(ctx, worker, &delivery).unwrap();
        }
    }

    #[test]
    fn success_acks_the_message() {
        let ctx = test_ctx();
        push_one(&ctx);
        let mut worker = FlakyWorker {
            fail_with: None,
            handled: 0,
        };

        reserve_and_process(&ctx, &mut worker);
        assert_eq!(worker.handled, 1);

        // Nothing to reclaim or redeliver.
        let again = ctx
            .queues()
            .reserve("test_queue", "test", "c2", 1, Duration::ZERO)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn validation_failure_dead_letters_and_acks() {
        let ctx = test_ctx();
        push_one(&ctx);
        let mut worker = FlakyWorker {
            fail_with: Some(FailureKind::Validation),
            handled: 0,
        };

        reserve_and_process(&ctx, &mut worker);

        let dead = ctx
            .queues()
            .reserve(names::DEAD_LETTER, "ops", "c1", 1, Duration::ZERO)
            .unwrap();
        assert_eq!(dead.len(), 1);
        let record: DeadLetter = dead[0].decode().unwrap();
        assert_eq!(record.source_queue, "test_queue");
        assert!(record.detail.contains("boom"));

        let again = ctx
            .queues()
            .reserve("test_queue", "test", "c2", 1, Duration::ZERO)
            .unwrap();
        assert!(again.is_empty(), "validation failures are not redelivered");
    }

    #[test]
    fn transient_failure_leaves_the_message_for_redelivery() {
        let ctx = test_ctx();
        push_one(&ctx);
        let mut worker = FlakyWorker {
            fail_with: Some(FailureKind::Transient),
            handled: 0,
        };

        reserve_and_process(&ctx, &mut worker);

        // Visibility timeout is zero: the message is immediately available.
        worker.fail_with = None;
        reserve_and_process(&ctx, &mut worker);
        assert_eq!(worker.handled, 2, "same message handled twice");
    }

    #[test]
    fn terminal_failure_acks_without_dead_letter() {
        let ctx = test_ctx();
        push_one(&ctx);
        let mut worker = FlakyWorker {
            fail_with: Some(FailureKind::Terminal),
            handled: 0,
        };

        reserve_and_process(&ctx, &mut worker);

        assert!(ctx.queues().is_empty(names::DEAD_LETTER).unwrap());
        let again = ctx
            .queues()
            .reserve("test_queue", "test", "c2", 1, Duration::ZERO)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn malformed_frames_from_real_workers_dead_letter() {
        let ctx = test_ctx();
        ctx.queues()
            .push_raw(names::TASK_DOWNLOAD, &[9, 9, 9])
            .unwrap();
        let mut worker = DownloadWorker::new(Arc::clone(&ctx));

        let deliveries = ctx
            .queues()
            .reserve(names::TASK_DOWNLOAD, "downloader", "c1", 1, Duration::ZERO)
            .unwrap();
        process_delivery(&ctx, &mut worker, &deliveries[0]).unwrap();

        let dead = ctx
            .queues()
            .reserve(names::DEAD_LETTER, "ops", "c1", 1, Duration::ZERO)
            .unwrap();
        assert_eq!(dead.len(), 1);
    }
}
