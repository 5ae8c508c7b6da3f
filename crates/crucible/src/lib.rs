//! # Crucible
//!
//! The orchestration plane of an autonomous cyber reasoning system.
//!
//! Crucible consumes time-bounded analysis tasks (a source project, an
//! optional diff, fuzzing harnesses), coordinates stateless worker fleets
//! that discover vulnerabilities and synthesize patches, and submits
//! proofs-of-vulnerability, patches, and bundles to an external competition
//! API before each task's deadline.
//!
//! ## Guarantees
//!
//! - **Durable lifecycle** — every task is a state machine whose transitions
//!   are CAS-written to the shared KV store; any component can crash and the
//!   task resumes where it stood.
//! - **At-least-once queues, idempotent consumers** — the queue fabric
//!   redelivers unacknowledged reservations after a visibility timeout, and
//!   every consumer tolerates redelivery.
//! - **At-most-once external writes** — the submitter CAS-creates a pre-write
//!   marker before any POST and records server ids in the ledger before the
//!   next artifact is attempted; restarts recover by reference instead of
//!   re-POSTing.
//! - **Bounded concurrency** — one build per (task, type, sanitizer, patch)
//!   identity, one scheduler actor per task, token-bucket QPS toward the
//!   competition API.
//! - **Deadline pressure** — new patch requests freeze 10 minutes before the
//!   deadline; all submissions stop 1 minute before it.
//!
//! ## Pipeline
//!
//! Tasks flow **download → build → fuzz → dedup → trace → patch → validate →
//! submit → GC**:
//!
//! 1. [`downloader`] fetches and verifies sources into a content-addressed
//!    blob cache and publishes `task_ready`.
//! 2. [`builder`] dispatches the external build tool, one build per identity.
//! 3. [`weights`] biases the fuzzer fleet across harnesses.
//! 4. [`dedup`] collapses raw crashes to one canonical crash per token and
//!    promotes traced crashes to confirmed vulnerabilities.
//! 5. [`router`] pairs vulnerabilities with patch workers and drives each
//!    candidate through builds and PoV reproduction.
//! 6. [`scheduler`] interprets all of the above as per-task state machine
//!    transitions.
//! 7. [`submitter`] serialises external submissions and polls grading
//!    results.
//! 8. [`gc`] honours cancellation and sweeps terminal tasks.
//!
//! ## Modules
//!
//! - [`kv`] — shared KV store trait with in-memory and filesystem backends
//! - [`queue`] — FIFO streams with consumer groups over the KV store
//! - [`catalog`] — typed registry catalogues (tasks, builds, crashes, ...)
//! - [`config`] — `crucible.toml` + environment configuration
//! - [`context`] — the explicit per-process context object
//! - [`events`] — per-task append-only JSONL audit log
//! - [`process`] — subprocess execution with deadlines and SIGTERM/SIGKILL
//! - [`api`] — competition API client
//! - [`worker`] — the reserve → handle → ack harness and fleet workers
//!
//! The wire records live in the `crucible-types` crate; retry strategies in
//! `crucible-retry`.

pub mod api;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod context;
pub mod dedup;
pub mod downloader;
pub mod events;
pub mod gc;
pub mod kv;
pub mod process;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod submitter;
pub mod weights;
pub mod worker;

pub use config::CrucibleConfig;
pub use context::{CancelToken, Ctx, init_logging};
