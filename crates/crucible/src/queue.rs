//! Queue fabric: named FIFO streams with consumer groups over the KV store.
//!
//! Delivery is at-least-once: a reserved message stays invisible to the rest
//! of its group until acknowledged or its visibility timeout lapses, after
//! which `reclaim` (or the next reserve) hands it to another consumer. All
//! consumers must therefore be idempotent on their side effects.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crucible_types::frame::{self, Framed};

use crate::kv::{KvStore, cas_loop};

/// Fixed queue names. Workers address queues by these constants only.
pub mod names {
    pub const TASK_DOWNLOAD: &str = "task_download_queue";
    pub const TASK_READY: &str = "task_ready_queue";
    pub const TASK_DELETE: &str = "task_delete_queue";
    pub const BUILD_REQUEST: &str = "build_request_queue";
    pub const BUILD_OUTPUT: &str = "build_output_queue";
    pub const RAW_CRASH: &str = "raw_crash_queue";
    pub const TRACER: &str = "tracer_queue";
    pub const TRACED_CRASH: &str = "traced_crash_queue";
    pub const CONFIRMED_VULNERABILITY: &str = "confirmed_vulnerability_queue";
    pub const PATCH_REQUEST: &str = "patch_request_queue";
    pub const PATCH_RESULT: &str = "patch_result_queue";
    pub const POV_REPRODUCE_REQUEST: &str = "pov_reproduce_request_queue";
    pub const POV_REPRODUCE_RESPONSE: &str = "pov_reproduce_response_queue";
    pub const SEED_INIT: &str = "seed_init_queue";
    pub const SEED_EXPLORE: &str = "seed_explore_queue";
    pub const VULN_DISCOVERY: &str = "vuln_discovery_queue";
    pub const DEAD_LETTER: &str = "dead_letter";

    pub const ALL: &[&str] = &[
        TASK_DOWNLOAD,
        TASK_READY,
        TASK_DELETE,
        BUILD_REQUEST,
        BUILD_OUTPUT,
        RAW_CRASH,
        TRACER,
        TRACED_CRASH,
        CONFIRMED_VULNERABILITY,
        PATCH_REQUEST,
        PATCH_RESULT,
        POV_REPRODUCE_REQUEST,
        POV_REPRODUCE_RESPONSE,
        SEED_INIT,
        SEED_EXPLORE,
        VULN_DISCOVERY,
        DEAD_LETTER,
    ];
}

/// Default visibility timeout for reserved messages.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// One delivered message: the monotone id plus the bare record value.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub msg_id: u64,
    pub bytes: Vec<u8>,
}

impl Delivery {
    pub fn decode<T: Framed>(&self) -> Result<T, frame::FrameError> {
        frame::decode_value(&self.bytes)
    }
}

/// Reservation bookkeeping for one (queue, group, msg) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingEntry {
    consumer: String,
    delivered_at: DateTime<Utc>,
    delivery_count: u32,
}

pub struct QueueFabric<'a> {
    kv: &'a dyn KvStore,
    visibility_timeout: Duration,
}

fn item_key(queue: &str, msg_id: u64) -> String {
    // Zero-padded so key order is id order.
    format!("queue:{queue}:item:{msg_id:020}")
}

fn next_id_key(queue: &str) -> String {
    format!("queue:{queue}:next")
}

fn cursor_key(queue: &str, group: &str) -> String {
    format!("queue:{queue}:group:{group}:cursor")
}

fn pending_key(queue: &str, group: &str, msg_id: u64) -> String {
    format!("queue:{queue}:group:{group}:pending:{msg_id:020}")
}

fn pending_prefix(queue: &str, group: &str) -> String {
    format!("queue:{queue}:group:{group}:pending:")
}

fn full_key(queue: &str) -> String {
    format!("queue:{queue}:full")
}

fn parse_u64(bytes: &[u8]) -> u64 {
    String::from_utf8_lossy(bytes).parse().unwrap_or(0)
}

fn parse_msg_id(key: &str) -> Option<u64> {
    key.rsplit(':').next()?.parse().ok()
}

impl<'a> QueueFabric<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self {
            kv,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility_timeout(kv: &'a dyn KvStore, visibility_timeout: Duration) -> Self {
        Self {
            kv,
            visibility_timeout,
        }
    }

    /// Append a record; returns its monotone message id.
    pub fn push<T: Framed>(&self, queue: &str, record: &T) -> Result<u64> {
        let bytes = frame::encode_value(record)
            .with_context(|| format!("failed to frame record for {queue}"))?;
        self.push_raw(queue, &bytes)
    }

    /// Append pre-framed bytes (CLI `send-queue` path).
    pub fn push_raw(&self, queue: &str, bytes: &[u8]) -> Result<u64> {
        let assigned = cas_loop(self.kv, &next_id_key(queue), |current| {
            let next = current.map(parse_u64).unwrap_or(1);
            Ok(Some((next + 1).to_string().into_bytes()))
        })?
        .map(|v| parse_u64(&v) - 1)
        .context("queue id counter vanished")?;

        self.kv.put(&item_key(queue, assigned), bytes)?;
        Ok(assigned)
    }

    /// Reserve up to `n` messages for `consumer` under `group`, blocking up
    /// to `block` while the queue is empty. Messages reserved by other
    /// consumers of the same group stay invisible until their visibility
    /// timeout lapses.
    pub fn reserve(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        n: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + block;
        loop {
            let mut out = self.reserve_expired(queue, group, consumer, n)?;
            if out.len() < n {
                out.extend(self.reserve_fresh(queue, group, consumer, n - out.len())?);
            }
            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Claim messages past the group cursor.
    fn reserve_fresh(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        n: usize,
    ) -> Result<Vec<Delivery>> {
        let mut out = Vec::new();
        while out.len() < n {
            let cursor_bytes = self.kv.get(&cursor_key(queue, group))?;
            let cursor = cursor_bytes.as_ref().map(|v| parse_u64(v)).unwrap_or(1);

            let items = self.kv.scan_prefix(&format!("queue:{queue}:item:"))?;
            let Some((key, bytes)) = items
                .into_iter()
                .find(|(k, _)| parse_msg_id(k).is_some_and(|id| id >= cursor))
            else {
                break;
            };
            let msg_id = parse_msg_id(&key).context("malformed queue item key")?;

            // Advance the cursor first; losing the race just retries.
            let claimed = self.kv.compare_and_swap(
                &cursor_key(queue, group),
                cursor_bytes.as_deref(),
                Some((msg_id + 1).to_string().as_bytes()),
            )?;
            if !claimed {
                continue;
            }

            let entry = PendingEntry {
                consumer: consumer.to_string(),
                delivered_at: Utc::now(),
                delivery_count: 1,
            };
            self.kv.put(
                &pending_key(queue, group, msg_id),
                &serde_json::to_vec(&entry)?,
            )?;
            out.push(Delivery { msg_id, bytes });
        }
        Ok(out)
    }

    /// Claim pending messages whose visibility timeout has lapsed.
    fn reserve_expired(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        n: usize,
    ) -> Result<Vec<Delivery>> {
        self.take_idle(queue, group, consumer, self.visibility_timeout, n)
    }

    /// Reassign pending messages idle longer than `idle`; crash recovery.
    pub fn reclaim(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        idle: Duration,
    ) -> Result<Vec<Delivery>> {
        self.take_idle(queue, group, consumer, idle, usize::MAX)
    }

    fn take_idle(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        idle: Duration,
        n: usize,
    ) -> Result<Vec<Delivery>> {
        let mut out = Vec::new();
        let now = Utc::now();
        for (key, value) in self.kv.scan_prefix(&pending_prefix(queue, group))? {
            if out.len() >= n {
                break;
            }
            let Ok(entry) = serde_json::from_slice::<PendingEntry>(&value) else {
                continue;
            };
            let age = (now - entry.delivered_at).to_std().unwrap_or(Duration::ZERO);
            if age < idle {
                continue;
            }
            let Some(msg_id) = parse_msg_id(&key) else {
                continue;
            };
            let Some(bytes) = self.kv.get(&item_key(queue, msg_id))? else {
                // Item purged underneath the reservation; drop the ghost.
                self.kv.delete(&key)?;
                continue;
            };
            let reassigned = PendingEntry {
                consumer: consumer.to_string(),
                delivered_at: now,
                delivery_count: entry.delivery_count + 1,
            };
            if self.kv.compare_and_swap(
                &key,
                Some(&value),
                Some(&serde_json::to_vec(&reassigned)?),
            )? {
                out.push(Delivery { msg_id, bytes });
            }
        }
        Ok(out)
    }

    /// Acknowledge a delivery, removing it from the group's pending set.
    pub fn ack(&self, queue: &str, group: &str, msg_id: u64) -> Result<()> {
        self.kv.delete(&pending_key(queue, group, msg_id))
    }

    /// Non-destructive read of up to `max` records from the head.
    pub fn peek(&self, queue: &str, max: usize) -> Result<Vec<(u64, Vec<u8>)>> {
        let items = self.kv.scan_prefix(&format!("queue:{queue}:item:"))?;
        Ok(items
            .into_iter()
            .filter_map(|(k, v)| parse_msg_id(&k).map(|id| (id, v)))
            .take(max)
            .collect())
    }

    /// Number of records currently held (acked history is trimmed by GC).
    pub fn len(&self, queue: &str) -> Result<usize> {
        Ok(self.kv.scan_prefix(&format!("queue:{queue}:item:"))?.len())
    }

    pub fn is_empty(&self, queue: &str) -> Result<bool> {
        Ok(self.len(queue)? == 0)
    }

    /// Queues with any backing state, in name order.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .kv
            .scan_prefix("queue:")?
            .into_iter()
            .filter_map(|(k, _)| k.split(':').nth(1).map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Remove a queue and all its group state.
    pub fn delete_queue(&self, queue: &str) -> Result<()> {
        for (key, _) in self.kv.scan_prefix(&format!("queue:{queue}:"))? {
            self.kv.delete(&key)?;
        }
        Ok(())
    }

    /// Drop every record belonging to `task_id`, along with its reservations.
    pub fn purge_task(&self, queue: &str, task_id: &str) -> Result<usize> {
        let mut purged = 0;
        for (key, value) in self.kv.scan_prefix(&format!("queue:{queue}:item:"))? {
            let belongs = frame::decode_value_any(&value)
                .ok()
                .and_then(|(_, json)| record_task_id(&json))
                .is_some_and(|id| id == task_id);
            if !belongs {
                continue;
            }
            let Some(msg_id) = parse_msg_id(&key) else {
                continue;
            };
            self.kv.delete(&key)?;
            for (pending, _) in self.kv.scan_prefix(&format!("queue:{queue}:group:"))? {
                if parse_msg_id(&pending) == Some(msg_id) && pending.contains(":pending:") {
                    self.kv.delete(&pending)?;
                }
            }
            purged += 1;
        }
        Ok(purged)
    }

    /// Drop an acked record's backing item once every group has moved past it.
    /// Called by GC; safe to skip, items are also removed by `purge_task` and
    /// `delete_queue`.
    pub fn trim_acked(&self, queue: &str) -> Result<usize> {
        let cursors: Vec<u64> = self
            .kv
            .scan_prefix(&format!("queue:{queue}:group:"))?
            .into_iter()
            .filter(|(k, _)| k.ends_with(":cursor"))
            .map(|(_, v)| parse_u64(&v))
            .collect();
        if cursors.is_empty() {
            return Ok(0);
        }
        let horizon = cursors.into_iter().min().unwrap_or(1);

        let pending_ids: Vec<u64> = self
            .kv
            .scan_prefix(&format!("queue:{queue}:group:"))?
            .into_iter()
            .filter(|(k, _)| k.contains(":pending:"))
            .filter_map(|(k, _)| parse_msg_id(&k))
            .collect();

        let mut trimmed = 0;
        for (key, _) in self.kv.scan_prefix(&format!("queue:{queue}:item:"))? {
            let Some(msg_id) = parse_msg_id(&key) else {
                continue;
            };
            if msg_id < horizon && !pending_ids.contains(&msg_id) {
                self.kv.delete(&key)?;
                trimmed += 1;
            }
        }
        Ok(trimmed)
    }

    /// Whether the queue is past its high-water mark. Sets or clears the
    /// advisory `full` key producers watch for back-pressure; the mark clears
    /// at half the threshold so producers do not flap.
    pub fn check_high_water(&self, queue: &str, mark: usize) -> Result<bool> {
        let len = self.len(queue)?;
        if len >= mark {
            self.kv.put(&full_key(queue), b"1")?;
            Ok(true)
        } else {
            if len <= mark / 2 {
                self.kv.delete(&full_key(queue))?;
            }
            Ok(self.kv.get(&full_key(queue))?.is_some())
        }
    }

    pub fn is_full(&self, queue: &str) -> Result<bool> {
        Ok(self.kv.get(&full_key(queue))?.is_some())
    }

    /// Drop a record to the dead-letter queue with a reason code.
    pub fn dead_letter(
        &self,
        source_queue: &str,
        reason: crucible_types::DeadLetterReason,
        detail: impl Into<String>,
        frame_bytes: Vec<u8>,
    ) -> Result<u64> {
        let record = crucible_types::DeadLetter {
            source_queue: source_queue.to_string(),
            reason,
            detail: detail.into(),
            frame: frame_bytes,
            at: Utc::now(),
        };
        self.push(names::DEAD_LETTER, &record)
    }
}

/// Extract the routing task id from an untyped record body, looking through
/// the envelope shapes used on the wire.
pub fn record_task_id(json: &serde_json::Value) -> Option<String> {
    if let Some(id) = json.get("task_id").and_then(|v| v.as_str()) {
        return Some(id.to_string());
    }
    for envelope in ["task", "crash", "request", "build"] {
        if let Some(id) = json
            .get(envelope)
            .and_then(|v| v.get("task_id"))
            .and_then(|v| v.as_str())
        {
            return Some(id.to_string());
        }
    }
    None
}
