//! Registry catalogues: typed key→record maps over the KV store.
//!
//! Keys are `<catalogue>:<key-parts-joined-by-slash>`; values carry the frame
//! version byte at offset 0 so stored records can be migrated. All mutation
//! goes through compare-and-swap; `update` retries conflicts with jittered
//! backoff and surfaces persistent conflicts as transient errors.

use std::marker::PhantomData;

use anyhow::{Context, Result};

use crucible_types::frame::{self, Framed};
use crucible_types::{
    BuildOutput, BuildRef, ConfirmedVulnerability, Crash, DownloadedSources, SubmissionEntry,
    TaskRecord, WeightedHarness,
};

use crate::kv::{KvStore, cas_loop};

pub struct Catalogue<'a, T: Framed> {
    kv: &'a dyn KvStore,
    name: &'static str,
    _record: PhantomData<T>,
}

pub fn tasks(kv: &dyn KvStore) -> Catalogue<'_, TaskRecord> {
    Catalogue::new(kv, "tasks")
}

pub fn downloaded(kv: &dyn KvStore) -> Catalogue<'_, DownloadedSources> {
    Catalogue::new(kv, "downloaded")
}

pub fn builds(kv: &dyn KvStore) -> Catalogue<'_, BuildOutput> {
    Catalogue::new(kv, "builds")
}

pub fn harness_weights(kv: &dyn KvStore) -> Catalogue<'_, WeightedHarness> {
    Catalogue::new(kv, "harness_weights")
}

pub fn crashes(kv: &dyn KvStore) -> Catalogue<'_, Crash> {
    Catalogue::new(kv, "crashes")
}

pub fn vulnerabilities(kv: &dyn KvStore) -> Catalogue<'_, ConfirmedVulnerability> {
    Catalogue::new(kv, "vulnerabilities")
}

pub fn submissions(kv: &dyn KvStore) -> Catalogue<'_, SubmissionEntry> {
    Catalogue::new(kv, "submissions")
}

/// Key parts for the builds catalogue, in stable order.
pub fn build_parts(build: &BuildRef) -> Vec<String> {
    let mut parts = vec![
        build.task_id.clone(),
        build.build_type.as_str().to_string(),
        build.sanitizer.clone(),
    ];
    if let Some(ipid) = &build.internal_patch_id {
        parts.push(ipid.clone());
    }
    parts
}

impl<'a, T: Framed> Catalogue<'a, T> {
    pub fn new(kv: &'a dyn KvStore, name: &'static str) -> Self {
        Self {
            kv,
            name,
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn key(&self, parts: &[&str]) -> String {
        format!("{}:{}", self.name, parts.join("/"))
    }

    pub fn get(&self, parts: &[&str]) -> Result<Option<T>> {
        let key = self.key(parts);
        match self.kv.get(&key)? {
            Some(bytes) => {
                let record = frame::decode_value(&bytes)
                    .with_context(|| format!("corrupt catalogue value at {key}"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn put(&self, parts: &[&str], value: &T) -> Result<()> {
        let bytes = frame::encode_value(value)
            .with_context(|| format!("failed to frame {} record", self.name))?;
        self.kv.put(&self.key(parts), &bytes)
    }

    /// First-writer-wins insert. Returns false when the key already exists.
    pub fn insert_if_absent(&self, parts: &[&str], value: &T) -> Result<bool> {
        let bytes = frame::encode_value(value)
            .with_context(|| format!("failed to frame {} record", self.name))?;
        self.kv
            .compare_and_swap(&self.key(parts), None, Some(&bytes))
    }

    /// Atomic read-modify-write. The closure sees the current record (if any)
    /// and returns the replacement; returning `None` deletes the entry.
    pub fn update<F>(&self, parts: &[&str], mut f: F) -> Result<Option<T>>
    where
        F: FnMut(Option<T>) -> Result<Option<T>>,
    {
        let key = self.key(parts);
        let name = self.name;
        let updated = cas_loop(self.kv, &key, |current| {
            let record = match current {
                Some(bytes) => Some(
                    frame::decode_value(bytes)
                        .with_context(|| format!("corrupt catalogue value at {key}"))?,
                ),
                None => None,
            };
            match f(record)? {
                Some(next) => Ok(Some(
                    frame::encode_value(&next)
                        .with_context(|| format!("failed to frame {name} record"))?,
                )),
                None => Ok(None),
            }
        })?;
        match updated {
            Some(bytes) => Ok(Some(frame::decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, parts: &[&str]) -> Result<()> {
        self.kv.delete(&self.key(parts))
    }

    fn scan_prefix_for(&self, parts: &[&str]) -> String {
        if parts.is_empty() {
            format!("{}:", self.name)
        } else {
            // Trailing slash so "t1" does not also match "t10".
            format!("{}:{}/", self.name, parts.join("/"))
        }
    }

    /// All records under the given key parts, in key order. Empty parts scan
    /// the whole catalogue.
    pub fn scan(&self, parts: &[&str]) -> Result<Vec<(String, T)>> {
        let prefix = self.scan_prefix_for(parts);
        let mut out = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(&prefix)? {
            let record = frame::decode_value(&bytes)
                .with_context(|| format!("corrupt catalogue value at {key}"))?;
            out.push((key, record));
        }
        Ok(out)
    }

    /// Delete every record under the given parts. Returns how many went.
    pub fn clear(&self, parts: &[&str]) -> Result<usize> {
        let prefix = self.scan_prefix_for(parts);
        let mut cleared = 0;
        for (key, _) in self.kv.scan_prefix(&prefix)? {
            self.kv.delete(&key)?;
            cleared += 1;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use chrono::Utc;
    use crucible_types::{BuildOutcome, BuildType, Task, TaskState, TaskType};

    use crate::kv::MemoryKv;

    use super::*;

    fn sample_record(task_id: &str) -> TaskRecord {
        TaskRecord {
            task: Task {
                task_id: task_id.to_string(),
                task_type: TaskType::Full,
                project_name: "demo".to_string(),
                focus: None,
                deadline: Utc::now() + chrono::Duration::minutes(30),
                sources: vec![],
                metadata: BTreeMap::new(),
                cancelled: false,
            },
            state: TaskState::Pending,
            counters: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn put_get_round_trips_through_frames() {
        let kv = MemoryKv::new();
        let cat = tasks(&kv);
        cat.put(&["t1"], &sample_record("t1")).unwrap();

        let loaded = cat.get(&["t1"]).unwrap().expect("present");
        assert_eq!(loaded.task.task_id, "t1");
        assert_eq!(loaded.state, TaskState::Pending);
    }

    #[test]
    fn stored_value_has_version_byte_at_offset_zero() {
        let kv = MemoryKv::new();
        tasks(&kv).put(&["t1"], &sample_record("t1")).unwrap();
        let raw = kv.get("tasks:t1").unwrap().expect("raw value");
        assert_eq!(raw[0], frame::FRAME_VERSION);
    }

    #[test]
    fn insert_if_absent_is_first_writer_wins() {
        let kv = MemoryKv::new();
        let cat = tasks(&kv);
        assert!(cat.insert_if_absent(&["t1"], &sample_record("t1")).unwrap());
        assert!(!cat.insert_if_absent(&["t1"], &sample_record("t1")).unwrap());
    }

    #[test]
    fn update_applies_read_modify_write() {
        let kv = MemoryKv::new();
        let cat = tasks(&kv);
        cat.put(&["t1"], &sample_record("t1")).unwrap();

        let updated = cat
            .update(&["t1"], |record| {
                let mut record = record.expect("present");
                record.state = TaskState::Downloading;
                Ok(Some(record))
            })
            .unwrap()
            .expect("updated");
        assert_eq!(updated.state, TaskState::Downloading);
        assert_eq!(
            cat.get(&["t1"]).unwrap().unwrap().state,
            TaskState::Downloading
        );
    }

    #[test]
    fn update_with_none_deletes() {
        let kv = MemoryKv::new();
        let cat = tasks(&kv);
        cat.put(&["t1"], &sample_record("t1")).unwrap();

        let gone = cat.update(&["t1"], |_| Ok(None)).unwrap();
        assert!(gone.is_none());
        assert!(cat.get(&["t1"]).unwrap().is_none());
    }

    #[test]
    fn scan_is_scoped_to_the_catalogue() {
        let kv = MemoryKv::new();
        tasks(&kv).put(&["t1"], &sample_record("t1")).unwrap();
        tasks(&kv).put(&["t2"], &sample_record("t2")).unwrap();
        downloaded(&kv)
            .put(
                &["t1"],
                &DownloadedSources {
                    task_id: "t1".to_string(),
                    sources: vec![],
                },
            )
            .unwrap();

        assert_eq!(tasks(&kv).scan(&[]).unwrap().len(), 2);
        assert_eq!(downloaded(&kv).scan(&[]).unwrap().len(), 1);
    }

    #[test]
    fn clear_removes_only_the_given_prefix() {
        let kv = MemoryKv::new();
        let cat = crashes(&kv);
        let crash = Crash {
            crash_id: "c1".to_string(),
            task_id: "t1".to_string(),
            target: BuildRef {
                task_id: "t1".to_string(),
                build_type: BuildType::Fuzzer,
                sanitizer: "address".to_string(),
                internal_patch_id: None,
            },
            harness_name: "h".to_string(),
            crash_input: PathBuf::from("/in"),
            stacktrace: String::new(),
            crash_token: "tok".to_string(),
        };
        cat.put(&["t1", "tok-a"], &crash).unwrap();
        cat.put(&["t1", "tok-b"], &crash).unwrap();
        cat.put(&["t2", "tok-a"], &crash).unwrap();

        assert_eq!(cat.clear(&["t1"]).unwrap(), 2);
        assert_eq!(cat.scan(&[]).unwrap().len(), 1);
    }

    #[test]
    fn build_parts_includes_patch_id_when_present() {
        let base = BuildRef {
            task_id: "t1".to_string(),
            build_type: BuildType::Fuzzer,
            sanitizer: "address".to_string(),
            internal_patch_id: None,
        };
        assert_eq!(build_parts(&base), vec!["t1", "fuzzer", "address"]);

        let patched = BuildRef {
            build_type: BuildType::Patch,
            internal_patch_id: Some("ipid".to_string()),
            ..base
        };
        assert_eq!(build_parts(&patched), vec!["t1", "patch", "address", "ipid"]);
    }

    #[test]
    fn builds_catalogue_stores_placeholders() {
        let kv = MemoryKv::new();
        let cat = builds(&kv);
        let build = BuildRef {
            task_id: "t1".to_string(),
            build_type: BuildType::Fuzzer,
            sanitizer: "address".to_string(),
            internal_patch_id: None,
        };
        let parts = build_parts(&build);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let placeholder = BuildOutput {
            build: build.clone(),
            engine: "libfuzzer".to_string(),
            task_dir: PathBuf::from("/scratch/t1/build-fuzzer-address"),
            apply_diff: false,
            outcome: BuildOutcome::Pending,
            started_at: Utc::now(),
        };

        assert!(cat.insert_if_absent(&parts, &placeholder).unwrap());
        assert!(!cat.insert_if_absent(&parts, &placeholder).unwrap());
        let loaded = cat.get(&parts).unwrap().unwrap();
        assert_eq!(loaded.outcome, BuildOutcome::Pending);
    }
}
