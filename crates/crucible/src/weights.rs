//! Harness-weight allocator.
//!
//! One float weight per (task, package, harness). Fuzzer workers sample
//! harnesses proportional to weight; feedback loops scale weights
//! multiplicatively, clamped to [0, 1000]. A zero weight suspends scheduling
//! for that harness until something raises it again.

use anyhow::Result;
use rand::Rng;
use rand::RngExt;

use crucible_types::WeightedHarness;

use crate::catalog;
use crate::kv::KvStore;

pub const INITIAL_WEIGHT: f64 = 1.0;
pub const MAX_WEIGHT: f64 = 1000.0;

pub struct WeightAllocator<'a> {
    kv: &'a dyn KvStore,
}

impl<'a> WeightAllocator<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self { kv }
    }

    /// Register the declared harnesses of a task at the initial weight.
    /// Already-known harnesses keep their current weight.
    pub fn init_task(&self, task_id: &str, harnesses: &[(String, String)]) -> Result<()> {
        let catalogue = catalog::harness_weights(self.kv);
        for (package, harness) in harnesses {
            let record = WeightedHarness {
                task_id: task_id.to_string(),
                package: package.clone(),
                harness: harness.clone(),
                weight: INITIAL_WEIGHT,
            };
            catalogue.insert_if_absent(&[task_id, package, harness], &record)?;
        }
        Ok(())
    }

    /// Multiply a harness weight by `factor`, clamping into [0, 1000].
    /// Unknown harnesses are created at the clamped factor so feedback can
    /// arrive before registration.
    pub fn scale(&self, task_id: &str, package: &str, harness: &str, factor: f64) -> Result<f64> {
        let updated = catalog::harness_weights(self.kv).update(
            &[task_id, package, harness],
            |current| {
                let weight = current.map(|w| w.weight).unwrap_or(INITIAL_WEIGHT);
                let scaled = (weight * factor).clamp(0.0, MAX_WEIGHT);
                Ok(Some(WeightedHarness {
                    task_id: task_id.to_string(),
                    package: package.to_string(),
                    harness: harness.to_string(),
                    weight: scaled,
                }))
            },
        )?;
        Ok(updated.map(|w| w.weight).unwrap_or(0.0))
    }

    /// Set an absolute weight (operator surface), clamped like `scale`.
    pub fn set(&self, record: &WeightedHarness) -> Result<()> {
        let clamped = WeightedHarness {
            weight: record.weight.clamp(0.0, MAX_WEIGHT),
            ..record.clone()
        };
        catalog::harness_weights(self.kv).put(
            &[&record.task_id, &record.package, &record.harness],
            &clamped,
        )
    }

    /// All weights for a task, in key order.
    pub fn for_task(&self, task_id: &str) -> Result<Vec<WeightedHarness>> {
        Ok(catalog::harness_weights(self.kv)
            .scan(&[task_id])?
            .into_iter()
            .map(|(_, w)| w)
            .collect())
    }

    /// All registered weights.
    pub fn all(&self) -> Result<Vec<WeightedHarness>> {
        Ok(catalog::harness_weights(self.kv)
            .scan(&[])?
            .into_iter()
            .map(|(_, w)| w)
            .collect())
    }

    /// Sample a harness proportional to weight. Zero-weight harnesses are
    /// never chosen; returns None when nothing is schedulable.
    pub fn sample<R: Rng>(&self, task_id: &str, rng: &mut R) -> Result<Option<WeightedHarness>> {
        let weights = self.for_task(task_id)?;
        let total: f64 = weights.iter().map(|w| w.weight).sum();
        if total <= 0.0 {
            return Ok(None);
        }
        let mut point = rng.random_range(0.0..total);
        for record in weights {
            if record.weight <= 0.0 {
                continue;
            }
            if point < record.weight {
                return Ok(Some(record));
            }
            point -= record.weight;
        }
        Ok(None)
    }

    /// Drop all weights for a task (GC).
    pub fn clear_task(&self, task_id: &str) -> Result<usize> {
        catalog::harness_weights(self.kv).clear(&[task_id])
    }
}

#[cfg(test)]
mod tests {
    use crate::kv::MemoryKv;

    use super::*;

    fn harnesses(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn init_task_sets_initial_weight_once() {
        let kv = MemoryKv::new();
        let allocator = WeightAllocator::new(&kv);
        allocator
            .init_task("t1", &harnesses(&[("pkg", "fuzz_a"), ("pkg", "fuzz_b")]))
            .unwrap();

        let weights = allocator.for_task("t1").unwrap();
        assert_eq!(weights.len(), 2);
        assert!(weights.iter().all(|w| w.weight == INITIAL_WEIGHT));

        // Re-registration does not reset tuned weights.
        allocator.scale("t1", "pkg", "fuzz_a", 4.0).unwrap();
        allocator
            .init_task("t1", &harnesses(&[("pkg", "fuzz_a")]))
            .unwrap();
        let weights = allocator.for_task("t1").unwrap();
        let tuned = weights.iter().find(|w| w.harness == "fuzz_a").unwrap();
        assert_eq!(tuned.weight, 4.0);
    }

    #[test]
    fn scale_multiplies_and_clamps() {
        let kv = MemoryKv::new();
        let allocator = WeightAllocator::new(&kv);
        allocator
            .init_task("t1", &harnesses(&[("pkg", "fuzz_a")]))
            .unwrap();

        assert_eq!(allocator.scale("t1", "pkg", "fuzz_a", 2.0).unwrap(), 2.0);
        assert_eq!(
            allocator.scale("t1", "pkg", "fuzz_a", 1e9).unwrap(),
            MAX_WEIGHT
        );
        assert_eq!(allocator.scale("t1", "pkg", "fuzz_a", 0.0).unwrap(), 0.0);
    }

    #[test]
    fn zero_weight_suspends_until_raised() {
        let kv = MemoryKv::new();
        let allocator = WeightAllocator::new(&kv);
        allocator
            .init_task("t1", &harnesses(&[("pkg", "fuzz_a")]))
            .unwrap();
        allocator.scale("t1", "pkg", "fuzz_a", 0.0).unwrap();

        let mut rng = rand::rng();
        assert!(allocator.sample("t1", &mut rng).unwrap().is_none());

        // Multiplying zero stays zero; an absolute set resumes scheduling.
        assert_eq!(allocator.scale("t1", "pkg", "fuzz_a", 10.0).unwrap(), 0.0);
        allocator
            .set(&WeightedHarness {
                task_id: "t1".to_string(),
                package: "pkg".to_string(),
                harness: "fuzz_a".to_string(),
                weight: 1.0,
            })
            .unwrap();
        assert!(allocator.sample("t1", &mut rng).unwrap().is_some());
    }

    #[test]
    fn sample_is_proportional_to_weight() {
        let kv = MemoryKv::new();
        let allocator = WeightAllocator::new(&kv);
        allocator
            .init_task("t1", &harnesses(&[("pkg", "heavy"), ("pkg", "light")]))
            .unwrap();
        allocator.scale("t1", "pkg", "heavy", 99.0).unwrap();

        let mut rng = rand::rng();
        let mut heavy_hits = 0;
        for _ in 0..500 {
            let pick = allocator.sample("t1", &mut rng).unwrap().expect("pick");
            if pick.harness == "heavy" {
                heavy_hits += 1;
            }
        }
        assert!(heavy_hits > 400, "heavy harness picked {heavy_hits}/500");
    }

    #[test]
    fn sampling_ignores_other_tasks() {
        let kv = MemoryKv::new();
        let allocator = WeightAllocator::new(&kv);
        allocator
            .init_task("t1", &harnesses(&[("pkg", "fuzz_a")]))
            .unwrap();
        allocator
            .init_task("t2", &harnesses(&[("pkg", "fuzz_b")]))
            .unwrap();

        let mut rng = rand::rng();
        for _ in 0..20 {
            let pick = allocator.sample("t1", &mut rng).unwrap().expect("pick");
            assert_eq!(pick.task_id, "t1");
        }
    }

    #[test]
    fn clear_task_removes_all_weights() {
        let kv = MemoryKv::new();
        let allocator = WeightAllocator::new(&kv);
        allocator
            .init_task("t1", &harnesses(&[("pkg", "a"), ("pkg", "b")]))
            .unwrap();

        assert_eq!(allocator.clear_task("t1").unwrap(), 2);
        assert!(allocator.for_task("t1").unwrap().is_empty());
    }
}
