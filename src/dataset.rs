use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::Path;

use crate::types::Sample;

/// Fixed-capacity ring buffer of labelled samples. Adding to a full buffer
/// silently evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct Dataset {
    samples: VecDeque<Sample>,
    capacity: usize,
    total_added: u64,
}

impl Dataset {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total_added: 0,
        }
    }

    pub fn add(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total_added += 1;
    }

    /// Owned copy, oldest first.
    pub fn to_snapshot(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples ever added, evicted ones included.
    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(&self.samples)?;
        std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("Saved {} samples to {}", self.samples.len(), path.display());
        Ok(())
    }

    /// Reads a saved dataset. Only the most recent `capacity` samples are kept.
    pub fn load(path: &Path, capacity: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let samples: Vec<Sample> =
            serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;

        let mut dataset = Self::new(capacity);
        for sample in samples {
            dataset.add(sample);
        }
        tracing::info!(
            "Loaded {} samples from {} (capacity {})",
            dataset.len(),
            path.display(),
            dataset.capacity
        );
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::sample;
    use crate::types::Coord;

    fn ids(samples: &[Sample]) -> Vec<f32> {
        samples.iter().map(|s| s.landmarks.points()[0].x).collect()
    }

    #[test]
    fn keeps_most_recent_in_order() {
        let capacity = 5;
        let mut ds = Dataset::new(capacity);
        for n in 1..=12usize {
            ds.add(sample(n as f32, Some(Coord::default())));
            assert!(ds.len() <= capacity);

            let first = n.saturating_sub(capacity) + 1;
            let expected: Vec<f32> = (first..=n).map(|i| i as f32).collect();
            assert_eq!(ids(&ds.to_snapshot()), expected, "after {n} adds");
        }
        assert_eq!(ds.total_added(), 12);
    }

    #[test]
    fn snapshot_is_detached() {
        let mut ds = Dataset::new(3);
        ds.add(sample(1.0, None));
        let snap = ds.to_snapshot();
        ds.add(sample(2.0, None));
        assert_eq!(snap.len(), 1);
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn load_truncates_to_capacity() {
        let path = std::env::temp_dir().join(format!("rusty_gaze_dataset_{}.json", std::process::id()));
        let mut ds = Dataset::new(10);
        for i in 0..6 {
            ds.add(sample(i as f32, Some(Coord::new(0.1, -0.1))));
        }
        ds.save(&path).unwrap();

        let loaded = Dataset::load(&path, 4).unwrap();
        assert_eq!(ids(&loaded.to_snapshot()), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(loaded.to_snapshot()[0].target, Some(Coord::new(0.1, -0.1)));
        let _ = std::fs::remove_file(&path);
    }
}
