//! Output seam for finalized buckets.

use std::fs;
use std::path::{Path, PathBuf};

use steplog_types::StepEvent;
use tracing::info;

use crate::bucket::BucketSet;

/// Errors that can occur while writing analysis output.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// Creating or writing an output file failed.
    #[error("analysis output I/O failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Buckets or steps could not be encoded.
    #[error("analysis output serialization failed: {source}")]
    Serialization {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },
}

/// Receives the finalized buckets of each analysis.
pub trait BucketSink {
    /// Store one analysis' buckets and, if it kept them, its accepted steps.
    fn write(&mut self, set: &BucketSet, retained: &[StepEvent]) -> Result<(), OutputError>;
}

/// Writes `<dir>/<analysis>.json` and, when steps were kept,
/// `<dir>/<analysis>-steps.json`.
#[derive(Debug, Clone)]
pub struct JsonBucketSink {
    dir: PathBuf,
}

impl JsonBucketSink {
    /// Create a sink writing into `dir`, creating the directory if needed.
    pub fn create(dir: &Path) -> Result<Self, OutputError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the bucket file for an analysis.
    pub fn buckets_path(&self, analysis: &str) -> PathBuf {
        self.dir.join(format!("{analysis}.json"))
    }

    /// Path of the retained-steps file for an analysis.
    pub fn steps_path(&self, analysis: &str) -> PathBuf {
        self.dir.join(format!("{analysis}-steps.json"))
    }
}

impl BucketSink for JsonBucketSink {
    fn write(&mut self, set: &BucketSet, retained: &[StepEvent]) -> Result<(), OutputError> {
        let path = self.buckets_path(&set.analysis);
        fs::write(&path, serde_json::to_vec_pretty(set)?)?;
        info!(
            analysis = %set.analysis,
            buckets = set.len(),
            events = set.events,
            path = %path.display(),
            "buckets written"
        );
        if !retained.is_empty() {
            let steps_path = self.steps_path(&set.analysis);
            fs::write(&steps_path, serde_json::to_vec(retained)?)?;
            info!(
                analysis = %set.analysis,
                steps = retained.len(),
                path = %steps_path.display(),
                "retained steps written"
            );
        }
        Ok(())
    }
}

/// Keeps written bucket sets in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucketSink {
    sets: Vec<BucketSet>,
    retained: Vec<Vec<StepEvent>>,
}

impl MemoryBucketSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket sets written so far, in write order.
    pub fn sets(&self) -> &[BucketSet] {
        &self.sets
    }

    /// Retained steps written alongside each set.
    pub fn retained(&self) -> &[Vec<StepEvent>] {
        &self.retained
    }

    /// The set written by a named analysis.
    pub fn set(&self, analysis: &str) -> Option<&BucketSet> {
        self.sets.iter().find(|set| set.analysis == analysis)
    }
}

impl BucketSink for MemoryBucketSink {
    fn write(&mut self, set: &BucketSet, retained: &[StepEvent]) -> Result<(), OutputError> {
        self.sets.push(set.clone());
        self.retained.push(retained.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use steplog_types::{StepObservation, TrackId, VolumeId};

    use super::*;
    use crate::bucket::{Bucket, CategoryBucket};

    #[test]
    fn json_sink_writes_buckets_and_steps() {
        let dir = std::env::temp_dir().join(format!("steplog-output-{}", uuid::Uuid::new_v4()));
        let mut sink = JsonBucketSink::create(&dir).unwrap();

        let mut set = BucketSet::new("step_statistics");
        let mut bucket = CategoryBucket::new();
        bucket.fill("TPC", 4.0);
        set.insert("steps_per_module", Bucket::Category(bucket));
        let obs = StepObservation::new(VolumeId(1), TrackId(1));
        let steps = vec![StepEvent::from_observation(0, &obs, 0)];

        sink.write(&set, &steps).unwrap();

        let written = fs::read_to_string(sink.buckets_path("step_statistics")).unwrap();
        let back: BucketSet = serde_json::from_str(&written).unwrap();
        assert_eq!(back, set);
        assert!(sink.steps_path("step_statistics").exists());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn json_sink_skips_empty_step_file() {
        let dir = std::env::temp_dir().join(format!("steplog-output-{}", uuid::Uuid::new_v4()));
        let mut sink = JsonBucketSink::create(&dir).unwrap();
        sink.write(&BucketSet::new("empty"), &[]).unwrap();
        assert!(sink.buckets_path("empty").exists());
        assert!(!sink.steps_path("empty").exists());
        fs::remove_dir_all(dir).ok();
    }
}
