//! Persistence seam for Stream-mode flushes.
//!
//! At every Stream-mode flush the aggregators hand a [`PersistRequest`] to
//! a [`RecordSink`]. The bundled [`JsonLinesSink`] writes one JSON object
//! per request to a file; [`read_records`] loads such a file back as
//! [`PersistedRecord`] values so an analysis can be replayed offline.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steplog_types::{FieldQueryEvent, StepEvent};
use tracing::{debug, info};
use uuid::Uuid;

use crate::lookup::LookupTables;

/// Errors that can occur while persisting or reloading records.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Reading or writing the record file failed.
    #[error("record I/O failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("record serialization failed: {source}")]
    Serialization {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },
}

/// One flush worth of data handed to a [`RecordSink`].
#[derive(Debug, Clone, Copy)]
pub enum PersistRequest<'a> {
    /// An event's steps together with the lookup tables that resolve them.
    Steps {
        /// Zero-based event number.
        event: u64,
        /// Steps in sequence order.
        steps: &'a [StepEvent],
        /// Lookup tables at the time of the flush.
        lookups: &'a LookupTables,
    },
    /// An event's field queries.
    Fields {
        /// Zero-based event number.
        event: u64,
        /// Queries in evaluation order.
        queries: &'a [FieldQueryEvent],
    },
}

impl PersistRequest<'_> {
    /// Number of step or field records carried.
    pub const fn len(&self) -> usize {
        match self {
            Self::Steps { steps, .. } => steps.len(),
            Self::Fields { queries, .. } => queries.len(),
        }
    }

    /// Whether the request carries no records.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the request into an owned record.
    pub fn to_record(&self, run_id: Uuid) -> PersistedRecord {
        match *self {
            Self::Steps {
                event,
                steps,
                lookups,
            } => PersistedRecord::Steps {
                header: RecordHeader::new(run_id, event),
                steps: steps.to_vec(),
                lookups: lookups.clone(),
            },
            Self::Fields { event, queries } => PersistedRecord::Fields {
                header: RecordHeader::new(run_id, event),
                queries: queries.to_vec(),
            },
        }
    }
}

/// Receives Stream-mode flushes.
pub trait RecordSink {
    /// Store one flush.
    fn persist(&mut self, request: PersistRequest<'_>) -> Result<(), PersistError>;

    /// Make everything stored so far durable. Called at shutdown.
    fn finish(&mut self) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Identifies the run and event a persisted record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Run identifier, shared by every record of one run.
    pub run_id: Uuid,
    /// Zero-based event number.
    pub event: u64,
    /// Wall-clock time the record was produced.
    pub written_at: DateTime<Utc>,
}

impl RecordHeader {
    /// Header for `event` stamped with the current time.
    pub fn new(run_id: Uuid, event: u64) -> Self {
        Self {
            run_id,
            event,
            written_at: Utc::now(),
        }
    }
}

/// A record as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedRecord {
    /// An event's steps and lookup tables.
    Steps {
        /// Run and event identification.
        header: RecordHeader,
        /// Steps in sequence order.
        steps: Vec<StepEvent>,
        /// Lookup tables at the time of the flush.
        lookups: LookupTables,
    },
    /// An event's field queries.
    Fields {
        /// Run and event identification.
        header: RecordHeader,
        /// Queries in evaluation order.
        queries: Vec<FieldQueryEvent>,
    },
}

impl PersistedRecord {
    /// Header of the record.
    pub const fn header(&self) -> &RecordHeader {
        match self {
            Self::Steps { header, .. } | Self::Fields { header, .. } => header,
        }
    }
}

/// Borrowed mirror of [`PersistedRecord`] so writing never clones steps.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordRef<'a> {
    Steps {
        header: RecordHeader,
        steps: &'a [StepEvent],
        lookups: &'a LookupTables,
    },
    Fields {
        header: RecordHeader,
        queries: &'a [FieldQueryEvent],
    },
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn persist(&mut self, _request: PersistRequest<'_>) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Keeps owned copies of every flush in memory.
#[derive(Debug, Clone)]
pub struct MemorySink {
    run_id: Uuid,
    records: Vec<PersistedRecord>,
    finished: bool,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    /// Create an empty sink with a fresh run identifier.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            records: Vec::new(),
            finished: false,
        }
    }

    /// Records stored so far.
    pub fn records(&self) -> &[PersistedRecord] {
        &self.records
    }

    /// Whether [`RecordSink::finish`] has been called.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl RecordSink for MemorySink {
    fn persist(&mut self, request: PersistRequest<'_>) -> Result<(), PersistError> {
        self.records.push(request.to_record(self.run_id));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PersistError> {
        self.finished = true;
        Ok(())
    }
}

/// Writes one JSON object per flush to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    run_id: Uuid,
    writer: BufWriter<File>,
    written: u64,
}

impl JsonLinesSink {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: &Path) -> Result<Self, PersistError> {
        let file = File::create(path)?;
        let run_id = Uuid::now_v7();
        info!(path = %path.display(), %run_id, "stream sink opened");
        Ok(Self {
            path: path.to_path_buf(),
            run_id,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Identifier stamped on every record of this run.
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Number of records written so far.
    pub const fn written(&self) -> u64 {
        self.written
    }
}

impl RecordSink for JsonLinesSink {
    fn persist(&mut self, request: PersistRequest<'_>) -> Result<(), PersistError> {
        let record = match request {
            PersistRequest::Steps {
                event,
                steps,
                lookups,
            } => RecordRef::Steps {
                header: RecordHeader::new(self.run_id, event),
                steps,
                lookups,
            },
            PersistRequest::Fields { event, queries } => RecordRef::Fields {
                header: RecordHeader::new(self.run_id, event),
                queries,
            },
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.written = self.written.saturating_add(1);
        debug!(records = request.len(), "flush persisted");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PersistError> {
        self.writer.flush()?;
        info!(path = %self.path.display(), records = self.written, "stream sink closed");
        Ok(())
    }
}

/// Load every record from a JSON-lines file written by [`JsonLinesSink`].
pub fn read_records(path: &Path) -> Result<Vec<PersistedRecord>, PersistError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use steplog_types::{StepObservation, TrackId, VolumeId};

    use super::*;

    fn sample_steps() -> Vec<StepEvent> {
        (0..3)
            .map(|seq| {
                let obs = StepObservation::new(VolumeId(10), TrackId(1)).with_energy(1.5);
                StepEvent::from_observation(seq, &obs, 100)
            })
            .collect()
    }

    #[test]
    fn memory_sink_keeps_owned_copies() {
        let steps = sample_steps();
        let lookups = LookupTables::new();
        let mut sink = MemorySink::new();
        sink.persist(PersistRequest::Steps {
            event: 4,
            steps: &steps,
            lookups: &lookups,
        })
        .unwrap();
        sink.finish().unwrap();

        assert!(sink.is_finished());
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].header().event, 4);
        match &sink.records()[0] {
            PersistedRecord::Steps { steps: stored, .. } => assert_eq!(stored, &steps),
            PersistedRecord::Fields { .. } => panic!("expected steps"),
        }
    }

    #[test]
    fn json_lines_round_trip() {
        let path = std::env::temp_dir().join(format!("steplog-persist-{}.jsonl", Uuid::new_v4()));
        let steps = sample_steps();
        let mut lookups = LookupTables::new();
        lookups.record_pdg(TrackId(1), 13);

        let mut sink = JsonLinesSink::create(&path).unwrap();
        sink.persist(PersistRequest::Steps {
            event: 0,
            steps: &steps,
            lookups: &lookups,
        })
        .unwrap();
        sink.persist(PersistRequest::Fields {
            event: 0,
            queries: &[],
        })
        .unwrap();
        sink.finish().unwrap();
        let run_id = sink.run_id();
        drop(sink);

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.header().run_id == run_id));
        match &records[0] {
            PersistedRecord::Steps {
                steps: stored,
                lookups: stored_lookups,
                ..
            } => {
                assert_eq!(stored, &steps);
                assert_eq!(stored_lookups.pdg(TrackId(1)), Some(13));
            }
            PersistedRecord::Fields { .. } => panic!("expected steps first"),
        }
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn garbage_line_is_serialization_error() {
        let path = std::env::temp_dir().join(format!("steplog-garbage-{}.jsonl", Uuid::new_v4()));
        std::fs::write(&path, "{not json}\n").unwrap();
        assert!(matches!(
            read_records(&path),
            Err(PersistError::Serialization { .. })
        ));
        std::fs::remove_file(path).ok();
    }
}
