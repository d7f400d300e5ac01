//! End-to-end runs through the controller in every mode.

#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::indexing_slicing,
    missing_docs
)]

use std::fs;
use std::path::PathBuf;

use steplog_analysis::bucket::BucketSet;
use steplog_analysis::output::{JsonBucketSink, MemoryBucketSink};
use steplog_core::config::SteplogConfig;
use steplog_core::persist::{JsonLinesSink, MemorySink, NullSink, read_records};
use steplog_engine::controller::{EventOutcome, RunController, RunPhase};
use steplog_engine::replay;
use steplog_types::{
    FieldObservation, Parentage, ProcessCode, StepObservation, ThreeVector, TrackId, VolumeId,
};

const GEOMETRY: &str = "
geometry:
  volume_modules:
    ITSL0: ITS
    ITSL1: ITS
    TPC_Drift: TPC
    TRD1: TRD
  sensitive_volumes: [TPC_Drift]
";

fn config(mode: &str, extra: &str) -> SteplogConfig {
    SteplogConfig::parse_yaml(&format!("mode: {mode}\n{GEOMETRY}{extra}")).unwrap()
}

fn scratch(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()))
}

fn volume(id: u32) -> &'static str {
    match id {
        1 => "ITSL0",
        2 => "ITSL1",
        3 => "TPC_Drift",
        _ => "TRD1",
    }
}

fn step(track: u32, vol: u32, pdg: i32, parent: Parentage, energy: f32) -> StepObservation {
    StepObservation::new(VolumeId(vol), TrackId(track))
        .with_names(volume(vol), Some("Si".to_owned()))
        .with_particle(pdg, parent)
        .with_kinematics(
            ThreeVector::new(10.0 * f32::from(u8::try_from(vol).unwrap()), 5.0, -20.0),
            ThreeVector::new(0.01, 0.0, 0.02),
        )
        .with_energy(energy)
        .with_step(0.5, 1.0)
        .with_process(ProcessCode::PRIMARY, 3)
        .with_elapsed_ns(2_000)
}

/// One event: a primary crossing ITS into TPC, producing a gamma that dies
/// in TPC and an electron that escapes to TRD.
fn drive_event<R, B>(controller: &mut RunController<R, B>)
where
    R: steplog_core::persist::RecordSink,
    B: steplog_analysis::output::BucketSink,
{
    let primary = Parentage::Primary;
    let from_primary = Parentage::Secondary(TrackId(1));
    let calls = [
        step(1, 1, 211, primary, 2.0).as_new_track(),
        step(1, 2, 211, primary, 1.9),
        step(1, 3, 211, primary, 1.8)
            .with_secondaries(vec![ProcessCode::COMPTON, ProcessCode::DECAY]),
        step(2, 3, 22, from_primary, 0.4).as_new_track(),
        step(2, 3, 22, from_primary, 0.2),
        step(3, 3, 11, from_primary, 0.6).as_new_track(),
        step(3, 4, 11, from_primary, 0.5),
    ];
    for (idx, obs) in calls.iter().enumerate() {
        controller.record_step(obs).unwrap();
        if idx == 2 {
            controller
                .record_field_query(&FieldObservation {
                    volume_id: VolumeId(3),
                    volume_name: Some("TPC_Drift".to_owned()),
                    position: ThreeVector::new(30.0, 5.0, -20.0),
                    field: ThreeVector::new(0.0, 0.0, 0.5),
                })
                .unwrap();
            controller.record_hit(3, None).unwrap();
        }
    }
}

#[test]
fn summary_mode_counts_every_step_once() {
    let mut controller = RunController::new(
        config("summary", ""),
        NullSink,
        MemoryBucketSink::new(),
    );
    controller.init().unwrap();
    drive_event(&mut controller);

    let EventOutcome::Summarized { steps, fields, .. } = controller.end_event().unwrap() else {
        panic!("summary expected");
    };
    assert_eq!(steps.steps, 7);
    assert_eq!(steps.volume_step_total(), 7);
    assert_eq!(steps.distinct_tracks, 3);
    assert_eq!(steps.distinct_particles, 3);
    assert_eq!(fields.queries, 1);
    let tpc = steps.volumes.iter().find(|v| v.name == "TPC_Drift").unwrap();
    assert_eq!(tpc.hits, 1);
    assert_eq!(tpc.secondaries, 2);

    let summary = controller.shutdown().unwrap();
    assert_eq!(summary.phase, RunPhase::Finalized);
    assert_eq!(controller.lookups().module_name(VolumeId(1)), Some("ITS"));
    assert!(controller.lookups().is_sensitive(VolumeId(3)));
}

#[test]
fn summary_mode_starts_each_event_with_fresh_track_tables() {
    let mut controller = RunController::new(
        config("summary", ""),
        NullSink,
        MemoryBucketSink::new(),
    );
    controller.init().unwrap();

    controller
        .record_step(&step(1, 1, 211, Parentage::Primary, 5.0).as_new_track())
        .unwrap();
    controller.end_event().unwrap();
    assert_eq!(controller.lookups().pdg(TrackId(1)), None);

    controller
        .record_step(&step(1, 3, 11, Parentage::Primary, 1.0).as_new_track())
        .unwrap();
    let lookups = controller.lookups();
    assert_eq!(lookups.pdg(TrackId(1)), Some(11));
    assert_eq!(lookups.start_energy(TrackId(1)), Some(1.0));
    assert_eq!(lookups.step_count(TrackId(1)), 1);
    assert_eq!(lookups.origin_volume(TrackId(1)), Some(VolumeId(3)));
    assert_eq!(lookups.anomaly_count(), 0);
    controller.end_event().unwrap();

    let mut reports = Vec::new();
    for _ in 0..2 {
        drive_event(&mut controller);
        let EventOutcome::Summarized { steps, .. } = controller.end_event().unwrap() else {
            panic!("summary expected");
        };
        reports.push(steps);
    }
    assert_eq!(reports[0].event, 2);
    assert_eq!(reports[1].event, 3);
    assert_eq!(reports[0].volumes, reports[1].volumes);
    assert_eq!(reports[1].distinct_particles, 3);
    assert_eq!(controller.lookups().anomaly_count(), 0);
    assert_eq!(controller.lookups().volume_name(VolumeId(3)), Some("TPC_Drift"));
}

#[test]
fn replayed_stream_matches_live_analysis() {
    let mut live = RunController::new(
        config("live_analysis", "analysis:\n  target_events: 2\n"),
        NullSink,
        MemoryBucketSink::new(),
    );
    live.init().unwrap();
    let mut stream = RunController::new(config("stream", ""), MemorySink::new(), MemoryBucketSink::new());
    stream.init().unwrap();

    for _ in 0..2 {
        drive_event(&mut live);
        live.end_event().unwrap();
        drive_event(&mut stream);
        stream.end_event().unwrap();
    }
    assert_eq!(live.phase(), RunPhase::Finalized);
    stream.shutdown().unwrap();

    let (records, _) = stream.into_sinks();
    let mut replayed = MemoryBucketSink::new();
    let analysis = config("live_analysis", "").analysis;
    let summary = replay::replay(records.records().to_vec(), &analysis, &mut replayed).unwrap();
    assert_eq!(summary.events, 2);
    assert_eq!(summary.steps, 14);
    assert_eq!(summary.queries, 2);

    let live_set = live.buckets().set("step_statistics").unwrap();
    let replayed_set = replayed.set("step_statistics").unwrap();
    assert_eq!(live_set, replayed_set);

    let killed = live_set.category("produced_and_killed_per_module").unwrap();
    assert_eq!(killed.get("TPC"), 2.0);
    let survived = live_set.category("produced_and_survived_per_module").unwrap();
    assert_eq!(survived.get("TPC"), 2.0);
    assert_eq!(live_set.category("hits_per_module").unwrap().get("TPC"), 2.0);
    let transitions = live_set
        .co_occurrence("traversed_before_vs_current_per_module")
        .unwrap();
    assert_eq!(transitions.get("ITS", "TPC"), 2.0);
    assert_eq!(transitions.get("TPC", "TRD"), 2.0);
}

#[test]
fn stream_file_round_trips_through_replay_binary_path() {
    let stream_path = scratch("steplog-stream").with_extension("jsonl");
    let output_dir = scratch("steplog-buckets");

    let mut controller = RunController::new(
        config("stream", ""),
        JsonLinesSink::create(&stream_path).unwrap(),
        MemoryBucketSink::new(),
    );
    controller.init().unwrap();
    drive_event(&mut controller);
    controller.end_event().unwrap();
    drive_event(&mut controller);
    // Left buffered on purpose: shutdown must flush it.
    let summary = controller.shutdown().unwrap();
    assert!(summary.flushed_partial_event);

    let records = read_records(&stream_path).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[2].header().event, 1);
    assert_eq!(records[0].header().run_id, records[3].header().run_id);

    let filtered = config(
        "live_analysis",
        "analysis:\n  retain_raw_steps: true\n  filter:\n    modules: [TPC]\n",
    );
    let mut sink = JsonBucketSink::create(&output_dir).unwrap();
    let replayed = replay::replay_file(&stream_path, &filtered.analysis, &mut sink).unwrap();
    assert_eq!(replayed.events, 2);

    let written = fs::read_to_string(sink.buckets_path("step_statistics")).unwrap();
    let set: BucketSet = serde_json::from_str(&written).unwrap();
    let per_module = set.category("steps_per_module").unwrap();
    assert_eq!(per_module.get("TPC"), 8.0);
    assert!(!per_module.contains("ITS"));
    assert!(sink.steps_path("step_statistics").exists());

    fs::remove_file(stream_path).ok();
    fs::remove_dir_all(output_dir).ok();
}

#[test]
fn protocol_violation_stops_the_run() {
    let mut controller = RunController::new(config("stream", ""), MemorySink::new(), MemoryBucketSink::new());
    controller.init().unwrap();
    drive_event(&mut controller);
    controller.end_event().unwrap();
    assert!(controller.record_hit(1, None).is_err());
    assert_eq!(controller.phase(), RunPhase::Failed);

    let summary = controller.shutdown().unwrap();
    assert_eq!(summary.phase, RunPhase::Failed);
    assert!(controller.records().is_finished());
    assert_eq!(controller.records().records().len(), 2);
}
