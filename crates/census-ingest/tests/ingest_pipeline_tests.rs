//! End-to-end ingestion runs against a scripted source and the in-memory store

mod common;

use census_common::types::{Dataset, GeographyFilter, Stage};
use census_common::CensusError;
use census_ingest::executor::PoolKind;
use census_ingest::storage::{CensusStore, CheckpointRepository, MemoryStore};
use census_ingest::{IngestOptions, IngestOrchestrator};
use common::{test_options, two_group_source, MockSource, RecordingStore, SourceCall};
use std::sync::Arc;

fn orchestrator(
    source: &Arc<MockSource>,
    store: &MemoryStore,
    checkpoints: &MemoryStore,
    options: IngestOptions,
) -> IngestOrchestrator {
    IngestOrchestrator::new(
        source.clone(),
        Arc::new(store.clone()),
        Arc::new(checkpoints.clone()),
        options,
    )
}

async fn preset(checkpoints: &MemoryStore, stages: &[Stage]) {
    checkpoints
        .insert_checkpoint_if_absent("acs5", 2019)
        .await
        .unwrap();
    for stage in stages {
        checkpoints
            .set_checkpoint_flag("acs5", 2019, *stage)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_end_to_end_acs5_2019() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();

    let report = orchestrator(&source, &store, &store, test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    assert_eq!(store.variable_count(), 5);
    assert_eq!(store.group_count(), 2);
    assert_eq!(store.state_count(), 1);
    assert_eq!(store.county_count(), 2);
    assert_eq!(store.place_count(), 2);

    let checkpoint = store.load_checkpoint("acs5", 2019).await.unwrap().unwrap();
    assert!(checkpoint.is_complete());

    // 2 places x 2 batches, 5 variables per place
    let stats = report.estimates.unwrap();
    assert_eq!(stats.submitted, 4);
    assert_eq!(stats.failed, 0);
    assert_eq!(store.estimate_count(), 10);
    assert!(store
        .all_estimates()
        .iter()
        .all(|e| e.county_fips.is_none() && e.place_fips.is_some()));

    let year_id = store.year_id("acs5", 2019).await.unwrap().unwrap();
    let groups = store.get_groups("acs5", year_id).await.unwrap();
    let b01 = groups.iter().find(|g| g.id == "B01").unwrap();
    assert_eq!(b01.variable_count, 4);

    assert_eq!(report.stages_run, Stage::ALL.to_vec());
    assert!(report.stages_skipped.is_empty());
}

#[tokio::test]
async fn test_completed_run_is_skipped_entirely() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();
    let orchestrator = orchestrator(&source, &store, &store, test_options());

    orchestrator.run(&Dataset::acs5(), 2019).await.unwrap();
    source.reset_calls();

    let report = orchestrator.run(&Dataset::acs5(), 2019).await.unwrap();

    assert!(report.stages_run.is_empty());
    assert_eq!(report.stages_skipped.len(), 4);
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_rerun_does_not_duplicate_rows() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();

    orchestrator(&source, &store, &MemoryStore::new(), test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();
    let first = store.all_estimates();

    // Fresh checkpoints force every stage to run again over the same data
    let report = orchestrator(&source, &store, &MemoryStore::new(), test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    assert_eq!(report.stages_run.len(), 4);
    assert_eq!(report.variables_written, 0);
    assert_eq!(report.places_written, 0);
    assert_eq!(report.estimates.unwrap().rows_written, 0);
    assert_eq!(store.all_estimates(), first);
    assert_eq!(store.variable_count(), 5);
}

#[tokio::test]
async fn test_metadata_stage_skipped_when_flags_set() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();
    preset(&store, &[Stage::Groups, Stage::Variables, Stage::Estimates]).await;

    let report = orchestrator(&source, &store, &store, test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    assert_eq!(source.count(|c| *c == SourceCall::Groups), 0);
    assert_eq!(source.count(|c| matches!(c, SourceCall::Variables(_))), 0);
    assert_eq!(store.variable_count(), 0);
    assert_eq!(report.stages_run, vec![Stage::Geography]);
    assert_eq!(store.place_count(), 2);
}

#[tokio::test]
async fn test_estimates_reload_skipped_metadata_from_upstream() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();
    preset(&store, &[Stage::Groups, Stage::Variables, Stage::Geography]).await;

    let report = orchestrator(&source, &store, &store, test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    // Nothing persisted for the skipped stages, but estimates still ran
    assert_eq!(store.variable_count(), 0);
    assert_eq!(store.place_count(), 0);
    assert_eq!(report.stages_run, vec![Stage::Estimates]);
    assert_eq!(source.count(|c| *c == SourceCall::Groups), 1);
    assert_eq!(source.count(|c| *c == SourceCall::States), 1);
    assert_eq!(store.estimate_count(), 10);
}

#[tokio::test]
async fn test_failed_estimate_job_is_logged_and_skipped() {
    let places: Vec<String> = (1..=10).map(|i| format!("{:05}", i)).collect();
    let place_refs: Vec<&str> = places.iter().map(String::as_str).collect();
    let source = Arc::new(
        MockSource::new()
            .with_group("B01", 1)
            .with_state("01", "Alabama", &[], &place_refs)
            .failing_place("00004"),
    );
    let store = MemoryStore::new();

    let report = orchestrator(&source, &store, &store, test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    let stats = report.estimates.unwrap();
    assert_eq!(stats.submitted, 10);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.rows_written, 9);
    assert_eq!(store.estimate_count(), 9);

    // One first attempt plus one retry for the failing place
    let failing = GeographyFilter::place("01", "00004");
    assert_eq!(
        source.count(|c| matches!(c, SourceCall::Estimates { geography, .. } if *geography == failing)),
        2
    );

    let checkpoint = store.load_checkpoint("acs5", 2019).await.unwrap().unwrap();
    assert!(checkpoint.estimates_ingested);
}

#[tokio::test]
async fn test_group_failure_aborts_without_setting_flags() {
    let source = Arc::new(two_group_source().failing_group("B02"));
    let store = MemoryStore::new();

    let err = orchestrator(&source, &store, &store, test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap_err();

    assert!(matches!(err, CensusError::RetriesExhausted { attempts: 2, .. }));
    assert!(matches!(err.root_cause(), CensusError::SourceUnavailable { .. }));

    let checkpoint = store.load_checkpoint("acs5", 2019).await.unwrap().unwrap();
    assert!(!checkpoint.groups_ingested);
    assert!(!checkpoint.variables_ingested);
    assert!(!checkpoint.geography_ingested);
    assert_eq!(store.group_count(), 0);
    assert_eq!(source.count(|c| *c == SourceCall::States), 0);
}

#[tokio::test]
async fn test_calls_run_in_their_pools() {
    let source = Arc::new(two_group_source());
    let store = Arc::new(RecordingStore::new());

    IngestOrchestrator::new(source.clone(), store.clone(), store.clone(), test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    let calls = source.calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|(_, pool)| *pool == Some(PoolKind::Network)));

    let writes = store.writes();
    assert!(writes.iter().any(|(op, _)| *op == "insert_estimates"));
    assert!(writes.iter().any(|(op, _)| *op == "set_checkpoint_flag"));
    assert!(writes.iter().all(|(_, pool)| *pool == Some(PoolKind::Storage)));
}

#[tokio::test]
async fn test_include_counties_adds_county_jobs() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();
    let options = IngestOptions {
        place_only: false,
        ..test_options()
    };

    let report = orchestrator(&source, &store, &store, options)
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    // (2 counties + 2 places) x 2 batches
    assert_eq!(report.estimates.unwrap().submitted, 8);
    assert_eq!(store.estimate_count(), 20);
    assert_eq!(
        store
            .all_estimates()
            .iter()
            .filter(|e| e.county_fips.is_some())
            .count(),
        10
    );
}

#[tokio::test]
async fn test_allowed_groups_narrow_the_catalog() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();
    let options = IngestOptions {
        allowed_groups: Some(vec!["B02".to_string(), "B99".to_string()]),
        ..test_options()
    };

    orchestrator(&source, &store, &store, options)
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    assert_eq!(store.group_count(), 1);
    assert_eq!(store.variable_count(), 1);
    assert_eq!(source.count(|c| *c == SourceCall::Variables("B01".to_string())), 0);
    assert_eq!(store.estimate_count(), 2);
}

#[tokio::test]
async fn test_run_all_covers_every_year() {
    let source = Arc::new(two_group_source());
    let store = MemoryStore::new();

    let reports = orchestrator(&source, &store, &store, test_options())
        .run_all(&[Dataset::acs5()], &[2019, 2020])
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(store.list_years("acs5").await.unwrap().len(), 2);
    assert_eq!(store.estimate_count(), 20);
    for year in [2019, 2020] {
        let checkpoint = store.load_checkpoint("acs5", year).await.unwrap().unwrap();
        assert!(checkpoint.is_complete());
    }
}

#[tokio::test]
async fn test_variable_batches_respect_request_limit() {
    let source = Arc::new(
        MockSource::new()
            .with_group("B01", 73)
            .with_state("01", "Alabama", &[], &["07000"]),
    );
    let store = MemoryStore::new();

    orchestrator(&source, &store, &store, test_options())
        .run(&Dataset::acs5(), 2019)
        .await
        .unwrap();

    let sizes: Vec<usize> = source
        .calls()
        .into_iter()
        .filter_map(|(call, _)| match call {
            SourceCall::Estimates { variables, .. } => Some(variables.len()),
            _ => None,
        })
        .collect();
    let mut sorted = sizes.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![23, 50]);
    assert_eq!(store.estimate_count(), 73);
}
