//! Per-(dataset, year) ingestion progress
//!
//! Four independent completion flags, created lazily and only ever flipped to
//! true. There is no reset here: forcing a stage to run again means clearing its
//! flag in the database directly.

use census_common::types::{IngestionCheckpoint, Stage};
use census_common::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::CheckpointRepository;

#[derive(Clone)]
pub struct CheckpointStore {
    repository: Arc<dyn CheckpointRepository>,
}

impl CheckpointStore {
    pub fn new(repository: Arc<dyn CheckpointRepository>) -> Self {
        Self { repository }
    }

    /// Existing checkpoint, or a new all-false one
    pub async fn get_or_create(&self, dataset_id: &str, year: i32) -> Result<IngestionCheckpoint> {
        if let Some(existing) = self.repository.load_checkpoint(dataset_id, year).await? {
            debug!(dataset_id, year, ?existing, "Loaded checkpoint");
            return Ok(existing);
        }

        self.repository
            .insert_checkpoint_if_absent(dataset_id, year)
            .await?;
        info!(dataset_id, year, "Created checkpoint");

        // Re-read: a concurrent creator may have won the insert
        Ok(self
            .repository
            .load_checkpoint(dataset_id, year)
            .await?
            .unwrap_or_else(|| IngestionCheckpoint::new(dataset_id, year)))
    }

    /// Mark a stage by its persisted flag name; unknown names are rejected
    pub async fn mark_completed(&self, dataset_id: &str, year: i32, stage_name: &str) -> Result<()> {
        let stage: Stage = stage_name.parse()?;
        self.mark_stage(dataset_id, year, stage).await
    }

    /// Set a stage's flag. Idempotent.
    pub async fn mark_stage(&self, dataset_id: &str, year: i32, stage: Stage) -> Result<()> {
        self.repository
            .insert_checkpoint_if_absent(dataset_id, year)
            .await?;
        self.repository
            .set_checkpoint_flag(dataset_id, year, stage)
            .await?;
        info!(dataset_id, year, stage = %stage, "Checkpoint updated");
        Ok(())
    }
}
