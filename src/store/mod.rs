//! The `Persist` capability (spec §6.2): a single async trait behind which
//! every entity operation named in §3/§4 is expressed, exactly as the
//! teacher wraps its `rusqlite::Connection` behind `DbSignalStorage` rather
//! than letting callers reach for SQL directly.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::errors::EngineResult;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Store: Send + Sync {
    // Sessions (C3 owns all mutation; the store just persists it).
    async fn get_session(&self, id: &Id) -> EngineResult<Option<Session>>;
    async fn get_session_by_visitor(&self, visitor_key: &str) -> EngineResult<Option<Session>>;
    async fn put_session(&self, session: &Session) -> EngineResult<()>;

    // Events (C2 creates, immutable thereafter).
    async fn put_event(&self, event: &TrackEvent) -> EngineResult<()>;
    async fn get_events(&self, ids: &[Id]) -> EngineResult<Vec<TrackEvent>>;
    /// Events for a session excluding `excluding`, most recent first, capped at `limit`.
    async fn get_event_history(
        &self,
        session_id: &Id,
        excluding: &[Id],
        limit: usize,
    ) -> EngineResult<Vec<TrackEvent>>;

    // Evaluations (C6 creates, immutable).
    async fn put_evaluation(&self, evaluation: &Evaluation) -> EngineResult<()>;
    async fn get_recent_evaluations(&self, session_id: &Id, limit: usize) -> EngineResult<Vec<Evaluation>>;
    async fn get_evaluation(&self, id: &Id) -> EngineResult<Option<Evaluation>>;

    // Interventions (C8 creates/updates).
    async fn put_intervention(&self, intervention: &Intervention) -> EngineResult<()>;
    async fn get_intervention(&self, id: &Id) -> EngineResult<Option<Intervention>>;
    async fn get_recent_interventions(&self, session_id: &Id, limit: usize) -> EngineResult<Vec<Intervention>>;

    // Scoring configs (C12 owns activation).
    async fn put_scoring_config(&self, config: &ScoringConfig) -> EngineResult<()>;
    async fn get_scoring_config(&self, id: &Id) -> EngineResult<Option<ScoringConfig>>;
    async fn get_active_scoring_config(&self, site_url: Option<&str>) -> EngineResult<Option<ScoringConfig>>;
    /// Deactivate any other active config in the same scope, then activate `id`.
    async fn activate_scoring_config(&self, id: &Id) -> EngineResult<()>;

    // Experiments (C5).
    async fn get_active_experiment(&self, site_url: Option<&str>) -> EngineResult<Option<Experiment>>;
    async fn get_assignment(
        &self,
        experiment_id: &Id,
        session_id: &Id,
    ) -> EngineResult<Option<ExperimentAssignment>>;
    async fn put_assignment(&self, assignment: &ExperimentAssignment) -> EngineResult<()>;

    // Shadow comparisons (C9).
    async fn put_shadow_comparison(&self, comparison: &ShadowComparison) -> EngineResult<()>;
    async fn get_shadow_comparisons_since(
        &self,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<ShadowComparison>>;

    // Interventions for drift aggregation.
    async fn get_interventions_since(
        &self,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<Intervention>>;

    // Drift (C11).
    async fn put_drift_snapshot(&self, snapshot: &DriftSnapshot) -> EngineResult<()>;
    async fn get_latest_drift_snapshot(
        &self,
        window_type: WindowType,
        site_url: Option<&str>,
    ) -> EngineResult<Option<DriftSnapshot>>;
    async fn put_drift_alert(&self, alert: &DriftAlert) -> EngineResult<()>;
    async fn find_unresolved_alert_since(
        &self,
        alert_type: &str,
        window_type: WindowType,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Option<DriftAlert>>;

    // Training datapoints (C10); idempotent by intervention_id.
    async fn put_training_datapoint(&self, datapoint: &TrainingDatapoint) -> EngineResult<bool>;
    async fn has_training_datapoint(&self, intervention_id: &Id) -> EngineResult<bool>;

    // Job runs (C11).
    async fn put_job_run(&self, run: &JobRun) -> EngineResult<()>;
}
