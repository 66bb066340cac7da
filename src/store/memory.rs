//! In-memory `Store` used by unit/integration tests, the way the teacher's
//! test suites stand up fakes for external capabilities instead of hitting
//! real infrastructure.

use super::Store;
use crate::errors::EngineResult;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    sessions: HashMap<Id, Session>,
    visitor_index: HashMap<String, Id>,
    events: HashMap<Id, TrackEvent>,
    events_by_session: HashMap<Id, Vec<Id>>,
    evaluations: HashMap<Id, Evaluation>,
    evaluations_by_session: HashMap<Id, Vec<Id>>,
    interventions: HashMap<Id, Intervention>,
    interventions_by_session: HashMap<Id, Vec<Id>>,
    scoring_configs: HashMap<Id, ScoringConfig>,
    experiments: Vec<Experiment>,
    assignments: HashMap<(Id, Id), ExperimentAssignment>,
    shadow_comparisons: Vec<ShadowComparison>,
    drift_snapshots: Vec<DriftSnapshot>,
    drift_alerts: Vec<DriftAlert>,
    training_datapoints: HashMap<Id, TrainingDatapoint>,
    job_runs: Vec<JobRun>,
}

/// Test/dev-only store; all state lives behind one lock since volumes are
/// small and correctness (not throughput) is the point.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_session(&self, id: &Id) -> EngineResult<Option<Session>> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    async fn get_session_by_visitor(&self, visitor_key: &str) -> EngineResult<Option<Session>> {
        let inner = self.inner.lock();
        Ok(inner
            .visitor_index
            .get(visitor_key)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn put_session(&self, session: &Session) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner
            .visitor_index
            .insert(session.visitor_id.clone(), session.id.clone());
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn put_event(&self, event: &TrackEvent) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner
            .events_by_session
            .entry(event.session_id.clone())
            .or_default()
            .push(event.id.clone());
        inner.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get_events(&self, ids: &[Id]) -> EngineResult<Vec<TrackEvent>> {
        let inner = self.inner.lock();
        Ok(ids.iter().filter_map(|id| inner.events.get(id).cloned()).collect())
    }

    async fn get_event_history(
        &self,
        session_id: &Id,
        excluding: &[Id],
        limit: usize,
    ) -> EngineResult<Vec<TrackEvent>> {
        let inner = self.inner.lock();
        let Some(ids) = inner.events_by_session.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<TrackEvent> = ids
            .iter()
            .rev()
            .filter(|id| !excluding.contains(id))
            .filter_map(|id| inner.events.get(id).cloned())
            .take(limit)
            .collect();
        events.reverse();
        Ok(events)
    }

    async fn put_evaluation(&self, evaluation: &Evaluation) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner
            .evaluations_by_session
            .entry(evaluation.session_id.clone())
            .or_default()
            .push(evaluation.id.clone());
        inner.evaluations.insert(evaluation.id.clone(), evaluation.clone());
        Ok(())
    }

    async fn get_recent_evaluations(&self, session_id: &Id, limit: usize) -> EngineResult<Vec<Evaluation>> {
        let inner = self.inner.lock();
        let Some(ids) = inner.evaluations_by_session.get(session_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.evaluations.get(id).cloned())
            .collect())
    }

    async fn get_evaluation(&self, id: &Id) -> EngineResult<Option<Evaluation>> {
        Ok(self.inner.lock().evaluations.get(id).cloned())
    }

    async fn put_intervention(&self, intervention: &Intervention) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if !inner.interventions.contains_key(&intervention.id) {
            inner
                .interventions_by_session
                .entry(intervention.session_id.clone())
                .or_default()
                .push(intervention.id.clone());
        }
        inner
            .interventions
            .insert(intervention.id.clone(), intervention.clone());
        Ok(())
    }

    async fn get_intervention(&self, id: &Id) -> EngineResult<Option<Intervention>> {
        Ok(self.inner.lock().interventions.get(id).cloned())
    }

    async fn get_recent_interventions(&self, session_id: &Id, limit: usize) -> EngineResult<Vec<Intervention>> {
        let inner = self.inner.lock();
        let Some(ids) = inner.interventions_by_session.get(session_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.interventions.get(id).cloned())
            .collect())
    }

    async fn put_scoring_config(&self, config: &ScoringConfig) -> EngineResult<()> {
        self.inner
            .lock()
            .scoring_configs
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_scoring_config(&self, id: &Id) -> EngineResult<Option<ScoringConfig>> {
        Ok(self.inner.lock().scoring_configs.get(id).cloned())
    }

    async fn get_active_scoring_config(&self, site_url: Option<&str>) -> EngineResult<Option<ScoringConfig>> {
        let inner = self.inner.lock();
        Ok(inner
            .scoring_configs
            .values()
            .find(|c| c.is_active && c.site_url.as_deref() == site_url)
            .cloned())
    }

    async fn activate_scoring_config(&self, id: &Id) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let scope = inner.scoring_configs.get(id).and_then(|c| c.site_url.clone());
        for config in inner.scoring_configs.values_mut() {
            if config.site_url == scope {
                config.is_active = config.id == *id;
            }
        }
        Ok(())
    }

    async fn get_active_experiment(&self, site_url: Option<&str>) -> EngineResult<Option<Experiment>> {
        let inner = self.inner.lock();
        if let Some(site) = site_url {
            if let Some(exp) = inner
                .experiments
                .iter()
                .find(|e| e.status == ExperimentStatus::Running && e.site_url.as_deref() == Some(site))
            {
                return Ok(Some(exp.clone()));
            }
        }
        Ok(inner
            .experiments
            .iter()
            .find(|e| e.status == ExperimentStatus::Running && e.site_url.is_none())
            .cloned())
    }

    async fn get_assignment(
        &self,
        experiment_id: &Id,
        session_id: &Id,
    ) -> EngineResult<Option<ExperimentAssignment>> {
        Ok(self
            .inner
            .lock()
            .assignments
            .get(&(experiment_id.clone(), session_id.clone()))
            .cloned())
    }

    async fn put_assignment(&self, assignment: &ExperimentAssignment) -> EngineResult<()> {
        self.inner.lock().assignments.insert(
            (assignment.experiment_id.clone(), assignment.session_id.clone()),
            assignment.clone(),
        );
        Ok(())
    }

    async fn put_shadow_comparison(&self, comparison: &ShadowComparison) -> EngineResult<()> {
        self.inner.lock().shadow_comparisons.push(comparison.clone());
        Ok(())
    }

    async fn get_shadow_comparisons_since(
        &self,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<ShadowComparison>> {
        let inner = self.inner.lock();
        let sessions = &inner.sessions;
        Ok(inner
            .shadow_comparisons
            .iter()
            .filter(|c| c.created_at >= since)
            .filter(|c| match site_url {
                None => true,
                Some(site) => sessions
                    .get(&c.session_id)
                    .is_some_and(|s| s.site_url == site),
            })
            .cloned()
            .collect())
    }

    async fn get_interventions_since(
        &self,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<Intervention>> {
        let inner = self.inner.lock();
        let sessions = &inner.sessions;
        Ok(inner
            .interventions
            .values()
            .filter(|i| i.timestamp >= since)
            .filter(|i| match site_url {
                None => true,
                Some(site) => sessions.get(&i.session_id).is_some_and(|s| s.site_url == site),
            })
            .cloned()
            .collect())
    }

    async fn put_drift_snapshot(&self, snapshot: &DriftSnapshot) -> EngineResult<()> {
        self.inner.lock().drift_snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn get_latest_drift_snapshot(
        &self,
        window_type: WindowType,
        site_url: Option<&str>,
    ) -> EngineResult<Option<DriftSnapshot>> {
        let inner = self.inner.lock();
        Ok(inner
            .drift_snapshots
            .iter()
            .filter(|s| s.window_type == window_type && s.site_url.as_deref() == site_url)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn put_drift_alert(&self, alert: &DriftAlert) -> EngineResult<()> {
        self.inner.lock().drift_alerts.push(alert.clone());
        Ok(())
    }

    async fn find_unresolved_alert_since(
        &self,
        alert_type: &str,
        window_type: WindowType,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Option<DriftAlert>> {
        let inner = self.inner.lock();
        Ok(inner
            .drift_alerts
            .iter()
            .find(|a| {
                a.alert_type == alert_type
                    && a.window_type == window_type
                    && a.site_url.as_deref() == site_url
                    && a.resolved_at.is_none()
                    && a.created_at >= since
            })
            .cloned())
    }

    async fn put_training_datapoint(&self, datapoint: &TrainingDatapoint) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        if inner.training_datapoints.contains_key(&datapoint.intervention_id) {
            return Ok(false);
        }
        inner
            .training_datapoints
            .insert(datapoint.intervention_id.clone(), datapoint.clone());
        Ok(true)
    }

    async fn has_training_datapoint(&self, intervention_id: &Id) -> EngineResult<bool> {
        Ok(self
            .inner
            .lock()
            .training_datapoints
            .contains_key(intervention_id))
    }

    async fn put_job_run(&self, run: &JobRun) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.job_runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run.clone();
        } else {
            inner.job_runs.push(run.clone());
        }
        Ok(())
    }
}

impl MemoryStore {
    /// Test helper: seed an experiment directly (production code writes
    /// these via an admin boundary this crate doesn't implement).
    pub fn seed_experiment(&self, experiment: Experiment) {
        self.inner.lock().experiments.push(experiment);
    }

    /// Test helper: total drift alerts ever persisted, to assert dedup logic
    /// didn't insert a second row alongside the one `find_unresolved_alert_since`
    /// returns.
    pub fn drift_alert_count(&self) -> usize {
        self.inner.lock().drift_alerts.len()
    }
}
