//! Training Snapshotter (spec §4.10): on every terminal intervention
//! outcome, builds an idempotent, denormalized training row joining the
//! intervention, its evaluation, a session snapshot, and the event batch
//! that triggered it. Grounded on the teacher's `signals/db_storage.rs`
//! denormalization style — store enough on the row that a downstream
//! consumer never has to join back to live tables.

use crate::clock::Clock;
use crate::decision::TrainingSink;
use crate::errors::EngineResult;
use crate::models::*;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TrainingSnapshotter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl TrainingSnapshotter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn try_snapshot(&self, intervention: &Intervention) -> EngineResult<()> {
        if !intervention.status.is_terminal() {
            return Ok(());
        }
        if self.store.has_training_datapoint(&intervention.id).await? {
            return Ok(());
        }

        let Some(evaluation) = self.store.get_evaluation(&intervention.evaluation_id).await? else {
            warn!(intervention_id = %intervention.id, "no evaluation found for terminal intervention, skipping snapshot");
            return Ok(());
        };
        let Some(session) = self.store.get_session(&intervention.session_id).await? else {
            warn!(intervention_id = %intervention.id, "no session found for terminal intervention, skipping snapshot");
            return Ok(());
        };
        let events = self.store.get_events(&evaluation.event_batch_ids).await?;

        let outcome_at = intervention
            .dismissed_at
            .or(intervention.converted_at)
            .or(intervention.ignored_at)
            .unwrap_or(intervention.timestamp);
        let outcome_delay_ms = (outcome_at - intervention.timestamp).num_milliseconds().max(0);

        let datapoint = TrainingDatapoint {
            id: uuid::Uuid::new_v4().to_string(),
            intervention_id: intervention.id.clone(),
            session_snapshot: serde_json::to_value(&session).map_err(crate::errors::EngineError::persistence)?,
            event_batch: serde_json::to_value(&events).map_err(crate::errors::EngineError::persistence)?,
            evaluation_id: evaluation.id.clone(),
            outcome: intervention.status,
            outcome_delay_ms,
            has_outcome: true,
            has_events: !events.is_empty(),
            has_narrative: !evaluation.narrative.is_empty(),
            has_frictions: !evaluation.frictions_found.is_empty(),
            session_age_sec: session.session_age_sec(outcome_at),
            event_count: events.len() as i64,
            created_at: self.clock.now(),
        };

        let inserted = self.store.put_training_datapoint(&datapoint).await?;
        debug!(intervention_id = %intervention.id, inserted, "training datapoint recorded");
        Ok(())
    }
}

#[async_trait]
impl TrainingSink for TrainingSnapshotter {
    async fn record_outcome(&self, intervention: Intervention) {
        if let Err(err) = self.try_snapshot(&intervention).await {
            warn!(intervention_id = %intervention.id, ?err, "training snapshot failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    fn sample_evaluation() -> Evaluation {
        Evaluation {
            id: "eval-1".into(),
            session_id: "s1".into(),
            event_batch_ids: vec!["e1".into()],
            narrative: "checkout friction".into(),
            frictions_found: vec!["F010".into()],
            signals: Signals::default(),
            composite_score: 70.0,
            weights_used: Signals::default(),
            tier: Tier::Nudge,
            decision: Decision::Fire,
            gate_override: None,
            intervention_type: Some("nudge".into()),
            reasoning: "test".into(),
            engine: Engine::Fast,
            created_at: chrono::Utc::now(),
        }
    }

    fn sample_intervention(status: InterventionStatus) -> Intervention {
        let now = chrono::Utc::now();
        Intervention {
            id: "int-1".into(),
            session_id: "s1".into(),
            evaluation_id: "eval-1".into(),
            intervention_type: "nudge".into(),
            action_code: "SHOW_NUDGE_COPY".into(),
            friction_id: Some("F010".into()),
            payload: serde_json::json!({}),
            mswim_score_at_fire: 70.0,
            tier_at_fire: Tier::Nudge,
            timestamp: now,
            status,
            delivered_at: None,
            dismissed_at: if status == InterventionStatus::Dismissed { Some(now) } else { None },
            converted_at: None,
            ignored_at: None,
            conversion_action: None,
        }
    }

    async fn seeded_store() -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut session = Session::new("s1".into(), "v1".into(), "https://shop.example".into());
        session.started_at = chrono::Utc::now() - chrono::Duration::seconds(600);
        store.put_session(&session).await.unwrap();
        store.put_evaluation(&sample_evaluation()).await.unwrap();
        let event = TrackEvent {
            id: "e1".into(),
            session_id: "s1".into(),
            timestamp: chrono::Utc::now(),
            category: EventCategory::Checkout,
            event_type: "page_view".into(),
            friction_id: Some("F010".into()),
            page_type: PageType::Checkout,
            page_url: "/checkout".into(),
            raw_signals: "{}".into(),
            previous_page_url: None,
            time_on_page_ms: None,
            scroll_depth_pct: None,
            session_sequence_number: Some(1),
        };
        store.put_event(&event).await.unwrap();
        store
    }

    #[tokio::test]
    async fn records_snapshot_on_terminal_outcome() {
        let store = seeded_store().await;
        let snapshotter = TrainingSnapshotter::new(store.clone(), Arc::new(FixedClock::new(1_000_000)));
        snapshotter.record_outcome(sample_intervention(InterventionStatus::Dismissed)).await;
        assert!(store.has_training_datapoint(&"int-1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn skips_non_terminal_outcomes() {
        let store = seeded_store().await;
        let snapshotter = TrainingSnapshotter::new(store.clone(), Arc::new(FixedClock::new(1_000_000)));
        snapshotter.record_outcome(sample_intervention(InterventionStatus::Sent)).await;
        assert!(!store.has_training_datapoint(&"int-1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn idempotent_on_repeated_terminal_calls() {
        let store = seeded_store().await;
        let snapshotter = TrainingSnapshotter::new(store.clone(), Arc::new(FixedClock::new(1_000_000)));
        snapshotter.record_outcome(sample_intervention(InterventionStatus::Dismissed)).await;
        snapshotter.record_outcome(sample_intervention(InterventionStatus::Dismissed)).await;
        assert!(store.has_training_datapoint(&"int-1".to_string()).await.unwrap());
    }
}
