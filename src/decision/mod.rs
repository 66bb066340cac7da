//! Decision & Intervention Writer (spec §4.8): turns a `Fire` evaluation
//! into a persisted, broadcastable `Intervention`, and later records the
//! outcome the visitor (or widget) reports back.

use crate::clock::Clock;
use crate::errors::{EngineError, EngineResult};
use crate::models::*;
use crate::session::SessionStore;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Fan-out hook so this module doesn't need to know about the WebSocket
/// registry directly; `transport` implements this against its channel map.
#[async_trait]
pub trait InterventionBroadcaster: Send + Sync {
    async fn broadcast_intervention(&self, session_id: &Id, intervention: &Intervention);
}

pub struct NoopBroadcaster;

#[async_trait]
impl InterventionBroadcaster for NoopBroadcaster {
    async fn broadcast_intervention(&self, _session_id: &Id, _intervention: &Intervention) {}
}

/// Invoked once an intervention reaches a terminal status, so `training`
/// can build its denormalized row without `decision` knowing how.
#[async_trait]
pub trait TrainingSink: Send + Sync {
    async fn record_outcome(&self, intervention: Intervention);
}

pub struct NoopTrainingSink;

#[async_trait]
impl TrainingSink for NoopTrainingSink {
    async fn record_outcome(&self, _intervention: Intervention) {}
}

pub struct DecisionWriter {
    store: Arc<dyn Store>,
    sessions: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn InterventionBroadcaster>,
    training: Arc<dyn TrainingSink>,
}

impl DecisionWriter {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionStore>,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn InterventionBroadcaster>,
        training: Arc<dyn TrainingSink>,
    ) -> Self {
        Self {
            store,
            sessions,
            clock,
            broadcaster,
            training,
        }
    }

    /// No-op unless `evaluation.decision == Fire`. Builds the tier-shaped
    /// payload, persists the intervention, updates session counters, and
    /// broadcasts it to the widget channel.
    pub async fn fire_if_needed(&self, evaluation: &Evaluation) -> EngineResult<Option<Intervention>> {
        if evaluation.decision != Decision::Fire {
            metrics::counter!("interaction_engine_interventions_suppressed_total").increment(1);
            return Ok(None);
        }
        let Some(intervention_type) = evaluation.tier.intervention_type() else {
            metrics::counter!("interaction_engine_interventions_suppressed_total").increment(1);
            return Ok(None);
        };

        let friction_id = evaluation.frictions_found.first().cloned();
        let action_code = action_code_for(evaluation.tier, friction_id.as_deref());
        let timestamp = self.clock.now();
        let payload = payload_for(evaluation.tier, &action_code, friction_id.as_deref(), timestamp);

        let intervention = Intervention {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: evaluation.session_id.clone(),
            evaluation_id: evaluation.id.clone(),
            intervention_type: intervention_type.to_string(),
            action_code,
            friction_id,
            payload,
            mswim_score_at_fire: evaluation.composite_score,
            tier_at_fire: evaluation.tier,
            timestamp,
            status: InterventionStatus::Sent,
            delivered_at: None,
            dismissed_at: None,
            converted_at: None,
            ignored_at: None,
            conversion_action: None,
        };

        self.store.put_intervention(&intervention).await?;
        self.sessions
            .record_intervention_fired(&evaluation.session_id, evaluation.tier, &evaluation.frictions_found)
            .await?;
        self.broadcaster.broadcast_intervention(&evaluation.session_id, &intervention).await;

        info!(
            session_id = %evaluation.session_id,
            intervention_id = %intervention.id,
            tier = ?evaluation.tier,
            "intervention fired"
        );
        metrics::counter!("interaction_engine_interventions_fired_total").increment(1);
        Ok(Some(intervention))
    }

    /// Applies a lifecycle transition reported by the widget or dashboard.
    /// Rejects transitions the lifecycle DAG forbids (spec §3). Hands off
    /// to `training` once the intervention reaches a terminal state.
    pub async fn record_outcome(
        &self,
        intervention_id: &Id,
        new_status: InterventionStatus,
        conversion_action: Option<String>,
    ) -> EngineResult<Intervention> {
        let Some(mut intervention) = self.store.get_intervention(intervention_id).await? else {
            return Err(EngineError::NotFound(format!("intervention {intervention_id}")));
        };

        if intervention.status == new_status {
            return Ok(intervention);
        }
        if !intervention.status.can_transition_to(new_status) {
            return Err(EngineError::Validation(format!(
                "cannot transition intervention {intervention_id} from {:?} to {:?}",
                intervention.status, new_status
            )));
        }

        let now = self.clock.now();
        intervention.status = new_status;
        match new_status {
            InterventionStatus::Delivered => intervention.delivered_at = Some(now),
            InterventionStatus::Dismissed => {
                intervention.dismissed_at = Some(now);
                self.sessions.record_dismissal(&intervention.session_id).await?;
            }
            InterventionStatus::Converted => {
                intervention.converted_at = Some(now);
                intervention.conversion_action = conversion_action;
                self.sessions.record_conversion(&intervention.session_id).await?;
            }
            InterventionStatus::Ignored => intervention.ignored_at = Some(now),
            InterventionStatus::Sent => {}
        }

        self.store.put_intervention(&intervention).await?;

        if new_status.is_terminal() {
            self.training.record_outcome(intervention.clone()).await;
        }

        Ok(intervention)
    }
}

fn action_code_for(tier: Tier, friction_id: Option<&str>) -> String {
    match (tier, friction_id) {
        (Tier::Escalate, _) => "ESCALATE_LIVE_CHAT".to_string(),
        (_, Some(id)) if crate::friction::is_payment_failure(id) => "RETRY_PAYMENT_HELP".to_string(),
        (_, Some(id)) if crate::friction::is_out_of_stock(id) => "SUGGEST_ALTERNATIVE".to_string(),
        (_, Some(id)) if crate::friction::is_shipping(id) => "CLARIFY_SHIPPING".to_string(),
        (_, Some(id)) if crate::friction::is_technical(id) => "OFFER_REFRESH".to_string(),
        (Tier::Active, _) => "SHOW_DISCOUNT".to_string(),
        (Tier::Nudge, _) => "SHOW_NUDGE_COPY".to_string(),
        (Tier::Passive, _) => "SHOW_HELP_TOOLTIP".to_string(),
        (Tier::Monitor, _) => "NONE".to_string(),
    }
}

/// Visitor-facing copy per tier; the exact wording is opaque to the
/// contract, only the structural keys below are load-bearing.
fn message_for(tier: Tier) -> &'static str {
    match tier {
        Tier::Passive => "Need a hand finding what you're looking for?",
        Tier::Nudge => "Still thinking it over? Your cart's saved and ready whenever you are.",
        Tier::Active => "Here's 10% off to help you finish checking out.",
        Tier::Escalate => "Looks like something's not working right. Want to talk to someone now?",
        Tier::Monitor => "",
    }
}

fn payload_for(tier: Tier, action_code: &str, friction_id: Option<&str>, timestamp: chrono::DateTime<chrono::Utc>) -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    fields.insert(
        "type".to_string(),
        tier.intervention_type().map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
    );
    fields.insert("actionCode".to_string(), serde_json::Value::String(action_code.to_string()));
    fields.insert(
        "frictionId".to_string(),
        friction_id.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
    );
    fields.insert("message".to_string(), serde_json::Value::String(message_for(tier).to_string()));
    fields.insert("tier".to_string(), serde_json::to_value(tier).unwrap_or(serde_json::Value::Null));
    fields.insert("timestamp".to_string(), serde_json::Value::String(timestamp.to_rfc3339()));

    match tier {
        Tier::Passive => {
            fields.insert("uiAdjustments".to_string(), serde_json::json!({ "highlightHelp": true }));
            fields.insert("silent".to_string(), serde_json::Value::Bool(true));
        }
        Tier::Nudge => {
            fields.insert("bubbleText".to_string(), serde_json::Value::String(message_for(Tier::Nudge).to_string()));
            fields.insert("dismissable".to_string(), serde_json::Value::Bool(true));
            fields.insert("autoHideMs".to_string(), serde_json::json!(8000));
        }
        Tier::Active => {
            fields.insert("showPanel".to_string(), serde_json::Value::Bool(true));
            fields.insert("products".to_string(), serde_json::Value::Array(Vec::new()));
            fields.insert("comparison".to_string(), serde_json::Value::Null);
        }
        Tier::Escalate => {
            fields.insert("showPanel".to_string(), serde_json::Value::Bool(true));
            fields.insert("urgent".to_string(), serde_json::Value::Bool(true));
            fields.insert("offerDiscount".to_string(), serde_json::Value::Bool(tier == Tier::Escalate));
        }
        Tier::Monitor => {}
    }

    serde_json::Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    fn writer() -> (DecisionWriter, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(1_000_000));
        let sessions = Arc::new(SessionStore::new(store.clone(), clock.clone() as Arc<dyn Clock>));
        let writer = DecisionWriter::new(
            store.clone(),
            sessions,
            clock as Arc<dyn Clock>,
            Arc::new(NoopBroadcaster),
            Arc::new(NoopTrainingSink),
        );
        (writer, store)
    }

    fn sample_evaluation(session_id: &str, decision: Decision, tier: Tier) -> Evaluation {
        Evaluation {
            id: "eval-1".into(),
            session_id: session_id.to_string(),
            event_batch_ids: vec!["e1".into()],
            narrative: "test".into(),
            frictions_found: vec![],
            signals: Signals::default(),
            composite_score: 70.0,
            weights_used: Signals::default(),
            tier,
            decision,
            gate_override: None,
            intervention_type: tier.intervention_type().map(str::to_string),
            reasoning: "test".into(),
            engine: Engine::Fast,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn suppressed_evaluations_fire_nothing() {
        let (writer, _store) = writer();
        let evaluation = sample_evaluation("s1", Decision::Suppress, Tier::Nudge);
        assert!(writer.fire_if_needed(&evaluation).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fires_and_persists_intervention() {
        let (writer, store) = writer();
        let mut session = Session::new("s1".into(), "v1".into(), "https://shop.example".into());
        session.started_at = chrono::Utc::now();
        store.put_session(&session).await.unwrap();

        let evaluation = sample_evaluation("s1", Decision::Fire, Tier::Active);
        let intervention = writer.fire_if_needed(&evaluation).await.unwrap().unwrap();
        assert_eq!(intervention.status, InterventionStatus::Sent);
        assert_eq!(intervention.action_code, "SHOW_DISCOUNT");

        let reloaded = store.get_session(&"s1".to_string()).await.unwrap().unwrap();
        assert_eq!(reloaded.total_active_interventions, 1);
    }

    #[tokio::test]
    async fn payload_carries_the_common_and_escalate_fields() {
        let (writer, store) = writer();
        let mut session = Session::new("s1".into(), "v1".into(), "https://shop.example".into());
        session.started_at = chrono::Utc::now();
        store.put_session(&session).await.unwrap();

        let evaluation = sample_evaluation("s1", Decision::Fire, Tier::Escalate);
        let intervention = writer.fire_if_needed(&evaluation).await.unwrap().unwrap();

        assert_eq!(intervention.payload["type"], "escalate");
        assert_eq!(intervention.payload["tier"], "ESCALATE");
        assert_eq!(intervention.payload["actionCode"], intervention.action_code);
        assert!(intervention.payload["message"].is_string());
        assert!(intervention.payload["timestamp"].is_string());
        assert_eq!(intervention.payload["showPanel"], true);
        assert_eq!(intervention.payload["urgent"], true);
        assert_eq!(intervention.payload["offerDiscount"], true);
    }

    #[tokio::test]
    async fn rejects_invalid_lifecycle_transition() {
        let (writer, store) = writer();
        let mut session = Session::new("s1".into(), "v1".into(), "https://shop.example".into());
        session.started_at = chrono::Utc::now();
        store.put_session(&session).await.unwrap();
        let evaluation = sample_evaluation("s1", Decision::Fire, Tier::Nudge);
        let intervention = writer.fire_if_needed(&evaluation).await.unwrap().unwrap();

        writer
            .record_outcome(&intervention.id, InterventionStatus::Dismissed, None)
            .await
            .unwrap();
        let result = writer
            .record_outcome(&intervention.id, InterventionStatus::Converted, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn converted_outcome_updates_session_counter() {
        let (writer, store) = writer();
        let mut session = Session::new("s1".into(), "v1".into(), "https://shop.example".into());
        session.started_at = chrono::Utc::now();
        store.put_session(&session).await.unwrap();
        let evaluation = sample_evaluation("s1", Decision::Fire, Tier::Nudge);
        let intervention = writer.fire_if_needed(&evaluation).await.unwrap().unwrap();

        writer
            .record_outcome(&intervention.id, InterventionStatus::Converted, Some("purchase".into()))
            .await
            .unwrap();
        let reloaded = store.get_session(&"s1".to_string()).await.unwrap().unwrap();
        assert_eq!(reloaded.conversions, 1);
    }
}
