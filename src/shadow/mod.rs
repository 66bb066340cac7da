//! Shadow Comparator (spec §4.9): whenever the primary evaluation runs on
//! the `llm` engine, a fast-only pass runs alongside it over the same
//! inputs so the two engines' outputs can be diffed without affecting the
//! visitor-facing decision. Grounded on the teacher's `vault/ab_test.rs`
//! variant-compare shape, adapted from "pick one" to "run both and diff".

use crate::clock::Clock;
use crate::errors::EngineResult;
use crate::evaluation::{build_session_context, fast_synthesize, ShadowSink};
use crate::friction::FrictionCatalog;
use crate::models::*;
use crate::mswim;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct ShadowComparator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    friction_catalog: Arc<dyn FrictionCatalog>,
}

impl ShadowComparator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, friction_catalog: Arc<dyn FrictionCatalog>) -> Self {
        Self {
            store,
            clock,
            friction_catalog,
        }
    }

    async fn try_compare(&self, evaluation: &Evaluation, ctx: &EvaluationContext, config: &ScoringConfig) -> EngineResult<()> {
        let page_type = ctx
            .new_events
            .last()
            .map(|e| e.page_type)
            .unwrap_or(PageType::Other);

        // Union of client-reported and LLM-detected frictions, same as the
        // primary pass saw.
        let mut friction_ids: Vec<String> = ctx.new_events.iter().filter_map(|e| e.friction_id.clone()).collect();
        for id in &evaluation.frictions_found {
            if !friction_ids.contains(id) {
                friction_ids.push(id.clone());
            }
        }

        let session_ctx = build_session_context(ctx, &friction_ids, page_type, self.clock.now());
        let (hint, shadow_frictions) = fast_synthesize(&session_ctx, &friction_ids, self.friction_catalog.as_ref());
        let device_is_mobile = ctx.session.device_type == DeviceType::Mobile;
        let shadow_result = mswim::evaluate(&hint, &session_ctx, &shadow_frictions, device_is_mobile, config, self.friction_catalog.as_ref());

        let divergence = (evaluation.composite_score - shadow_result.composite).abs();
        let comparison = ShadowComparison {
            id: uuid::Uuid::new_v4().to_string(),
            evaluation_id: evaluation.id.clone(),
            session_id: evaluation.session_id.clone(),
            production_signals: evaluation.signals,
            shadow_signals: shadow_result.signals,
            production_composite: evaluation.composite_score,
            shadow_composite: shadow_result.composite,
            composite_divergence: divergence,
            tier_match: evaluation.tier == shadow_result.tier,
            decision_match: evaluation.decision == shadow_result.decision,
            gate_override_match: evaluation.gate_override == shadow_result.gate_override,
            created_at: self.clock.now(),
        };

        self.store.put_shadow_comparison(&comparison).await
    }
}

#[async_trait]
impl ShadowSink for ShadowComparator {
    /// Spawned fire-and-forget from the evaluation coordinator when the
    /// primary engine was `llm`; failures are logged, never surfaced.
    async fn compare(&self, evaluation: &Evaluation, ctx: &EvaluationContext, config: &ScoringConfig) {
        if let Err(err) = self.try_compare(evaluation, ctx, config).await {
            warn!(evaluation_id = %evaluation.id, ?err, "shadow comparison failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::friction::StaticFrictionCatalog;
    use crate::store::MemoryStore;

    fn sample_ctx() -> EvaluationContext {
        let mut session = Session::new("s1".into(), "v1".into(), "https://shop.example".into());
        session.cart_value = 150.0;
        session.cart_item_count = 2;
        session.started_at = chrono::Utc::now() - chrono::Duration::seconds(300);

        let event = TrackEvent {
            id: "e1".into(),
            session_id: "s1".into(),
            timestamp: chrono::Utc::now(),
            category: EventCategory::Checkout,
            event_type: "page_view".into(),
            friction_id: None,
            page_type: PageType::Checkout,
            page_url: "/checkout".into(),
            raw_signals: "{}".into(),
            previous_page_url: None,
            time_on_page_ms: None,
            scroll_depth_pct: None,
            session_sequence_number: Some(1),
        };

        EvaluationContext {
            session,
            event_history: vec![],
            new_events: vec![event],
            previous_evaluations: vec![],
            previous_interventions: vec![],
        }
    }

    fn sample_evaluation() -> Evaluation {
        Evaluation {
            id: "eval-1".into(),
            session_id: "s1".into(),
            event_batch_ids: vec!["e1".into()],
            narrative: "llm narrative".into(),
            frictions_found: vec![],
            signals: Signals {
                intent: 60.0,
                friction: 20.0,
                clarity: 55.0,
                receptivity: 60.0,
                value: 65.0,
            },
            composite_score: 55.0,
            weights_used: ScoringConfig::default().weights,
            tier: Tier::Nudge,
            decision: Decision::Fire,
            gate_override: None,
            intervention_type: Some("nudge".into()),
            reasoning: "llm".into(),
            engine: Engine::Llm,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_a_comparison_row() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(1_000_000));
        let catalog: Arc<dyn FrictionCatalog> = Arc::new(StaticFrictionCatalog);
        let comparator = ShadowComparator::new(store.clone(), clock as Arc<dyn Clock>, catalog);

        let ctx = sample_ctx();
        store.put_session(&ctx.session).await.unwrap();
        let evaluation = sample_evaluation();
        let config = ScoringConfig::default();

        comparator.compare(&evaluation, &ctx, &config).await;

        let comparisons = store
            .get_shadow_comparisons_since(None, chrono::Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(comparisons.len(), 1);
        assert_eq!(comparisons[0].evaluation_id, "eval-1");
    }
}
