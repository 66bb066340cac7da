//! Evaluation Coordinator (spec §4.6): selects an engine mode, builds
//! context, invokes MSWIM, persists the result, and hands off to the
//! decision writer. Evaluations for one session are strictly serialized by
//! the caller (spec §5); this module assumes it is never entered twice
//! concurrently for the same `sessionId`.

use crate::clock::Clock;
use crate::config_store::ConfigStore;
use crate::errors::EngineResult;
use crate::experiments::ExperimentResolver;
use crate::friction::FrictionCatalog;
use crate::models::*;
use crate::mswim;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// External collaborator (spec §6.2). Must be replaceable by a deterministic
/// stub in tests.
#[async_trait]
pub trait LlmAnalyst: Send + Sync {
    async fn analyze(&self, ctx: &EvaluationContext) -> anyhow::Result<LlmOutput>;
}

/// Fired off non-blockingly whenever the primary pass ran on the `llm`
/// engine (spec §4.9); `shadow` implements this against `ShadowComparator`.
#[async_trait]
pub trait ShadowSink: Send + Sync {
    async fn compare(&self, evaluation: &Evaluation, ctx: &EvaluationContext, config: &ScoringConfig);
}

pub struct NoopShadowSink;

#[async_trait]
impl ShadowSink for NoopShadowSink {
    async fn compare(&self, _evaluation: &Evaluation, _ctx: &EvaluationContext, _config: &ScoringConfig) {}
}

/// Deterministic test double: derives signals from context alone so the
/// same input always produces the same output.
pub struct StubLlmAnalyst;

#[async_trait]
impl LlmAnalyst for StubLlmAnalyst {
    async fn analyze(&self, ctx: &EvaluationContext) -> anyhow::Result<LlmOutput> {
        let friction_ids: Vec<String> = ctx
            .new_events
            .iter()
            .filter_map(|e| e.friction_id.clone())
            .collect();
        Ok(LlmOutput {
            narrative: format!("{} new event(s) observed", ctx.new_events.len()),
            detected_friction_ids: friction_ids,
            signals: Signals {
                intent: 40.0,
                friction: 30.0,
                clarity: 50.0,
                receptivity: 50.0,
                value: 40.0,
            },
            recommended_action: "monitor".to_string(),
            reasoning: "stub analyst".to_string(),
        })
    }
}

pub struct EvaluationConfig {
    pub max_context_events: usize,
    pub default_engine: EvalEngineMode,
    pub shadow_enabled: bool,
    pub llm_timeout: Duration,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_context_events: 100,
            default_engine: EvalEngineMode::Auto,
            shadow_enabled: true,
            llm_timeout: Duration::from_millis(15_000),
        }
    }
}

pub struct EvaluationCoordinator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    configs: Arc<ConfigStore>,
    experiments: Arc<ExperimentResolver>,
    friction_catalog: Arc<dyn FrictionCatalog>,
    analyst: Arc<dyn LlmAnalyst>,
    shadow: Arc<dyn ShadowSink>,
    config: EvaluationConfig,
}

impl EvaluationCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        configs: Arc<ConfigStore>,
        experiments: Arc<ExperimentResolver>,
        friction_catalog: Arc<dyn FrictionCatalog>,
        analyst: Arc<dyn LlmAnalyst>,
        shadow: Arc<dyn ShadowSink>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            store,
            clock,
            configs,
            experiments,
            friction_catalog,
            analyst,
            shadow,
            config,
        }
    }

    /// Entry point: spec §4.6 `evaluateEventBatch`.
    pub async fn evaluate_event_batch(&self, session_id: &Id, event_ids: &[Id]) -> EngineResult<Option<Evaluation>> {
        let started = Instant::now();
        let Some(session) = self.store.get_session(session_id).await? else {
            warn!(session_id = %session_id, "evaluate called for unknown session");
            return Ok(None);
        };

        let overrides = self.experiments.resolve(session_id, Some(session.site_url.as_str())).await;
        let _override_guard = overrides
            .scoring_config_id
            .clone()
            .map(|config_id| self.configs.set_override(session_id.clone(), config_id));

        let engine = overrides.eval_engine.unwrap_or(self.config.default_engine);

        let new_events = self.store.get_events(event_ids).await?;
        let event_history = self
            .store
            .get_event_history(session_id, event_ids, self.config.max_context_events.saturating_sub(new_events.len()))
            .await?;
        let previous_evaluations = self.store.get_recent_evaluations(session_id, 5).await?;
        let previous_interventions = self.store.get_recent_interventions(session_id, 10).await?;

        let eval_ctx = EvaluationContext {
            session: session.clone(),
            event_history,
            new_events,
            previous_evaluations,
            previous_interventions,
        };

        let friction_ids = dedup_friction_ids(&eval_ctx.new_events);
        let page_type = eval_ctx
            .new_events
            .last()
            .map(|e| e.page_type)
            .unwrap_or(PageType::Other);
        let session_ctx = build_session_context(&eval_ctx, &friction_ids, page_type, self.clock.now());
        let device_is_mobile = eval_ctx.session.device_type == DeviceType::Mobile;

        let config = self.configs.resolve(session_id, Some(session.site_url.as_str())).await?;

        let (hint, narrative, reasoning_suffix, mut engine_used, frictions_found) = match engine {
            EvalEngineMode::Fast => {
                let (hint, frictions) = fast_synthesize(&session_ctx, &friction_ids, self.friction_catalog.as_ref());
                (hint, "fast synthesis (no LLM call)".to_string(), String::new(), Engine::Fast, frictions)
            }
            EvalEngineMode::Llm => self.run_llm(&eval_ctx, &friction_ids).await,
            EvalEngineMode::Auto => {
                let (fast_hint, fast_frictions) = fast_synthesize(&session_ctx, &friction_ids, self.friction_catalog.as_ref());
                let fast_result = mswim::evaluate(&fast_hint, &session_ctx, &fast_frictions, device_is_mobile, &config, self.friction_catalog.as_ref());
                let max_severity = fast_frictions
                    .iter()
                    .map(|id| self.friction_catalog.severity(id))
                    .fold(0.0_f64, f64::max);
                let should_escalate = fast_result.composite >= 65.0
                    || max_severity >= 75.0
                    || fast_result
                        .gate_override
                        .as_deref()
                        .is_some_and(|g| g.starts_with("FORCE_ESCALATE"));
                if should_escalate {
                    self.run_llm(&eval_ctx, &friction_ids).await
                } else {
                    (fast_hint, "fast synthesis (auto, below escalation threshold)".to_string(), String::new(), Engine::Fast, fast_frictions)
                }
            }
        };

        let mut result = mswim::evaluate(&hint, &session_ctx, &frictions_found, device_is_mobile, &config, self.friction_catalog.as_ref());
        if !reasoning_suffix.is_empty() {
            result.reasoning = format!("{} {}", result.reasoning, reasoning_suffix);
            engine_used = Engine::Fast;
        }

        let evaluation = Evaluation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            event_batch_ids: event_ids.to_vec(),
            narrative,
            frictions_found,
            signals: result.signals,
            composite_score: result.composite,
            weights_used: result.weights_used,
            tier: result.tier,
            decision: result.decision,
            gate_override: result.gate_override,
            intervention_type: result.tier.intervention_type().map(str::to_string),
            reasoning: result.reasoning,
            engine: engine_used,
            created_at: self.clock.now(),
        };

        self.store.put_evaluation(&evaluation).await?;
        info!(
            session_id = %session_id,
            tier = ?evaluation.tier,
            decision = ?evaluation.decision,
            composite = evaluation.composite_score,
            "evaluation complete"
        );

        match evaluation.engine {
            Engine::Fast => metrics::counter!("interaction_engine_evaluations_fast_total").increment(1),
            Engine::Llm => metrics::counter!("interaction_engine_evaluations_llm_total").increment(1),
        }
        if evaluation.gate_override.is_some() {
            metrics::counter!("interaction_engine_gate_override_total").increment(1);
        }
        metrics::histogram!("interaction_engine_evaluation_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        if self.config.shadow_enabled && evaluation.engine == Engine::Llm {
            let shadow = self.shadow.clone();
            let evaluation_for_shadow = evaluation.clone();
            let ctx_for_shadow = eval_ctx.clone();
            let config_for_shadow = config.clone();
            tokio::spawn(async move {
                shadow.compare(&evaluation_for_shadow, &ctx_for_shadow, &config_for_shadow).await;
            });
        }

        Ok(Some(evaluation))
    }

    /// Calls the LLM analyst with the configured deadline; on timeout or
    /// failure falls back to fast-path synthesis with `engine = fast` and a
    /// `[llm_timeout]`/`[llm_failure]` reasoning suffix (spec §5, §7).
    async fn run_llm(
        &self,
        ctx: &EvaluationContext,
        friction_ids: &[String],
    ) -> (Signals, String, String, Engine, Vec<String>) {
        match tokio::time::timeout(self.config.llm_timeout, self.analyst.analyze(ctx)).await {
            Ok(Ok(output)) => {
                let mut frictions = friction_ids.to_vec();
                for id in &output.detected_friction_ids {
                    if !frictions.contains(id) {
                        frictions.push(id.clone());
                    }
                }
                (output.signals, output.narrative, String::new(), Engine::Llm, frictions)
            }
            Ok(Err(err)) => {
                warn!(?err, "llm analyst call failed, falling back to fast path");
                let session_ctx = build_session_context(ctx, friction_ids, PageType::Other, self.clock.now());
                let (hint, frictions) = fast_synthesize(&session_ctx, friction_ids, self.friction_catalog.as_ref());
                (hint, "fast fallback".to_string(), format!("[llm_failure] {err}"), Engine::Fast, frictions)
            }
            Err(_) => {
                warn!("llm analyst call timed out");
                let session_ctx = build_session_context(ctx, friction_ids, PageType::Other, self.clock.now());
                let (hint, frictions) = fast_synthesize(&session_ctx, friction_ids, self.friction_catalog.as_ref());
                (hint, "fast fallback".to_string(), "[llm_timeout] LLM call exceeded deadline".to_string(), Engine::Fast, frictions)
            }
        }
    }
}

fn dedup_friction_ids(events: &[TrackEvent]) -> Vec<String> {
    let mut ids = Vec::new();
    for event in events {
        if let Some(id) = &event.friction_id {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }
    ids
}

fn funnel_base(page_type: PageType) -> f64 {
    match page_type {
        PageType::Landing => 10.0,
        PageType::Category => 15.0,
        PageType::SearchResults => 18.0,
        PageType::Pdp => 25.0,
        PageType::Cart => 30.0,
        PageType::Checkout => 35.0,
        PageType::Account => 12.0,
        PageType::Other => 10.0,
    }
}

/// Builds the MSWIM-facing `SessionContext` from evaluation state.
pub fn build_session_context(
    ctx: &EvaluationContext,
    friction_ids: &[String],
    page_type: PageType,
    now: chrono::DateTime<chrono::Utc>,
) -> SessionContext {
    let session = &ctx.session;
    let seconds_since = |t: Option<chrono::DateTime<chrono::Utc>>| t.map(|t| (now - t).num_seconds().max(0));
    let seconds_since_last_active = seconds_since(session.last_intervention_active_at);
    let seconds_since_last_nudge = seconds_since(session.last_intervention_nudge_at);
    let seconds_since_last_dismissal = seconds_since(session.last_dismissal_at);
    let seconds_since_last_intervention = [seconds_since_last_active, seconds_since_last_nudge]
        .into_iter()
        .flatten()
        .min();

    SessionContext {
        page_type,
        is_logged_in: session.is_logged_in,
        is_repeat_visitor: session.is_repeat_visitor,
        cart_value: session.cart_value,
        cart_item_count: session.cart_item_count,
        referrer_type: session.referrer_type,
        session_age_sec: session.session_age_sec(now),
        idle_seconds: session.idle_seconds(now),
        event_count: (ctx.event_history.len() + ctx.new_events.len()) as i64,
        total_interventions_fired: session.interventions_fired,
        total_dismissals: session.dismissals,
        seconds_since_last_intervention,
        seconds_since_last_active,
        seconds_since_last_nudge,
        seconds_since_last_dismissal,
        total_active: session.total_active_interventions,
        total_nudges: session.total_nudge_interventions,
        total_non_passive: session.total_non_passive_interventions,
        widget_opened_voluntarily: session.widget_opened_voluntarily,
        friction_ids: friction_ids.to_vec(),
        friction_ids_already_intervened: session.friction_ids_already_intervened.clone(),
    }
}

/// Fast-path raw-signal synthesis (spec §4.6 step 4 "fast"): rule-only
/// hints with no LLM call. Returns `(hints, frictionIds)` — the friction
/// list is just the ids already detected client-side, since the fast path
/// has no detector of its own.
pub fn fast_synthesize(ctx: &SessionContext, friction_ids: &[String], catalog: &dyn FrictionCatalog) -> (Signals, Vec<String>) {
    let mut intent = funnel_base(ctx.page_type);
    if ctx.is_logged_in {
        intent += 5.0;
    }
    if ctx.is_repeat_visitor {
        intent += 5.0;
    }
    if ctx.cart_item_count > 0 {
        intent += 8.0;
    }

    let friction = if friction_ids.is_empty() {
        10.0
    } else {
        friction_ids.iter().map(|id| catalog.severity(id)).fold(0.0_f64, f64::max)
    };

    let mut clarity = 40.0;
    if !friction_ids.is_empty() {
        clarity += 15.0;
    }
    if ctx.event_count >= 5 {
        clarity += 10.0;
    }
    if ctx.session_age_sec > 120 {
        clarity += 10.0;
    }

    let receptivity = 50.0;

    let mut value = match ctx.cart_value {
        v if v > 200.0 => 65.0,
        v if v > 100.0 => 50.0,
        v if v > 50.0 => 35.0,
        _ => 25.0,
    };
    if ctx.is_logged_in {
        value += 8.0;
    }
    if ctx.is_repeat_visitor {
        value += 8.0;
    }

    let clamp = |v: f64| v.clamp(0.0, 100.0);
    let signals = Signals {
        intent: clamp(intent),
        friction: clamp(friction),
        clarity: clamp(clarity),
        receptivity: clamp(receptivity),
        value: clamp(value),
    };
    (signals, friction_ids.to_vec())
}
