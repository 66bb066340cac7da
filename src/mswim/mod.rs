//! MSWIM Scoring Engine (spec §4.7): five adjusted signals, a weighted
//! composite, tier resolution, and the gate-override chain that can replace
//! the score-based decision outright. Pure and non-suspending end-to-end
//! (spec §5) — no I/O, no async, so it can run synchronously inside the
//! evaluation coordinator.

use crate::friction::{self, FrictionCatalog};
use crate::models::{Decision, PageType, ReferrerType, ScoringConfig, SessionContext, Signals, Tier};

/// Output of a single MSWIM pass (spec §4.7, mirrors the persisted fields
/// of `Evaluation` that this module is responsible for).
#[derive(Debug, Clone)]
pub struct MswimResult {
    pub signals: Signals,
    pub composite: f64,
    pub weights_used: Signals,
    pub tier: Tier,
    pub decision: Decision,
    pub gate_override: Option<String>,
    pub reasoning: String,
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

fn round_clamp(value: f64) -> f64 {
    value.round().clamp(0.0, 100.0)
}

fn intent_signal(hint: f64, ctx: &SessionContext) -> f64 {
    let mut score = hint + funnel_base(ctx.page_type);
    if ctx.is_logged_in {
        score += 5.0;
    }
    if ctx.is_repeat_visitor {
        score += 8.0;
    }
    if ctx.cart_item_count > 0 {
        score += 10.0;
    }
    if ctx.cart_value > 100.0 {
        score += 5.0;
    }
    if ctx.cart_value > 250.0 {
        score += 5.0;
    }
    round_clamp(score)
}

fn friction_signal(hint: f64, friction_ids: &[String], catalog: &dyn FrictionCatalog) -> f64 {
    if friction_ids.is_empty() {
        return round_clamp(hint);
    }
    let max_severity = friction_ids
        .iter()
        .map(|id| catalog.severity(id))
        .fold(0.0_f64, f64::max);
    let mut score = hint.max(max_severity);
    let extra = (friction_ids.len() as i64 - 1).max(0).min(3);
    score += 5.0 * extra as f64;
    round_clamp(score)
}

fn clarity_signal(hint: f64, ctx: &SessionContext, friction_ids: &[String]) -> f64 {
    let mut score = hint;
    if !friction_ids.is_empty() {
        score += 10.0;
    }
    if ctx.session_age_sec < 60 {
        score -= 15.0;
    }
    if ctx.event_count <= 2 {
        score -= 10.0;
    }
    round_clamp(score)
}

fn receptivity_signal(hint: f64, ctx: &SessionContext, device_is_mobile: bool) -> f64 {
    let mut score = 80.0;
    score -= 15.0 * ctx.total_interventions_fired as f64;
    score -= 25.0 * ctx.total_dismissals as f64;
    if ctx.seconds_since_last_intervention.is_some_and(|s| s < 120) {
        score -= 10.0;
    }
    if device_is_mobile {
        score -= 5.0;
    }
    if ctx.widget_opened_voluntarily {
        score += 10.0;
    }
    if ctx.idle_seconds > 60 {
        score += 10.0;
    }
    let blended = 0.9 * score + 0.1 * hint;
    round_clamp(blended)
}

fn value_signal(hint: f64, ctx: &SessionContext) -> f64 {
    let base = match ctx.cart_value {
        v if v >= 500.0 => 90.0,
        v if v >= 200.0 => 75.0,
        v if v >= 100.0 => 60.0,
        v if v >= 50.0 => 45.0,
        v if v >= 20.0 => 30.0,
        _ => 20.0,
    };
    let mut score = base;
    if ctx.is_logged_in {
        score += 10.0;
    }
    if ctx.is_repeat_visitor {
        score += 8.0;
    }
    if ctx.referrer_type == ReferrerType::Paid {
        score += 5.0;
    }
    let blended = 0.8 * score + 0.2 * hint;
    round_clamp(blended)
}

fn tier_for(composite: f64, config: &ScoringConfig) -> Tier {
    let t = &config.thresholds;
    if composite <= t.monitor {
        Tier::Monitor
    } else if composite <= t.passive {
        Tier::Passive
    } else if composite <= t.nudge {
        Tier::Nudge
    } else if composite <= t.active {
        Tier::Active
    } else {
        Tier::Escalate
    }
}

fn force_escalate_gate(friction_ids: &[String]) -> Option<&'static str> {
    if friction_ids.iter().any(|id| friction::is_payment_failure(id)) {
        return Some("FORCE_ESCALATE_PAYMENT");
    }
    if friction_ids.iter().any(|id| friction::is_checkout_timeout(id)) {
        return Some("FORCE_ESCALATE_CHECKOUT_TIMEOUT");
    }
    if friction_ids.iter().any(|id| friction::is_help_search(id)) {
        return Some("FORCE_ESCALATE_HELP_SEARCH");
    }
    None
}

fn force_passive_gate(friction_ids: &[String]) -> Option<&'static str> {
    if friction_ids.iter().any(|id| friction::is_technical(id)) {
        return Some("FORCE_PASSIVE_TECHNICAL");
    }
    if friction_ids.iter().any(|id| friction::is_out_of_stock(id)) {
        return Some("FORCE_PASSIVE_OOS");
    }
    if friction_ids.iter().any(|id| friction::is_shipping(id)) {
        return Some("FORCE_PASSIVE_SHIPPING");
    }
    None
}

fn suppress_gate(signals: &Signals, ctx: &SessionContext, friction_ids: &[String], tier: Tier, config: &ScoringConfig) -> Option<&'static str> {
    let gates = &config.gates;
    let is_escalate = tier == Tier::Escalate;

    if ctx.session_age_sec < gates.min_session_age_sec {
        return Some("SESSION_TOO_YOUNG");
    }
    if signals.receptivity < gates.receptivity_floor && !is_escalate {
        return Some("RECEPTIVITY_FLOOR");
    }
    if ctx.total_dismissals >= gates.dismissals_to_suppress {
        return Some("DISMISS_CAP");
    }
    if !is_escalate && !friction_ids.is_empty() {
        let all_known = if gates.duplicate_friction_requires_all {
            friction_ids.iter().all(|id| ctx.friction_ids_already_intervened.contains(id))
        } else {
            friction_ids.iter().any(|id| ctx.friction_ids_already_intervened.contains(id))
        };
        if all_known {
            return Some("DUPLICATE_FRICTION");
        }
    }
    if !is_escalate {
        if ctx.seconds_since_last_active.is_some_and(|s| s < gates.cooldown_after_active_sec)
            || ctx.seconds_since_last_nudge.is_some_and(|s| s < gates.cooldown_after_nudge_sec)
            || ctx.seconds_since_last_dismissal.is_some_and(|s| s < gates.cooldown_after_dismiss_sec)
        {
            return Some("COOLDOWN_ACTIVE");
        }
    }
    if !is_escalate {
        let cap_exceeded = match tier {
            Tier::Active => ctx.total_active >= gates.max_active,
            Tier::Nudge => ctx.total_nudges >= gates.max_nudge,
            _ => false,
        } || ctx.total_non_passive >= gates.max_non_passive;
        if cap_exceeded {
            return Some("SESSION_CAP");
        }
    }
    None
}

fn top_contributors(signals: &Signals, weights: &Signals) -> Vec<(&'static str, f64)> {
    let mut contributions = vec![
        ("intent", signals.intent * weights.intent),
        ("friction", signals.friction * weights.friction),
        ("clarity", signals.clarity * weights.clarity),
        ("receptivity", signals.receptivity * weights.receptivity),
        ("value", signals.value * weights.value),
    ];
    contributions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    contributions.truncate(3);
    contributions
}

/// Run a full MSWIM pass. `hint` carries the raw per-signal values from
/// either the LLM analyst or the fast-path synthesis (spec §4.6.4);
/// `device_is_mobile` feeds the receptivity penalty.
pub fn evaluate(
    hint: &Signals,
    ctx: &SessionContext,
    friction_ids: &[String],
    device_is_mobile: bool,
    config: &ScoringConfig,
    catalog: &dyn FrictionCatalog,
) -> MswimResult {
    let signals = Signals {
        intent: intent_signal(hint.intent, ctx),
        friction: friction_signal(hint.friction, friction_ids, catalog),
        clarity: clarity_signal(hint.clarity, ctx, friction_ids),
        receptivity: receptivity_signal(hint.receptivity, ctx, device_is_mobile),
        value: value_signal(hint.value, ctx),
    };

    let weights = config.weights;
    let raw_composite = signals.intent * weights.intent
        + signals.friction * weights.friction
        + signals.clarity * weights.clarity
        + signals.receptivity * weights.receptivity
        + signals.value * weights.value;
    let composite = ((raw_composite * 100.0).round() / 100.0).clamp(0.0, 100.0);

    let mut tier = tier_for(composite, config);
    let mut decision = if tier == Tier::Monitor { Decision::Suppress } else { Decision::Fire };
    let mut gate_override = None;

    if let Some(gate) = force_escalate_gate(friction_ids) {
        tier = Tier::Escalate;
        decision = Decision::Fire;
        gate_override = Some(gate);
    } else if let Some(gate) = force_passive_gate(friction_ids) {
        tier = Tier::Passive;
        decision = Decision::Fire;
        gate_override = Some(gate);
    } else if tier != Tier::Passive {
        if let Some(gate) = suppress_gate(&signals, ctx, friction_ids, tier, config) {
            decision = Decision::Suppress;
            gate_override = Some(gate);
        }
    }

    let contributors = top_contributors(&signals, &weights);
    let reasoning = match gate_override {
        Some(gate) => format!(
            "gate={gate}; top signals: {}",
            contributors
                .iter()
                .map(|(name, contribution)| format!("{name}={contribution:.1}"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        None => format!(
            "tier={tier:?}; top signals: {}",
            contributors
                .iter()
                .map(|(name, contribution)| format!("{name}={contribution:.1}"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };

    MswimResult {
        signals,
        composite,
        weights_used: weights,
        tier,
        decision,
        gate_override: gate_override.map(str::to_string),
        reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::friction::StaticFrictionCatalog;
    use crate::models::{GateParams, Thresholds};

    fn base_ctx() -> SessionContext {
        SessionContext {
            page_type: PageType::Checkout,
            is_logged_in: true,
            is_repeat_visitor: false,
            cart_value: 150.0,
            cart_item_count: 2,
            referrer_type: ReferrerType::Direct,
            session_age_sec: 180,
            idle_seconds: 0,
            event_count: 6,
            total_interventions_fired: 0,
            total_dismissals: 0,
            seconds_since_last_intervention: None,
            seconds_since_last_active: None,
            seconds_since_last_nudge: None,
            seconds_since_last_dismissal: None,
            total_active: 0,
            total_nudges: 0,
            total_non_passive: 0,
            widget_opened_voluntarily: false,
            friction_ids: vec![],
            friction_ids_already_intervened: vec![],
        }
    }

    #[test]
    fn cold_checkout_fast_engine_fires_nudge() {
        let config = ScoringConfig::default();
        let catalog = StaticFrictionCatalog;
        let hint = Signals {
            intent: 48.0,
            friction: 10.0,
            clarity: 60.0,
            receptivity: 50.0,
            value: 70.0,
        };
        let result = evaluate(&hint, &base_ctx(), &[], false, &config, &catalog);
        assert_eq!(result.tier, Tier::Nudge);
        assert_eq!(result.decision, Decision::Fire);
        assert!(result.gate_override.is_none());
    }

    #[test]
    fn payment_failure_forces_escalate_regardless_of_composite() {
        let config = ScoringConfig::default();
        let catalog = StaticFrictionCatalog;
        let hint = Signals::default();
        let result = evaluate(&hint, &base_ctx(), &["F096".to_string()], false, &config, &catalog);
        assert_eq!(result.tier, Tier::Escalate);
        assert_eq!(result.decision, Decision::Fire);
        assert_eq!(result.gate_override.as_deref(), Some("FORCE_ESCALATE_PAYMENT"));
    }

    #[test]
    fn young_session_suppresses_even_with_nudge_composite() {
        let mut config = ScoringConfig::default();
        config.gates = GateParams {
            min_session_age_sec: 30,
            ..GateParams::default()
        };
        let catalog = StaticFrictionCatalog;
        let mut ctx = base_ctx();
        ctx.session_age_sec = 20;
        let hint = Signals {
            intent: 70.0,
            friction: 50.0,
            clarity: 60.0,
            receptivity: 60.0,
            value: 60.0,
        };
        let result = evaluate(&hint, &ctx, &[], false, &config, &catalog);
        assert_eq!(result.decision, Decision::Suppress);
        assert_eq!(result.gate_override.as_deref(), Some("SESSION_TOO_YOUNG"));
    }

    #[test]
    fn duplicate_friction_requires_all_ids_already_intervened() {
        let config = ScoringConfig::default();
        let catalog = StaticFrictionCatalog;
        let mut ctx = base_ctx();
        ctx.session_age_sec = 600;
        ctx.friction_ids_already_intervened = vec!["F010".to_string()];
        let hint = Signals {
            intent: 30.0,
            friction: 20.0,
            clarity: 60.0,
            receptivity: 60.0,
            value: 40.0,
        };
        let result = evaluate(&hint, &ctx, &["F010".to_string(), "F020".to_string()], false, &config, &catalog);
        // F020 is not yet in friction_ids_already_intervened, so the
        // duplicate-friction gate must NOT suppress under the default
        // "requires all" semantics.
        assert_ne!(result.gate_override.as_deref(), Some("DUPLICATE_FRICTION"));
    }

    #[test]
    fn threshold_boundary_at_monitor_suppresses() {
        let config = ScoringConfig {
            thresholds: Thresholds {
                monitor: 29.0,
                passive: 49.0,
                nudge: 64.0,
                active: 79.0,
            },
            ..ScoringConfig::default()
        };
        assert_eq!(tier_for(29.0, &config), Tier::Monitor);
        assert_eq!(tier_for(29.1, &config), Tier::Passive);
    }
}
