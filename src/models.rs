//! Core data model (spec §3). Every identifier is an opaque stable string
//! (`uuid::Uuid::new_v4().to_string()` at creation time).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Id = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferrerType {
    Direct,
    Organic,
    Paid,
    Social,
    Email,
    Referral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
}

/// One record per visitor-site pairing (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Id,
    pub visitor_id: String,
    pub site_url: String,
    pub device_type: DeviceType,
    pub referrer_type: ReferrerType,
    pub is_logged_in: bool,
    pub is_repeat_visitor: bool,
    pub cart_value: f64,
    pub cart_item_count: i64,
    pub interventions_fired: i64,
    pub dismissals: i64,
    pub conversions: i64,
    pub page_views: i64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub entry_page: Option<String>,
    pub exit_page: Option<String>,
    pub total_time_on_site_ms: i64,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub last_intervention_active_at: Option<DateTime<Utc>>,
    pub last_intervention_nudge_at: Option<DateTime<Utc>>,
    pub last_dismissal_at: Option<DateTime<Utc>>,
    pub total_active_interventions: i64,
    pub total_nudge_interventions: i64,
    pub total_non_passive_interventions: i64,
    pub friction_ids_already_intervened: Vec<String>,
    pub widget_opened_voluntarily: bool,
}

impl Session {
    pub fn new(id: Id, visitor_id: String, site_url: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            visitor_id,
            site_url,
            device_type: DeviceType::Desktop,
            referrer_type: ReferrerType::Direct,
            is_logged_in: false,
            is_repeat_visitor: false,
            cart_value: 0.0,
            cart_item_count: 0,
            interventions_fired: 0,
            dismissals: 0,
            conversions: 0,
            page_views: 0,
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            status: SessionStatus::Active,
            entry_page: None,
            exit_page: None,
            total_time_on_site_ms: 0,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            last_intervention_active_at: None,
            last_intervention_nudge_at: None,
            last_dismissal_at: None,
            total_active_interventions: 0,
            total_nudge_interventions: 0,
            total_non_passive_interventions: 0,
            friction_ids_already_intervened: Vec::new(),
            widget_opened_voluntarily: false,
        }
    }

    pub fn session_age_sec(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds().max(0)
    }

    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity_at).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Navigation,
    Search,
    Product,
    Cart,
    Checkout,
    Account,
    Engagement,
    Technical,
    System,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Landing,
    Category,
    SearchResults,
    Pdp,
    Cart,
    Checkout,
    Account,
    Other,
}

/// Canonical event, immutable after creation (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEvent {
    pub id: Id,
    pub session_id: Id,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub event_type: String,
    pub friction_id: Option<String>,
    pub page_type: PageType,
    pub page_url: String,
    pub raw_signals: String,
    pub previous_page_url: Option<String>,
    pub time_on_page_ms: Option<i64>,
    pub scroll_depth_pct: Option<f64>,
    pub session_sequence_number: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Monitor,
    Passive,
    Nudge,
    Active,
    Escalate,
}

impl Tier {
    pub fn intervention_type(self) -> Option<&'static str> {
        match self {
            Tier::Monitor => None,
            Tier::Passive => Some("passive"),
            Tier::Nudge => Some("nudge"),
            Tier::Active => Some("active"),
            Tier::Escalate => Some("escalate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Fire,
    Suppress,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Llm,
    Fast,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Signals {
    pub intent: f64,
    pub friction: f64,
    pub clarity: f64,
    pub receptivity: f64,
    pub value: f64,
}

impl Signals {
    pub fn get(&self, name: &str) -> f64 {
        match name {
            "intent" => self.intent,
            "friction" => self.friction,
            "clarity" => self.clarity,
            "receptivity" => self.receptivity,
            "value" => self.value,
            _ => 0.0,
        }
    }
}

/// One per flushed batch (spec §3). Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Id,
    pub session_id: Id,
    pub event_batch_ids: Vec<Id>,
    pub narrative: String,
    pub frictions_found: Vec<String>,
    pub signals: Signals,
    pub composite_score: f64,
    pub weights_used: Signals,
    pub tier: Tier,
    pub decision: Decision,
    pub gate_override: Option<String>,
    pub intervention_type: Option<String>,
    pub reasoning: String,
    pub engine: Engine,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Sent,
    Delivered,
    Dismissed,
    Converted,
    Ignored,
}

impl InterventionStatus {
    /// Status is monotonic along the lifecycle DAG; terminal states are final.
    pub fn can_transition_to(self, next: InterventionStatus) -> bool {
        use InterventionStatus::*;
        matches!(
            (self, next),
            (Sent, Delivered)
                | (Sent, Dismissed)
                | (Sent, Converted)
                | (Sent, Ignored)
                | (Delivered, Dismissed)
                | (Delivered, Converted)
                | (Delivered, Ignored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InterventionStatus::Dismissed | InterventionStatus::Converted | InterventionStatus::Ignored
        )
    }
}

/// Lifecycle record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Id,
    pub session_id: Id,
    pub evaluation_id: Id,
    pub intervention_type: String,
    pub action_code: String,
    pub friction_id: Option<String>,
    pub payload: serde_json::Value,
    pub mswim_score_at_fire: f64,
    pub tier_at_fire: Tier,
    pub timestamp: DateTime<Utc>,
    pub status: InterventionStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
    pub ignored_at: Option<DateTime<Utc>>,
    pub conversion_action: Option<String>,
}

/// Gate parameters (spec §4.7.4, §9 open question c).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParams {
    pub min_session_age_sec: i64,
    pub receptivity_floor: f64,
    pub dismissals_to_suppress: i64,
    pub duplicate_friction_requires_all: bool,
    pub cooldown_after_active_sec: i64,
    pub cooldown_after_nudge_sec: i64,
    pub cooldown_after_dismiss_sec: i64,
    pub max_active: i64,
    pub max_nudge: i64,
    pub max_non_passive: i64,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            min_session_age_sec: 30,
            receptivity_floor: 25.0,
            dismissals_to_suppress: 3,
            duplicate_friction_requires_all: true,
            cooldown_after_active_sec: 300,
            cooldown_after_nudge_sec: 120,
            cooldown_after_dismiss_sec: 180,
            max_active: 3,
            max_nudge: 5,
            max_non_passive: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub monitor: f64,
    pub passive: f64,
    pub nudge: f64,
    pub active: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            monitor: 29.0,
            passive: 49.0,
            nudge: 64.0,
            active: 79.0,
        }
    }
}

/// Per-session/site scoring profile (spec §3, §4.7.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub id: Id,
    pub weights: Signals,
    pub thresholds: Thresholds,
    pub gates: GateParams,
    pub site_url: Option<String>,
    pub is_active: bool,
    pub eval_engine: EvalEngineMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalEngineMode {
    Llm,
    Fast,
    Auto,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            weights: Signals {
                intent: 0.25,
                friction: 0.25,
                clarity: 0.15,
                receptivity: 0.20,
                value: 0.15,
            },
            thresholds: Thresholds::default(),
            gates: GateParams::default(),
            site_url: None,
            is_active: true,
            eval_engine: EvalEngineMode::Auto,
        }
    }
}

impl ScoringConfig {
    /// `|sum(weights) - 1.0| < 0.001`.
    pub fn validate(&self) -> Result<(), crate::errors::EngineError> {
        let sum = self.weights.intent
            + self.weights.friction
            + self.weights.clarity
            + self.weights.receptivity
            + self.weights.value;
        if (sum - 1.0).abs() >= 0.001 {
            return Err(crate::errors::EngineError::ConfigConflict(format!(
                "weights sum to {sum}, expected 1.0 +/- 0.001"
            )));
        }
        let t = &self.thresholds;
        if !(t.monitor < t.passive && t.passive < t.nudge && t.nudge < t.active) {
            return Err(crate::errors::EngineError::ConfigConflict(
                "thresholds must be strictly ascending".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: Id,
    pub weight: f64,
    pub eval_engine: Option<EvalEngineMode>,
    pub scoring_config_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Id,
    pub name: String,
    pub site_url: Option<String>,
    pub status: ExperimentStatus,
    pub traffic_percent: f64,
    pub variants: Vec<ExperimentVariant>,
    pub primary_metric: String,
    pub min_sample_size: i64,
}

impl Experiment {
    pub fn validate(&self) -> Result<(), crate::errors::EngineError> {
        if self.variants.len() < 2 {
            return Err(crate::errors::EngineError::ConfigConflict(
                "experiment needs at least 2 variants".to_string(),
            ));
        }
        let sum: f64 = self.variants.iter().map(|v| v.weight).sum();
        if (sum - 1.0).abs() >= 0.01 {
            return Err(crate::errors::EngineError::ConfigConflict(format!(
                "variant weights sum to {sum}, expected 1.0 +/- 0.01"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentAssignment {
    pub experiment_id: Id,
    pub session_id: Id,
    pub variant_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowComparison {
    pub id: Id,
    pub evaluation_id: Id,
    pub session_id: Id,
    pub production_signals: Signals,
    pub shadow_signals: Signals,
    pub production_composite: f64,
    pub shadow_composite: f64,
    pub composite_divergence: f64,
    pub tier_match: bool,
    pub decision_match: bool,
    pub gate_override_match: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    OneHour,
    SixHour,
    TwentyFourHour,
    SevenDay,
}

impl WindowType {
    pub fn duration(self) -> chrono::Duration {
        match self {
            WindowType::OneHour => chrono::Duration::hours(1),
            WindowType::SixHour => chrono::Duration::hours(6),
            WindowType::TwentyFourHour => chrono::Duration::hours(24),
            WindowType::SevenDay => chrono::Duration::days(7),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WindowType::OneHour => "1h",
            WindowType::SixHour => "6h",
            WindowType::TwentyFourHour => "24h",
            WindowType::SevenDay => "7d",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSnapshot {
    pub id: Id,
    pub window_type: WindowType,
    pub site_url: Option<String>,
    pub tier_agreement_rate: f64,
    pub decision_agreement_rate: f64,
    pub avg_composite_divergence: f64,
    pub converted_signal_means: Signals,
    pub dismissed_signal_means: Signals,
    pub conversion_rate: f64,
    pub dismissal_rate: f64,
    pub sample_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAlert {
    pub id: Id,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub window_type: WindowType,
    pub site_url: Option<String>,
    pub metric: String,
    pub expected: f64,
    pub actual: f64,
    pub message: String,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDatapoint {
    pub id: Id,
    pub intervention_id: Id,
    pub session_snapshot: serde_json::Value,
    pub event_batch: serde_json::Value,
    pub evaluation_id: Id,
    pub outcome: InterventionStatus,
    pub outcome_delay_ms: i64,
    pub has_outcome: bool,
    pub has_events: bool,
    pub has_narrative: bool,
    pub has_frictions: bool,
    pub session_age_sec: i64,
    pub event_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Id,
    pub job_name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

/// Evaluation-coordinator context (spec §4.6.2).
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub session: Session,
    pub event_history: Vec<TrackEvent>,
    pub new_events: Vec<TrackEvent>,
    pub previous_evaluations: Vec<Evaluation>,
    pub previous_interventions: Vec<Intervention>,
}

/// Session-level facts MSWIM's adjusters read (spec §4.7.2).
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub page_type: PageType,
    pub is_logged_in: bool,
    pub is_repeat_visitor: bool,
    pub cart_value: f64,
    pub cart_item_count: i64,
    pub referrer_type: ReferrerType,
    pub session_age_sec: i64,
    pub idle_seconds: i64,
    pub event_count: i64,
    pub total_interventions_fired: i64,
    pub total_dismissals: i64,
    pub seconds_since_last_intervention: Option<i64>,
    pub seconds_since_last_active: Option<i64>,
    pub seconds_since_last_nudge: Option<i64>,
    pub seconds_since_last_dismissal: Option<i64>,
    pub total_active: i64,
    pub total_nudges: i64,
    pub total_non_passive: i64,
    pub widget_opened_voluntarily: bool,
    pub friction_ids: Vec<String>,
    pub friction_ids_already_intervened: Vec<String>,
}

/// Output of the LLM analyst capability (spec §6.2) or its fast-path
/// synthesis (spec §4.6.4).
#[derive(Debug, Clone)]
pub struct LlmOutput {
    pub narrative: String,
    pub detected_friction_ids: Vec<String>,
    pub signals: Signals,
    pub recommended_action: String,
    pub reasoning: String,
}

pub type SignalContextMap = HashMap<Id, serde_json::Value>;
