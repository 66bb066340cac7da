//! Drift Detector & Job Runner (spec §4.11): named background jobs with
//! single-flight-per-name execution and a `JobRun` audit trail, plus
//! windowed aggregation over shadow comparisons and interventions that
//! raises deduplicated alerts when the production engine drifts from the
//! shadow baseline. Grounded on the teacher's periodic poller loops
//! (`main.rs`) and its kill-switch trip/dedup logic.

use crate::clock::Clock;
use crate::config::DriftSettings;
use crate::errors::EngineResult;
use crate::models::*;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ALL_WINDOWS: [WindowType; 4] = [
    WindowType::OneHour,
    WindowType::SixHour,
    WindowType::TwentyFourHour,
    WindowType::SevenDay,
];

/// One job execution slot, keyed by job name, so two triggers of the same
/// job never overlap (spec §4.11 "single-flight per job name").
pub struct JobRunner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    drift: DriftSettings,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_duration: Duration,
}

impl JobRunner {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, drift: DriftSettings) -> Self {
        Self {
            store,
            clock,
            drift,
            locks: tokio::sync::Mutex::new(HashMap::new()),
            max_duration: Duration::from_secs(300),
        }
    }

    async fn lock_for(&self, job_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(job_name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Runs `job_name`, recording a `JobRun` row for observability. Skips
    /// (returns `Ok(false)`) if the same job is already in flight.
    pub async fn run_named<F, Fut>(&self, job_name: &str, triggered_by: &str, work: F) -> EngineResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>>,
    {
        let lock = self.lock_for(job_name).await;
        let Ok(_guard) = lock.try_lock() else {
            info!(job_name, "job already in flight, skipping this trigger");
            return Ok(false);
        };

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = self.clock.now();
        let mut run = JobRun {
            id: run_id.clone(),
            job_name: job_name.to_string(),
            status: JobStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            summary: None,
            error_message: None,
            triggered_by: triggered_by.to_string(),
        };
        self.store.put_job_run(&run).await?;

        let outcome = tokio::time::timeout(self.max_duration, work()).await;
        let completed_at = self.clock.now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        run.completed_at = Some(completed_at);
        run.duration_ms = Some(duration_ms);
        match outcome {
            Ok(Ok(summary)) => {
                run.status = JobStatus::Completed;
                run.summary = Some(summary);
            }
            Ok(Err(err)) => {
                run.status = JobStatus::Failed;
                run.error_message = Some(err.to_string());
                warn!(job_name, ?err, "job failed");
            }
            Err(_) => {
                run.status = JobStatus::Failed;
                run.error_message = Some("timeout".to_string());
                warn!(job_name, "job exceeded max duration, marked failed");
            }
        }
        self.store.put_job_run(&run).await?;
        Ok(true)
    }

    /// `drift_check` job: snapshots every window × (global + known sites)
    /// and raises deduplicated alerts for anomalies.
    pub async fn run_drift_check(&self, site_urls: &[Option<String>], triggered_by: &str) -> EngineResult<bool> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let drift = self.drift.clone();
        let sites = site_urls.to_vec();
        self.run_named("drift_check", triggered_by, move || async move {
            let mut snapshot_count = 0;
            let mut alert_count = 0;
            for window in ALL_WINDOWS {
                for site in &sites {
                    let snapshot = build_snapshot(store.as_ref(), clock.as_ref(), window, site.as_deref()).await?;
                    if snapshot.sample_count == 0 {
                        continue;
                    }
                    // Comparing the 7d window against itself as baseline is
                    // vacuous, so only shorter windows get a baseline.
                    let baseline = if window == WindowType::SevenDay {
                        None
                    } else {
                        store.get_latest_drift_snapshot(WindowType::SevenDay, site.as_deref()).await?
                    };
                    store.put_drift_snapshot(&snapshot).await?;
                    snapshot_count += 1;

                    let alerts = detect_anomalies(&snapshot, baseline.as_ref(), &drift);
                    for mut alert in alerts {
                        let since = clock.now() - chrono::Duration::hours(6);
                        let existing = store
                            .find_unresolved_alert_since(&alert.alert_type, window, site.as_deref(), since)
                            .await?;
                        if existing.is_some() {
                            continue;
                        }
                        alert.created_at = clock.now();
                        store.put_drift_alert(&alert).await?;
                        alert_count += 1;
                    }
                }
            }
            Ok(serde_json::json!({ "snapshots": snapshot_count, "alerts": alert_count }))
        })
        .await
    }
}

/// Aggregates `ShadowComparison`s and `Intervention`s over `window` into a
/// single `DriftSnapshot` (spec §4.11.2).
async fn build_snapshot(
    store: &dyn Store,
    clock: &dyn Clock,
    window: WindowType,
    site_url: Option<&str>,
) -> anyhow::Result<DriftSnapshot> {
    let since = clock.now() - window.duration();
    let comparisons = store.get_shadow_comparisons_since(site_url, since).await?;
    let interventions = store.get_interventions_since(site_url, since).await?;

    let sample_count = comparisons.len() as i64;
    let (tier_matches, decision_matches, divergence_sum) = comparisons.iter().fold((0i64, 0i64, 0.0), |(t, d, sum), c| {
        (
            t + c.tier_match as i64,
            d + c.decision_match as i64,
            sum + c.composite_divergence,
        )
    });

    let tier_agreement_rate = if sample_count > 0 {
        tier_matches as f64 / sample_count as f64
    } else {
        1.0
    };
    let decision_agreement_rate = if sample_count > 0 {
        decision_matches as f64 / sample_count as f64
    } else {
        1.0
    };
    let avg_composite_divergence = if sample_count > 0 { divergence_sum / sample_count as f64 } else { 0.0 };

    let converted_signal_means = mean_signals(&comparisons, &interventions, InterventionStatus::Converted);
    let dismissed_signal_means = mean_signals(&comparisons, &interventions, InterventionStatus::Dismissed);

    let total_interventions = interventions.len().max(1) as f64;
    let conversion_rate = interventions.iter().filter(|i| i.status == InterventionStatus::Converted).count() as f64 / total_interventions;
    let dismissal_rate = interventions.iter().filter(|i| i.status == InterventionStatus::Dismissed).count() as f64 / total_interventions;

    Ok(DriftSnapshot {
        id: uuid::Uuid::new_v4().to_string(),
        window_type: window,
        site_url: site_url.map(str::to_string),
        tier_agreement_rate,
        decision_agreement_rate,
        avg_composite_divergence,
        converted_signal_means,
        dismissed_signal_means,
        conversion_rate,
        dismissal_rate,
        sample_count,
        created_at: clock.now(),
    })
}

/// Mean production signals for comparisons whose session had an
/// intervention reaching `outcome` in the same window. Best-effort: the
/// comparison and intervention sets aren't joined by id in this model, so
/// this approximates via session membership.
fn mean_signals(comparisons: &[ShadowComparison], interventions: &[Intervention], outcome: InterventionStatus) -> Signals {
    let matching_sessions: std::collections::HashSet<&Id> = interventions
        .iter()
        .filter(|i| i.status == outcome)
        .map(|i| &i.session_id)
        .collect();
    let relevant: Vec<&ShadowComparison> = comparisons
        .iter()
        .filter(|c| matching_sessions.contains(&c.session_id))
        .collect();
    if relevant.is_empty() {
        return Signals::default();
    }
    let n = relevant.len() as f64;
    Signals {
        intent: relevant.iter().map(|c| c.production_signals.intent).sum::<f64>() / n,
        friction: relevant.iter().map(|c| c.production_signals.friction).sum::<f64>() / n,
        clarity: relevant.iter().map(|c| c.production_signals.clarity).sum::<f64>() / n,
        receptivity: relevant.iter().map(|c| c.production_signals.receptivity).sum::<f64>() / n,
        value: relevant.iter().map(|c| c.production_signals.value).sum::<f64>() / n,
    }
}

/// Severity: critical when a floor metric falls more than 22%/20% below its
/// configured floor (tier/decision agreement respectively) or the
/// conversion rate drop exceeds the configured percent; warning otherwise
/// once any threshold is breached. `baseline` is the latest 7d snapshot,
/// used for the relative conversion-drop and signal-shift checks; `None`
/// when no baseline exists yet or `snapshot` itself is the 7d window.
fn detect_anomalies(snapshot: &DriftSnapshot, baseline: Option<&DriftSnapshot>, settings: &DriftSettings) -> Vec<DriftAlert> {
    let mut alerts = Vec::new();

    if snapshot.tier_agreement_rate < settings.tier_agreement_floor {
        let severity = if snapshot.tier_agreement_rate < settings.tier_agreement_floor * 0.78 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        alerts.push(make_alert(
            "tier_agreement_low",
            severity,
            snapshot,
            "tier_agreement_rate",
            settings.tier_agreement_floor,
            snapshot.tier_agreement_rate,
        ));
    }

    if snapshot.decision_agreement_rate < settings.decision_agreement_floor {
        let severity = if snapshot.decision_agreement_rate < settings.decision_agreement_floor * 0.80 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        alerts.push(make_alert(
            "decision_agreement_low",
            severity,
            snapshot,
            "decision_agreement_rate",
            settings.decision_agreement_floor,
            snapshot.decision_agreement_rate,
        ));
    }

    if snapshot.avg_composite_divergence > settings.max_composite_divergence {
        alerts.push(make_alert(
            "composite_divergence_high",
            AlertSeverity::Warning,
            snapshot,
            "avg_composite_divergence",
            settings.max_composite_divergence,
            snapshot.avg_composite_divergence,
        ));
    }

    if let Some(baseline) = baseline {
        if baseline.conversion_rate > 0.0 {
            let relative_drop_pct = (baseline.conversion_rate - snapshot.conversion_rate) / baseline.conversion_rate * 100.0;
            if relative_drop_pct > settings.conversion_rate_drop_percent {
                alerts.push(make_alert(
                    "conversion_rate_drop",
                    AlertSeverity::Critical,
                    snapshot,
                    "conversion_rate",
                    baseline.conversion_rate,
                    snapshot.conversion_rate,
                ));
            }
        }

        let shift = max_signal_shift(&snapshot.converted_signal_means, &baseline.converted_signal_means);
        if shift > settings.signal_shift_threshold {
            alerts.push(make_alert(
                "signal_shift",
                AlertSeverity::Warning,
                snapshot,
                "converted_signal_means",
                settings.signal_shift_threshold,
                shift,
            ));
        }
    }

    alerts
}

/// Largest absolute per-signal difference between two signal means, used to
/// flag a shift against the 7d baseline regardless of which signal moved.
fn max_signal_shift(a: &Signals, b: &Signals) -> f64 {
    [
        (a.intent - b.intent).abs(),
        (a.friction - b.friction).abs(),
        (a.clarity - b.clarity).abs(),
        (a.receptivity - b.receptivity).abs(),
        (a.value - b.value).abs(),
    ]
    .into_iter()
    .fold(0.0, f64::max)
}

fn make_alert(alert_type: &str, severity: AlertSeverity, snapshot: &DriftSnapshot, metric: &str, expected: f64, actual: f64) -> DriftAlert {
    DriftAlert {
        id: uuid::Uuid::new_v4().to_string(),
        alert_type: alert_type.to_string(),
        severity,
        window_type: snapshot.window_type,
        site_url: snapshot.site_url.clone(),
        metric: metric.to_string(),
        expected,
        actual,
        message: format!("{metric} is {actual:.3}, expected at least {expected:.3} over {}", snapshot.window_type.as_str()),
        acknowledged: false,
        created_at: snapshot.created_at,
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn drift_check_runs_without_alerting_on_healthy_data() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(1_700_000_000_000));
        let runner = JobRunner::new(store.clone(), clock as Arc<dyn Clock>, DriftSettings::default());

        let ran = runner.run_drift_check(&[None], "test").await.unwrap();
        assert!(ran);
    }

    #[tokio::test]
    async fn concurrent_triggers_of_same_job_single_flight() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(1_700_000_000_000));
        let runner = Arc::new(JobRunner::new(store, clock as Arc<dyn Clock>, DriftSettings::default()));

        let r1 = runner.clone();
        let r2 = runner.clone();
        let (a, b) = tokio::join!(
            r1.run_named("slow_job", "test", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(serde_json::json!({}))
            }),
            r2.run_named("slow_job", "test", || async { Ok(serde_json::json!({})) }),
        );
        let ran_count = [a.unwrap(), b.unwrap()].into_iter().filter(|x| *x).count();
        assert_eq!(ran_count, 1);
    }
}
