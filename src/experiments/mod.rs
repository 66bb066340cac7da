//! Experiment Resolver (spec §4.5): deterministic per-session assignment to
//! a variant, grounded in the teacher's `ABTestTracker` (cache assignment by
//! key, compute variant once, read back thereafter) but with FNV-1a hashing
//! in place of the teacher's seeded LCG so assignments are reproducible
//! across implementations (spec §9).

use crate::errors::EngineResult;
use crate::models::{EvalEngineMode, Experiment, ExperimentAssignment, Id};
use crate::store::Store;
use std::sync::Arc;
use tracing::warn;

/// Overrides an enrolled session picks up for this evaluation call.
#[derive(Debug, Clone, Default)]
pub struct ExperimentOverrides {
    pub experiment_id: Option<Id>,
    pub variant_id: Option<Id>,
    pub eval_engine: Option<EvalEngineMode>,
    pub scoring_config_id: Option<Id>,
}

pub struct ExperimentResolver {
    store: Arc<dyn Store>,
    enabled: bool,
}

impl ExperimentResolver {
    pub fn new(store: Arc<dyn Store>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Never blocks the primary evaluation path: any failure degrades to
    /// "no overrides" rather than propagating.
    pub async fn resolve(&self, session_id: &Id, site_url: Option<&str>) -> ExperimentOverrides {
        if !self.enabled {
            return ExperimentOverrides::default();
        }
        match self.try_resolve(session_id, site_url).await {
            Ok(overrides) => overrides,
            Err(err) => {
                warn!(session_id = %session_id, ?err, "experiment resolution failed, continuing unenrolled");
                ExperimentOverrides::default()
            }
        }
    }

    async fn try_resolve(&self, session_id: &Id, site_url: Option<&str>) -> EngineResult<ExperimentOverrides> {
        let Some(experiment) = self.store.get_active_experiment(site_url).await? else {
            return Ok(ExperimentOverrides::default());
        };

        if let Some(assignment) = self.store.get_assignment(&experiment.id, session_id).await? {
            return Ok(overrides_for(&experiment, &assignment));
        }

        let enrollment_hash = fnv1a_unit(&format!("{session_id}/{}/enroll", experiment.id));
        if enrollment_hash >= experiment.traffic_percent / 100.0 {
            return Ok(ExperimentOverrides::default());
        }

        let variant_hash = fnv1a_unit(&format!("{session_id}/{}/variant", experiment.id));
        let mut cumulative = 0.0;
        let variant = experiment
            .variants
            .iter()
            .find(|v| {
                cumulative += v.weight;
                variant_hash < cumulative
            })
            .or_else(|| experiment.variants.last())
            .cloned();

        let Some(variant) = variant else {
            return Ok(ExperimentOverrides::default());
        };

        let assignment = ExperimentAssignment {
            experiment_id: experiment.id.clone(),
            session_id: session_id.clone(),
            variant_id: variant.id.clone(),
        };
        self.store.put_assignment(&assignment).await?;

        Ok(overrides_for(&experiment, &assignment))
    }
}

fn overrides_for(experiment: &Experiment, assignment: &ExperimentAssignment) -> ExperimentOverrides {
    let variant = experiment.variants.iter().find(|v| v.id == assignment.variant_id);
    ExperimentOverrides {
        experiment_id: Some(experiment.id.clone()),
        variant_id: Some(assignment.variant_id.clone()),
        eval_engine: variant.and_then(|v| v.eval_engine),
        scoring_config_id: variant.and_then(|v| v.scoring_config_id.clone()),
    }
}

/// FNV-1a over the UTF-8 bytes of `input`, mapped to `[0,1)`.
fn fnv1a_unit(input: &str) -> f64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Experiment, ExperimentStatus, ExperimentVariant};
    use crate::store::MemoryStore;

    fn two_variant_experiment() -> Experiment {
        Experiment {
            id: "exp1".into(),
            name: "nudge-copy".into(),
            site_url: None,
            status: ExperimentStatus::Running,
            traffic_percent: 100.0,
            variants: vec![
                ExperimentVariant {
                    id: "control".into(),
                    weight: 0.5,
                    eval_engine: None,
                    scoring_config_id: None,
                },
                ExperimentVariant {
                    id: "treatment".into(),
                    weight: 0.5,
                    eval_engine: Some(EvalEngineMode::Fast),
                    scoring_config_id: None,
                },
            ],
            primary_metric: "conversion_rate".into(),
            min_sample_size: 100,
        }
    }

    #[tokio::test]
    async fn assignment_is_deterministic_across_calls() {
        let store = Arc::new(MemoryStore::new());
        store.seed_experiment(two_variant_experiment());
        let resolver = ExperimentResolver::new(store, true);

        let first = resolver.resolve(&"session-1".to_string(), None).await;
        let second = resolver.resolve(&"session-1".to_string(), None).await;
        assert_eq!(first.variant_id, second.variant_id);
        assert!(first.variant_id.is_some());
    }

    #[tokio::test]
    async fn zero_traffic_never_enrolls() {
        let store = Arc::new(MemoryStore::new());
        let mut experiment = two_variant_experiment();
        experiment.traffic_percent = 0.0;
        store.seed_experiment(experiment);
        let resolver = ExperimentResolver::new(store, true);

        let overrides = resolver.resolve(&"session-1".to_string(), None).await;
        assert!(overrides.variant_id.is_none());
    }

    #[tokio::test]
    async fn disabled_resolver_never_enrolls() {
        let store = Arc::new(MemoryStore::new());
        store.seed_experiment(two_variant_experiment());
        let resolver = ExperimentResolver::new(store, false);

        let overrides = resolver.resolve(&"session-1".to_string(), None).await;
        assert!(overrides.variant_id.is_none());
    }
}
