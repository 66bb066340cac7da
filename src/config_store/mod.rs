//! Scoring Config Store (spec §4.12): active-config resolution scoped by
//! site, with a per-session experiment override that lives only for the
//! duration of one evaluation call (spec §9 "global mutable state" note —
//! expressed here as a scoped guard rather than a map callers must remember
//! to clear).

use crate::errors::EngineResult;
use crate::models::{Id, ScoringConfig};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ConfigStore {
    store: Arc<dyn Store>,
    /// session_id -> scoring_config_id, set at evaluation start and removed
    /// on exit via `OverrideGuard`'s `Drop`, so it's released on every exit
    /// path including panics unwinding through the evaluation call.
    overrides: parking_lot::RwLock<HashMap<Id, Id>>,
}

/// Held for the lifetime of one evaluation call; dropping it clears the
/// per-session override regardless of how the call ends.
pub struct OverrideGuard<'a> {
    store: &'a ConfigStore,
    session_id: Id,
}

impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        self.store.overrides.write().remove(&self.session_id);
    }
}

impl ConfigStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            overrides: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Registers `config_id` as this session's override for as long as the
    /// returned guard is alive.
    pub fn set_override(&self, session_id: Id, config_id: Id) -> OverrideGuard<'_> {
        self.overrides.write().insert(session_id.clone(), config_id);
        OverrideGuard {
            store: self,
            session_id,
        }
    }

    /// Resolution order (spec §4.7.1): per-session override, site-active,
    /// global-active, compiled defaults.
    pub async fn resolve(&self, session_id: &Id, site_url: Option<&str>) -> EngineResult<ScoringConfig> {
        if let Some(override_id) = self.overrides.read().get(session_id).cloned() {
            if let Some(config) = self.store.get_scoring_config(&override_id).await? {
                return Ok(config);
            }
        }
        if let Some(site) = site_url {
            if let Some(config) = self.store.get_active_scoring_config(Some(site)).await? {
                return Ok(config);
            }
        }
        if let Some(config) = self.store.get_active_scoring_config(None).await? {
            return Ok(config);
        }
        Ok(ScoringConfig::default())
    }

    /// Validates, persists, then atomically deactivates any other config in
    /// the same `siteUrl` scope before activating `id`.
    pub async fn activate(&self, config: &ScoringConfig) -> EngineResult<()> {
        config.validate()?;
        self.store.put_scoring_config(config).await?;
        self.store.activate_scoring_config(&config.id).await
    }

    pub async fn get(&self, id: &Id) -> EngineResult<Option<ScoringConfig>> {
        self.store.get_scoring_config(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn falls_back_to_compiled_defaults_with_nothing_active() {
        let store = ConfigStore::new(Arc::new(MemoryStore::new()));
        let config = store.resolve(&"s1".to_string(), Some("site.example")).await.unwrap();
        assert_eq!(config.id, "default");
    }

    #[tokio::test]
    async fn session_override_wins_over_active_configs() {
        let backing = Arc::new(MemoryStore::new());
        let store = ConfigStore::new(backing.clone());

        let mut global = ScoringConfig::default();
        global.id = "global".into();
        store.activate(&global).await.unwrap();

        let mut override_config = ScoringConfig::default();
        override_config.id = "override".into();
        override_config.is_active = false;
        backing.put_scoring_config(&override_config).await.unwrap();

        let _guard = store.set_override("s1".to_string(), "override".to_string());
        let resolved = store.resolve(&"s1".to_string(), None).await.unwrap();
        assert_eq!(resolved.id, "override");
    }

    #[tokio::test]
    async fn override_is_released_when_guard_drops() {
        let backing = Arc::new(MemoryStore::new());
        let store = ConfigStore::new(backing.clone());
        let mut override_config = ScoringConfig::default();
        override_config.id = "override".into();
        backing.put_scoring_config(&override_config).await.unwrap();

        {
            let _guard = store.set_override("s1".to_string(), "override".to_string());
            assert_eq!(store.resolve(&"s1".to_string(), None).await.unwrap().id, "override");
        }
        assert_eq!(store.resolve(&"s1".to_string(), None).await.unwrap().id, "default");
    }

    #[tokio::test]
    async fn activate_rejects_invalid_weights() {
        let store = ConfigStore::new(Arc::new(MemoryStore::new()));
        let mut config = ScoringConfig::default();
        config.weights.intent = 10.0;
        assert!(store.activate(&config).await.is_err());
    }
}
