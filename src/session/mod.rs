//! Session Store (spec §4.3): authoritative session state with a 30-minute
//! visitor cache and counter mutations serialized per session so no caller
//! ever reads-then-writes a counter across a suspension point.

use crate::clock::Clock;
use crate::errors::EngineResult;
use crate::models::*;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

const VISITOR_CACHE_TTL_SEC: i64 = 30 * 60;
const IDLE_TIMEOUT_SEC: i64 = 30 * 60;

#[derive(Clone, Copy)]
struct CacheEntry {
    last_seen_ms: i64,
}

struct SessionLocks {
    locks: parking_lot::Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    fn new() -> Self {
        Self {
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, session_id: &Id) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// New-session identity, everything C2 observes about a first event.
#[derive(Debug, Clone)]
pub struct NewSessionInfo {
    pub visitor_id: String,
    pub site_url: String,
    pub device_type: DeviceType,
    pub referrer_type: ReferrerType,
    pub is_logged_in: bool,
    pub is_repeat_visitor: bool,
}

pub struct SessionStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    visitor_cache: parking_lot::RwLock<HashMap<String, CacheEntry>>,
    locks: SessionLocks,
    /// Ids touched since startup; the sweeper only has this process-local
    /// view since `Store` deliberately has no "list all sessions" query.
    known_ids: parking_lot::RwLock<std::collections::HashSet<Id>>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            visitor_cache: parking_lot::RwLock::new(HashMap::new()),
            locks: SessionLocks::new(),
            known_ids: parking_lot::RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Returns the cached session if present and fresh, touching its
    /// `lastActivityAt`; otherwise creates and persists a new one.
    pub async fn get_or_create_session(&self, info: NewSessionInfo) -> EngineResult<Session> {
        let now_ms = self.clock.now_ms();
        let cached_fresh = {
            let cache = self.visitor_cache.read();
            cache
                .get(&info.visitor_id)
                .filter(|entry| now_ms - entry.last_seen_ms < VISITOR_CACHE_TTL_SEC * 1000)
                .is_some()
        };

        if cached_fresh {
            if let Some(mut session) = self.store.get_session_by_visitor(&info.visitor_id).await? {
                if session.status != SessionStatus::Ended {
                    session.last_activity_at = self.clock.now();
                    if session.status == SessionStatus::Idle {
                        session.status = SessionStatus::Active;
                    }
                    self.store.put_session(&session).await?;
                    self.visitor_cache
                        .write()
                        .insert(info.visitor_id.clone(), CacheEntry { last_seen_ms: now_ms });
                    return Ok(session);
                }
            }
        }

        if let Some(mut session) = self.store.get_session_by_visitor(&info.visitor_id).await? {
            if session.status != SessionStatus::Ended {
                session.last_activity_at = self.clock.now();
                session.status = SessionStatus::Active;
                self.store.put_session(&session).await?;
                self.visitor_cache
                    .write()
                    .insert(info.visitor_id.clone(), CacheEntry { last_seen_ms: now_ms });
                return Ok(session);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut session = Session::new(id, info.visitor_id.clone(), info.site_url);
        session.device_type = info.device_type;
        session.referrer_type = info.referrer_type;
        session.is_logged_in = info.is_logged_in;
        session.is_repeat_visitor = info.is_repeat_visitor;
        session.started_at = self.clock.now();
        session.last_activity_at = session.started_at;

        self.store.put_session(&session).await?;
        self.visitor_cache
            .write()
            .insert(info.visitor_id, CacheEntry { last_seen_ms: now_ms });
        self.known_ids.write().insert(session.id.clone());
        debug!(session_id = %session.id, "created session");
        Ok(session)
    }

    pub async fn get(&self, id: &Id) -> EngineResult<Option<Session>> {
        self.store.get_session(id).await
    }

    async fn mutate<F>(&self, session_id: &Id, f: F) -> EngineResult<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock().await;
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        f(&mut session);
        session.last_activity_at = self.clock.now();
        self.store.put_session(&session).await?;
        Ok(Some(session))
    }

    pub async fn touch(&self, session_id: &Id) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |_| {}).await
    }

    pub async fn increment_page_views(&self, session_id: &Id) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| s.page_views += 1).await
    }

    pub async fn record_entry_page_if_unset(
        &self,
        session_id: &Id,
        page_url: &str,
        utm_source: Option<String>,
        utm_medium: Option<String>,
        utm_campaign: Option<String>,
    ) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| {
            if s.entry_page.is_none() {
                s.entry_page = Some(page_url.to_string());
                s.utm_source = utm_source;
                s.utm_medium = utm_medium;
                s.utm_campaign = utm_campaign;
            }
        })
        .await
    }

    pub async fn record_exit_page(
        &self,
        session_id: &Id,
        page_url: &str,
        time_on_page_ms: i64,
    ) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| {
            s.exit_page = Some(page_url.to_string());
            s.total_time_on_site_ms += time_on_page_ms.max(0);
        })
        .await
    }

    pub async fn update_cart(&self, session_id: &Id, value: f64, item_count: i64) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| {
            s.cart_value = value.max(0.0);
            s.cart_item_count = item_count.max(0);
        })
        .await
    }

    pub async fn record_intervention_fired(
        &self,
        session_id: &Id,
        tier: Tier,
        friction_ids: &[String],
    ) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| {
            s.interventions_fired += 1;
            let now = s.last_activity_at;
            match tier {
                Tier::Active => {
                    s.total_active_interventions += 1;
                    s.last_intervention_active_at = Some(now);
                    s.total_non_passive_interventions += 1;
                }
                Tier::Nudge => {
                    s.total_nudge_interventions += 1;
                    s.last_intervention_nudge_at = Some(now);
                    s.total_non_passive_interventions += 1;
                }
                Tier::Escalate => {
                    s.total_non_passive_interventions += 1;
                }
                Tier::Passive | Tier::Monitor => {}
            }
            for id in friction_ids {
                if !s.friction_ids_already_intervened.contains(id) {
                    s.friction_ids_already_intervened.push(id.clone());
                }
            }
        })
        .await
    }

    pub async fn record_dismissal(&self, session_id: &Id) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| {
            s.dismissals += 1;
            s.last_dismissal_at = Some(s.last_activity_at);
        })
        .await
    }

    pub async fn record_conversion(&self, session_id: &Id) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| s.conversions += 1).await
    }

    pub async fn mark_widget_opened_voluntarily(&self, session_id: &Id) -> EngineResult<Option<Session>> {
        self.mutate(session_id, |s| s.widget_opened_voluntarily = true).await
    }

    pub async fn end_session(&self, session_id: &Id) -> EngineResult<Option<Session>> {
        let now = self.clock.now();
        self.mutate(session_id, |s| {
            s.status = SessionStatus::Ended;
            s.ended_at = Some(now);
        })
        .await
    }

    /// Ends sessions idle past the 30-minute timeout. Intended to run every
    /// 5 minutes from a background task; returns the count ended.
    pub async fn sweep_idle(&self) -> EngineResult<usize> {
        let ids: Vec<Id> = self.known_ids.read().iter().cloned().collect();
        let mut ended = 0;
        for id in ids {
            match self.maybe_end_if_idle(&id).await {
                Ok(true) => ended += 1,
                Ok(false) => {}
                Err(err) => warn!(session_id = %id, ?err, "idle sweep failed for session"),
            }
        }
        Ok(ended)
    }

    pub async fn maybe_end_if_idle(&self, session_id: &Id) -> EngineResult<bool> {
        let now = self.clock.now();
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(false);
        };
        if session.status == SessionStatus::Ended {
            return Ok(false);
        }
        if session.idle_seconds(now) >= IDLE_TIMEOUT_SEC {
            self.mutate(session_id, |s| {
                s.status = SessionStatus::Ended;
                s.ended_at = Some(now);
            })
            .await?;
            Ok(true)
        } else if session.idle_seconds(now) >= IDLE_TIMEOUT_SEC / 2 && session.status == SessionStatus::Active {
            self.mutate(session_id, |s| s.status = SessionStatus::Idle).await?;
            Ok(false)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    fn make_store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), Arc::new(FixedClock::new(1_000_000)))
    }

    fn info() -> NewSessionInfo {
        NewSessionInfo {
            visitor_id: "visitor-1".into(),
            site_url: "https://shop.example".into(),
            device_type: DeviceType::Desktop,
            referrer_type: ReferrerType::Direct,
            is_logged_in: false,
            is_repeat_visitor: false,
        }
    }

    #[tokio::test]
    async fn creates_then_reuses_session_for_same_visitor() {
        let store = make_store();
        let s1 = store.get_or_create_session(info()).await.unwrap();
        let s2 = store.get_or_create_session(info()).await.unwrap();
        assert_eq!(s1.id, s2.id);
    }

    #[tokio::test]
    async fn counter_mutations_are_monotonic() {
        let store = make_store();
        let session = store.get_or_create_session(info()).await.unwrap();
        store.increment_page_views(&session.id).await.unwrap();
        store.increment_page_views(&session.id).await.unwrap();
        let reloaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.page_views, 2);
    }

    #[tokio::test]
    async fn sweep_ends_idle_sessions() {
        let clock = Arc::new(FixedClock::new(1_000_000));
        let store = SessionStore::new(Arc::new(MemoryStore::new()), clock.clone());
        let session = store.get_or_create_session(info()).await.unwrap();
        clock.advance_ms(31 * 60 * 1000);
        let ended = store.sweep_idle().await.unwrap();
        assert_eq!(ended, 1);
        let reloaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn ends_session_on_explicit_request() {
        let store = make_store();
        let session = store.get_or_create_session(info()).await.unwrap();
        store.end_session(&session.id).await.unwrap();
        let reloaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Ended);
        assert!(reloaded.ended_at.is_some());
    }
}
