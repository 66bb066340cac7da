//! Event Ingestor & Normalizer (spec §4.2): turns a raw `track` frame into a
//! canonical `TrackEvent`, applies the session-level analytics side effects
//! (page views, entry/exit page, cart state), and hands the event to the
//! batcher. Grounded on the teacher's `signals/detector.rs` per-field
//! extraction/fallback style.

use crate::batcher::EventBatcher;
use crate::errors::EngineResult;
use crate::models::*;
use crate::session::{NewSessionInfo, SessionStore};
use crate::store::Store;
use crate::transport::{Channel, ChannelRegistry};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct TrackAck {
    pub session_id: Id,
    pub event_id: Id,
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    sessions: Arc<SessionStore>,
    batcher: Arc<EventBatcher>,
    registry: Arc<ChannelRegistry>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionStore>, batcher: Arc<EventBatcher>, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            store,
            sessions,
            batcher,
            registry,
        }
    }

    /// Normalizes and persists one `track` frame (spec §6.1). `frame` is the
    /// parsed JSON body; field lookups fall back from `page_context` to the
    /// frame root, and from camelCase to snake_case, before defaulting.
    pub async fn handle_track(&self, frame: &Value) -> EngineResult<TrackAck> {
        let visitor_id = text(frame, None, "visitorId", "visitor_id").unwrap_or_default();
        let site_url = text(frame, None, "siteUrl", "site_url").unwrap_or_default();

        let session = self
            .sessions
            .get_or_create_session(NewSessionInfo {
                visitor_id,
                site_url,
                device_type: device_type(frame),
                referrer_type: referrer_type(frame),
                is_logged_in: boolean(frame, "isLoggedIn", "is_logged_in"),
                is_repeat_visitor: boolean(frame, "isRepeatVisitor", "is_repeat_visitor"),
            })
            .await?;

        let page_context = frame.get("pageContext").or_else(|| frame.get("page_context"));

        let category = text(frame, page_context, "category", "category")
            .and_then(|s| parse_category(&s))
            .unwrap_or(EventCategory::Unknown);
        let event_type = text(frame, page_context, "eventType", "event_type").unwrap_or_else(|| "unknown".to_string());
        let friction_id = text(frame, page_context, "frictionId", "friction_id");
        let page_type = text(frame, page_context, "pageType", "page_type")
            .and_then(|s| parse_page_type(&s))
            .unwrap_or(PageType::Other);
        let page_url = text(frame, page_context, "pageUrl", "page_url").unwrap_or_default();
        let previous_page_url = text(frame, page_context, "previousPageUrl", "previous_page_url");
        let time_on_page_ms = number(frame, page_context, "timeOnPageMs", "time_on_page_ms").map(|n| n as i64);
        let scroll_depth_pct = number(frame, page_context, "scrollDepthPct", "scroll_depth_pct");
        let raw_signals = frame
            .get("rawSignals")
            .or_else(|| frame.get("raw_signals"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let event = TrackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            timestamp: chrono::Utc::now(),
            category,
            event_type,
            friction_id,
            page_type,
            page_url: page_url.clone(),
            raw_signals: raw_signals.to_string(),
            previous_page_url,
            time_on_page_ms,
            scroll_depth_pct,
            session_sequence_number: Some(session.page_views + 1),
        };
        self.store.put_event(&event).await?;

        self.apply_side_effects(&session.id, &event, &raw_signals).await?;

        self.registry.broadcast_to_channel(
            Channel::Dashboard,
            &serde_json::json!({
                "type": "track_event",
                "sessionId": session.id,
                "event": event,
            }),
        );

        self.batcher.add(&session.id, event.id.clone()).await;

        debug!(session_id = %session.id, event_id = %event.id, category = ?event.category, "event ingested");
        Ok(TrackAck {
            session_id: session.id,
            event_id: event.id,
        })
    }

    async fn apply_side_effects(&self, session_id: &Id, event: &TrackEvent, raw_signals: &Value) -> EngineResult<()> {
        if event.category == EventCategory::Navigation || matches!(event.event_type.as_str(), "page_view" | "pageview") {
            self.sessions.increment_page_views(session_id).await?;
            self.sessions
                .record_entry_page_if_unset(
                    session_id,
                    &event.page_url,
                    text(raw_signals, None, "utmSource", "utm_source"),
                    text(raw_signals, None, "utmMedium", "utm_medium"),
                    text(raw_signals, None, "utmCampaign", "utm_campaign"),
                )
                .await?;
            if let Some(time_on_page) = event.time_on_page_ms {
                self.sessions.record_exit_page(session_id, &event.page_url, time_on_page).await?;
            }
        }

        if event.category == EventCategory::Cart {
            if let (Some(value), Some(count)) = (
                number(raw_signals, None, "cartValue", "cart_value"),
                number(raw_signals, None, "itemCount", "item_count"),
            ) {
                self.sessions.update_cart(session_id, value, count as i64).await?;
            }
        }

        Ok(())
    }
}

fn lookup<'a>(root: &'a Value, page_context: Option<&'a Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    page_context
        .and_then(|ctx| ctx.get(camel).or_else(|| ctx.get(snake)))
        .or_else(|| root.get(camel))
        .or_else(|| root.get(snake))
}

fn text(root: &Value, page_context: Option<&Value>, camel: &str, snake: &str) -> Option<String> {
    lookup(root, page_context, camel, snake).and_then(|v| v.as_str()).map(str::to_string)
}

fn number(root: &Value, page_context: Option<&Value>, camel: &str, snake: &str) -> Option<f64> {
    lookup(root, page_context, camel, snake).and_then(|v| v.as_f64())
}

fn boolean(root: &Value, camel: &str, snake: &str) -> bool {
    lookup(root, None, camel, snake).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn device_type(root: &Value) -> DeviceType {
    match text(root, None, "deviceType", "device_type").as_deref() {
        Some("mobile") => DeviceType::Mobile,
        Some("tablet") => DeviceType::Tablet,
        _ => DeviceType::Desktop,
    }
}

fn referrer_type(root: &Value) -> ReferrerType {
    match text(root, None, "referrerType", "referrer_type").as_deref() {
        Some("organic") => ReferrerType::Organic,
        Some("paid") => ReferrerType::Paid,
        Some("social") => ReferrerType::Social,
        Some("email") => ReferrerType::Email,
        Some("referral") => ReferrerType::Referral,
        _ => ReferrerType::Direct,
    }
}

fn parse_category(s: &str) -> Option<EventCategory> {
    Some(match s {
        "navigation" => EventCategory::Navigation,
        "search" => EventCategory::Search,
        "product" => EventCategory::Product,
        "cart" => EventCategory::Cart,
        "checkout" => EventCategory::Checkout,
        "account" => EventCategory::Account,
        "engagement" => EventCategory::Engagement,
        "technical" => EventCategory::Technical,
        "system" => EventCategory::System,
        _ => EventCategory::Unknown,
    })
}

fn parse_page_type(s: &str) -> Option<PageType> {
    Some(match s {
        "landing" => PageType::Landing,
        "category" => PageType::Category,
        "search_results" | "searchResults" => PageType::SearchResults,
        "pdp" => PageType::Pdp,
        "cart" => PageType::Cart,
        "checkout" => PageType::Checkout,
        "account" => PageType::Account,
        _ => PageType::Other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{EventBatcher, FlushSink};
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct NoopSink;
    #[async_trait]
    impl FlushSink for NoopSink {
        async fn on_flush(&self, _session_id: Id, _event_ids: Vec<Id>) {}
    }

    fn ingestor() -> Ingestor {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionStore::new(store.clone(), Arc::new(FixedClock::new(1_000_000))));
        let batcher = Arc::new(EventBatcher::new(Arc::new(NoopSink), 60_000, 10));
        Ingestor::new(store, sessions, batcher, Arc::new(crate::transport::ChannelRegistry::new()))
    }

    #[tokio::test]
    async fn normalizes_camel_case_frame_and_persists_event() {
        let ingestor = ingestor();
        let frame = serde_json::json!({
            "visitorId": "v1",
            "siteUrl": "https://shop.example",
            "category": "checkout",
            "eventType": "page_view",
            "pageType": "checkout",
            "pageUrl": "/checkout",
        });
        let ack = ingestor.handle_track(&frame).await.unwrap();
        assert!(!ack.event_id.is_empty());
    }

    #[tokio::test]
    async fn broadcasts_track_event_to_dashboard_channel() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionStore::new(store.clone(), Arc::new(FixedClock::new(1_000_000))));
        let batcher = Arc::new(EventBatcher::new(Arc::new(NoopSink), 60_000, 10));
        let registry = Arc::new(crate::transport::ChannelRegistry::new());
        let (_id, mut rx) = registry.register(crate::transport::Channel::Dashboard, None);
        let ingestor = Ingestor::new(store, sessions, batcher, registry);

        let frame = serde_json::json!({
            "visitorId": "v1",
            "siteUrl": "https://shop.example",
            "category": "checkout",
            "eventType": "page_view",
            "pageType": "checkout",
            "pageUrl": "/checkout",
        });
        ingestor.handle_track(&frame).await.unwrap();

        let axum::extract::ws::Message::Text(text) = rx.try_recv().expect("dashboard should receive a broadcast") else {
            panic!("expected a text frame");
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "track_event");
    }

    #[tokio::test]
    async fn missing_fields_default_sensibly() {
        let ingestor = ingestor();
        let frame = serde_json::json!({ "visitorId": "v2", "siteUrl": "https://shop.example" });
        let ack = ingestor.handle_track(&frame).await.unwrap();
        assert!(!ack.session_id.is_empty());
    }

    #[tokio::test]
    async fn page_context_fields_take_priority_over_root() {
        let ingestor = ingestor();
        let frame = serde_json::json!({
            "visitorId": "v3",
            "siteUrl": "https://shop.example",
            "pageType": "landing",
            "pageContext": { "pageType": "checkout" },
        });
        let ack = ingestor.handle_track(&frame).await.unwrap();
        assert!(!ack.event_id.is_empty());
    }

    #[tokio::test]
    async fn cart_event_updates_session_cart_state() {
        let ingestor = ingestor();
        let frame = serde_json::json!({
            "visitorId": "v4",
            "siteUrl": "https://shop.example",
            "category": "cart",
            "eventType": "cart_update",
            "rawSignals": { "cartValue": 150.0, "itemCount": 2 },
        });
        let ack = ingestor.handle_track(&frame).await.unwrap();
        let session = ingestor.sessions.get(&ack.session_id).await.unwrap().unwrap();
        assert_eq!(session.cart_value, 150.0);
        assert_eq!(session.cart_item_count, 2);
    }
}
