//! In-process publish/subscribe for pipeline notifications.
//!
//! Handlers are isolated from each other and from the publisher: an error
//! or a panic in one is logged and the remaining handlers still run.
//! Nothing is persisted or replayed.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

/// Published once per finished pipeline run; payload is the `PipelineResult`.
pub const ALERT_PROCESSED: &str = "alert_processed";

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(event_type.to_string()).or_default().push(handler);
        debug!(event_type, "handler subscribed");
    }

    /// Subscribe an async closure.
    pub async fn subscribe_fn<F, Fut>(&self, event_type: &str, f: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = FnHandler(move |event: Event| f(event).boxed());
        self.subscribe(event_type, Arc::new(handler)).await;
    }

    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Deliver `payload` to every handler of `event_type`, one after another.
    /// Returns how many handlers succeeded.
    pub async fn publish(&self, event_type: &str, payload: Value) -> usize {
        // Snapshot so handlers may subscribe without deadlocking.
        let handlers = match self.handlers.read().await.get(event_type) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let event = Event {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload,
            published_at: Utc::now(),
        };

        let mut delivered = 0;
        for handler in handlers {
            match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(event_type, event_id = %event.id, error = %e, "event handler failed");
                }
                Err(panic) => {
                    error!(
                        event_type,
                        event_id = %event.id,
                        panic = %panic_message(&panic),
                        "event handler panicked"
                    );
                }
            }
        }
        delivered
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    #[async_trait::async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("downstream notifier offline")
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            bus.subscribe_fn(ALERT_PROCESSED, move |event| {
                let seen = seen.clone();
                async move {
                    assert_eq!(event.payload["alert_id"], "a-1");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        }

        let delivered = bus.publish(ALERT_PROCESSED, json!({"alert_id": "a-1"})).await;
        assert_eq!(delivered, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_handlers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(ALERT_PROCESSED, Arc::new(Failing)).await;
        bus.subscribe(ALERT_PROCESSED, Arc::new(Panicking)).await;
        let counter = seen.clone();
        bus.subscribe_fn(ALERT_PROCESSED, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        let delivered = bus.publish(ALERT_PROCESSED, json!({})).await;
        assert_eq!(delivered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_subscribers_and_counts() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody_listens", json!({})).await, 0);
        assert_eq!(bus.subscriber_count(ALERT_PROCESSED).await, 0);

        bus.subscribe(ALERT_PROCESSED, Arc::new(Failing)).await;
        assert_eq!(bus.subscriber_count(ALERT_PROCESSED).await, 1);
        assert_eq!(bus.subscriber_count("other").await, 0);
    }
}
