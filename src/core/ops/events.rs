use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::store::OfficeStore;
use crate::core::store::types::{EventRecord, NewEvent};

/// Something that wants to see every event after it is stored.
#[async_trait]
pub trait Reactor: Send + Sync {
    async fn on_event(&self, event: &EventRecord) -> Result<()>;
}

/// Stores events and hands each one to the reactor. Reactor failures are
/// logged and never reach the emitter.
#[derive(Clone)]
pub struct EventBus {
    store: OfficeStore,
    reactor: Option<Arc<dyn Reactor>>,
}

impl EventBus {
    pub fn new(store: OfficeStore) -> Self {
        Self {
            store,
            reactor: None,
        }
    }

    pub fn with_reactor(mut self, reactor: Arc<dyn Reactor>) -> Self {
        self.reactor = Some(reactor);
        self
    }

    pub async fn emit(&self, event: NewEvent) -> Result<EventRecord> {
        let record = self.store.insert_event(&event).await?;
        debug!("[Events] {} by {}: {}", record.kind, record.agent_id, record.title);
        if let Some(reactor) = &self.reactor
            && let Err(e) = reactor.on_event(&record).await
        {
            warn!("[Events] Reactor failed on {} ({}): {}", record.kind, record.id, e);
        }
        Ok(record)
    }

    /// Emit without letting a store failure escape. Used where the event is a
    /// side note to work that has already been committed.
    pub async fn emit_quiet(&self, event: NewEvent) -> Option<EventRecord> {
        let kind = event.kind.clone();
        match self.emit(event).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("[Events] Failed to record {}: {}", kind, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{minutes_ago, test_store};
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Reactor for Recorder {
        async fn on_event(&self, event: &EventRecord) -> Result<()> {
            self.seen.lock().unwrap().push(event.kind.clone());
            if self.fail {
                anyhow::bail!("reactor down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn reactor_sees_stored_events_and_its_errors_are_swallowed() {
        let store = test_store().await;
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let bus = EventBus::new(store.clone()).with_reactor(recorder.clone());

        let record = bus
            .emit(NewEvent::new("mux", "agent_log", "filed the report"))
            .await
            .unwrap();
        assert_eq!(record.kind, "agent_log");
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["agent_log"]);
        assert_eq!(
            store.count_events_since("agent_log", &minutes_ago(1)).await.unwrap(),
            1
        );
    }
}
