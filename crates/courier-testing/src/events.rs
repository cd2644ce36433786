//! Event capture for assertions.

use courier_core::{DeliveryEvent, EventHandler};
use tokio::sync::Mutex;

/// Event handler that keeps every published event in order.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().await.clone()
    }

    /// Event kinds in publication order.
    pub async fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(DeliveryEvent::kind).collect()
    }

    /// Number of events of the given kind.
    pub async fn count(&self, kind: &str) -> usize {
        self.events.lock().await.iter().filter(|e| e.kind() == kind).count()
    }

    /// Forgets everything recorded so far.
    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
    }
}
