use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::models::NotificationIntent;
use crate::source::NotificationSink;

/// Fire-and-forget delivery of notification intents.
///
/// Each intent runs as a detached task. Nothing about its outcome flows back
/// to the mutation that produced it: a failed or slow delivery is logged and
/// dropped, and the mutation has already been reported as successful.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub fn dispatch(&self, intent: NotificationIntent) {
        let sink = self.sink.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let recipient = intent.recipient_id.clone();
            let content_id = intent.content_id.clone();
            match tokio::time::timeout(timeout, sink.notify(intent)).await {
                Ok(Ok(())) => debug!(recipient = %recipient, content_id = %content_id, "notification sent"),
                Ok(Err(e)) => warn!(
                    recipient = %recipient,
                    content_id = %content_id,
                    error = %e,
                    "notification failed"
                ),
                Err(_) => warn!(
                    recipient = %recipient,
                    content_id = %content_id,
                    "notification timed out"
                ),
            }
        });
    }

    pub fn dispatch_all(&self, intents: impl IntoIterator<Item = NotificationIntent>) {
        for intent in intents {
            self.dispatch(intent);
        }
    }
}
