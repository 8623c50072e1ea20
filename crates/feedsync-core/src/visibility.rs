use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::VisibilityConfig;
use crate::subscriptions::SubscriptionEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityEvent {
    Enter(String),
    Leave(String),
}

impl VisibilityEvent {
    pub fn content_id(&self) -> &str {
        match self {
            VisibilityEvent::Enter(id) | VisibilityEvent::Leave(id) => id,
        }
    }
}

/// Turns raw intersection samples from the viewport into Enter/Leave edges.
///
/// Rows register with `observe`; the viewport collaborator reports the
/// intersection ratio it measured against the margin-expanded root. Only
/// state changes produce events, so repeated samples while scrolling are free.
pub struct VisibilityTracker {
    threshold: f32,
    root_margin_px: u32,
    /// content id -> currently inside the threshold
    observed: Mutex<HashMap<String, bool>>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl VisibilityTracker {
    pub fn new(config: &VisibilityConfig, events: mpsc::UnboundedSender<SubscriptionEvent>) -> Self {
        Self {
            threshold: config.threshold,
            root_margin_px: config.root_margin_px,
            observed: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Margin the viewport should expand its root by before measuring.
    pub fn root_margin_px(&self) -> u32 {
        self.root_margin_px
    }

    /// Start tracking a rendered row. Returns false if it was already tracked.
    pub fn observe(&self, content_id: &str) -> bool {
        let mut observed = self.observed.lock();
        if observed.contains_key(content_id) {
            return false;
        }
        observed.insert(content_id.to_string(), false);
        true
    }

    /// Stop tracking a row. A row that was inside reports a final Leave.
    pub fn unobserve(&self, content_id: &str) {
        let was_inside = self.observed.lock().remove(content_id).unwrap_or(false);
        if was_inside {
            self.emit(VisibilityEvent::Leave(content_id.to_string()));
        }
    }

    /// Stop tracking a row whose content left the feed. No Leave is emitted;
    /// the registry is told through `Remove` instead.
    pub fn forget(&self, content_id: &str) -> bool {
        self.observed.lock().remove(content_id).is_some()
    }

    /// Feed one intersection sample. Samples for unobserved rows are ignored.
    pub fn report(&self, content_id: &str, intersection_ratio: f32) {
        let inside = intersection_ratio > 0.0 && intersection_ratio >= self.threshold;
        let changed = {
            let mut observed = self.observed.lock();
            match observed.get_mut(content_id) {
                Some(state) if *state != inside => {
                    *state = inside;
                    true
                }
                _ => false,
            }
        };

        if changed {
            trace!(content_id, ratio = intersection_ratio, inside, "visibility edge");
            let event = if inside {
                VisibilityEvent::Enter(content_id.to_string())
            } else {
                VisibilityEvent::Leave(content_id.to_string())
            };
            self.emit(event);
        }
    }

    pub fn is_visible(&self, content_id: &str) -> bool {
        self.observed
            .lock()
            .get(content_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn visible_ids(&self) -> Vec<String> {
        self.observed
            .lock()
            .iter()
            .filter(|(_, inside)| **inside)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn emit(&self, event: VisibilityEvent) {
        // Receiver only goes away after unmount; nothing left to drive then
        let _ = self.events.send(SubscriptionEvent::Visibility(event));
    }
}
