//! Event bus (C9): publishes structured events to subscribers — the
//! operator console, a websocket broadcaster, an optional webhook pusher.
//!
//! Built on a [`tokio::sync::broadcast`] channel the way the control
//! service's session events are wired: many subscribers, a bounded
//! ring buffer, lagging subscribers drop old events rather than block
//! the publisher.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Checkin,
    Task,
    Result,
}

#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub kind: EventKind,
    pub message: String,
    /// Whether the operator console should print this event.
    pub print: bool,
    /// `"agents/<session_id>"`, or `"empire"` for process-wide events.
    pub sender: String,
    pub response_name: Option<u16>,
    pub task_id: Option<u16>,
    pub task_name: Option<u16>,
    pub task: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn checkin(session_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Checkin,
            message: message.into(),
            print: true,
            sender: format!("agents/{session_id}"),
            response_name: None,
            task_id: None,
            task_name: None,
            task: None,
            timestamp: Utc::now(),
        }
    }

    pub fn task(session_id: &str, task_id: u16, task_name: u16, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Task,
            message: message.into(),
            print: true,
            sender: format!("agents/{session_id}"),
            response_name: None,
            task_id: Some(task_id),
            task_name: Some(task_name),
            task: None,
            timestamp: Utc::now(),
        }
    }

    pub fn result(
        session_id: &str,
        response_name: u16,
        task_id: u16,
        message: impl Into<String>,
        print: bool,
    ) -> Self {
        Self {
            kind: EventKind::Result,
            message: message.into(),
            print,
            sender: format!("agents/{session_id}"),
            response_name: Some(response_name),
            task_id: Some(task_id),
            task_name: None,
            task: None,
            timestamp: Utc::now(),
        }
    }

    pub fn global(message: impl Into<String>, print: bool) -> Self {
        Self {
            kind: EventKind::Checkin,
            message: message.into(),
            print,
            sender: "empire".to_string(),
            response_name: None,
            task_id: None,
            task_name: None,
            task: None,
            timestamp: Utc::now(),
        }
    }
}

/// Publish side of the event bus. The core depends on this trait, not on
/// the concrete [`EventBus`], so tests can substitute a simple collector.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: AgentEvent);
}

pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: AgentEvent) {
        // A send error just means there are currently no subscribers —
        // not a failure the publisher should care about.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(AgentEvent::checkin("SESSION1", "agent checked in"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.sender, "agents/SESSION1");
        assert!(event.print);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(AgentEvent::global("no one is listening", false));
    }
}
