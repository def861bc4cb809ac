//! Fan-out of pipeline notifications to subscribers
//!
//! Each subscriber owns an unbounded channel, so a slow consumer never
//! causes another to miss a notification. Subscribers whose receiving half
//! was dropped are pruned on the next publish.

use crate::types::{AuditEvent, GovernanceAnnotation, ProcessedEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A notification emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notification {
    /// The coordinator finished initializing
    Initialized,

    /// An event made it through the pipeline
    AuditEvent(ProcessedEvent),

    /// Governance classification was applied to an event
    GovernanceEvent {
        annotation: GovernanceAnnotation,
        event: AuditEvent,
    },

    /// A high-risk event was processed
    HighRiskEvent(ProcessedEvent),

    /// An event failed somewhere in the pipeline
    #[serde(rename_all = "camelCase")]
    IntegrationError {
        stage: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// The coordinator has shut down
    Shutdown,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Initialized => NotificationKind::Initialized,
            Notification::AuditEvent(_) => NotificationKind::AuditEvent,
            Notification::GovernanceEvent { .. } => NotificationKind::GovernanceEvent,
            Notification::HighRiskEvent(_) => NotificationKind::HighRiskEvent,
            Notification::IntegrationError { .. } => NotificationKind::IntegrationError,
            Notification::Shutdown => NotificationKind::Shutdown,
        }
    }
}

/// Discriminant of [`Notification`], used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Initialized,
    AuditEvent,
    GovernanceEvent,
    HighRiskEvent,
    IntegrationError,
    Shutdown,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Initialized => "initialized",
            NotificationKind::AuditEvent => "audit-event",
            NotificationKind::GovernanceEvent => "governance-event",
            NotificationKind::HighRiskEvent => "high-risk-event",
            NotificationKind::IntegrationError => "integration-error",
            NotificationKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Predicate = Box<dyn Fn(&Notification) -> bool + Send + Sync>;

struct Subscriber {
    tx: mpsc::UnboundedSender<Notification>,
    predicate: Option<Predicate>,
}

/// Receiving half of a subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Next notification; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.rx.try_recv() {
            out.push(n);
        }
        out
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Notification> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Broadcast point for coordinator notifications
#[derive(Default)]
pub struct NotificationHub {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every notification
    pub fn subscribe(&self) -> Subscription {
        self.add(None)
    }

    /// Subscribe to the listed kinds only
    pub fn subscribe_kinds(&self, kinds: &[NotificationKind]) -> Subscription {
        let kinds = kinds.to_vec();
        self.add(Some(Box::new(move |n: &Notification| kinds.contains(&n.kind()))))
    }

    /// Subscribe with an arbitrary filter
    pub fn subscribe_filtered<F>(&self, predicate: F) -> Subscription
    where
        F: Fn(&Notification) -> bool + Send + Sync + 'static,
    {
        self.add(Some(Box::new(predicate)))
    }

    /// Deliver to every matching live subscriber
    pub fn publish(&self, notification: Notification) {
        let mut stale = false;
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for sub in subscribers.iter() {
                if sub.tx.is_closed() {
                    stale = true;
                    continue;
                }
                if let Some(ref predicate) = sub.predicate {
                    if !predicate(&notification) {
                        continue;
                    }
                }
                if sub.tx.send(notification.clone()).is_err() {
                    stale = true;
                }
            }
        }

        if stale {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| !s.tx.is_closed());
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    fn add(&self, predicate: Option<Predicate>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { tx, predicate });
        Subscription { rx }
    }
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
