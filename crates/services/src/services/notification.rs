//! Notification-channel boundary.
//!
//! The core only knows "send or edit a status message"; delivery is the
//! embedding application's problem. Every call site is fire-and-forget:
//! delivery failure is logged and otherwise ignored, because a session must
//! never fail over a status ping.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An action button attached to a status message, keyed so the channel can
/// route a click back to the session/record it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyAction {
    pub id: String,
    pub label: String,
}

impl NotifyAction {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a new status message, or edit the previous one in place when a
    /// prior message id is supplied. Returns the message id to use for the
    /// next edit.
    async fn send_or_update(
        &self,
        session_id: &str,
        previous_message_id: Option<&str>,
        text: &str,
        actions: &[NotifyAction],
    ) -> anyhow::Result<String>;
}

/// Swallows every notification. The default when no channel is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_or_update(
        &self,
        _session_id: &str,
        previous_message_id: Option<&str>,
        _text: &str,
        _actions: &[NotifyAction],
    ) -> anyhow::Result<String> {
        Ok(previous_message_id.unwrap_or_default().to_string())
    }
}
