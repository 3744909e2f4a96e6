//! Outbound user notification contract.
//!
//! The email channel itself is an external collaborator; the engine only
//! emits one-line notices when a credential needs the user's attention
//! (refresh failure, never-connected app used by an action).

use async_trait::async_trait;
use patchbay_core::{AppName, UserId};
use std::sync::{Arc, Mutex};

/// Sends a short notice to a user about a credential problem.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `message` to the user. Delivery failures are the
    /// implementation's concern; callers treat this as best-effort.
    async fn notify(&self, user_id: UserId, app: AppName, message: &str);
}

/// Notifier that only logs.
///
/// Used when no email collaborator is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user_id: UserId, app: AppName, message: &str) {
        tracing::warn!(%user_id, %app, message, "user notification");
    }
}

/// Notifier that records messages for assertions.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    messages: Arc<Mutex<Vec<(UserId, AppName, String)>>>,
}

impl InMemoryNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded notifications.
    #[must_use]
    pub fn messages(&self) -> Vec<(UserId, AppName, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, user_id: UserId, app: AppName, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((user_id, app, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_notifier_records() {
        let notifier = InMemoryNotifier::new();
        let user = UserId::new();

        notifier.notify(user, AppName::Gmail, "please reconnect").await;

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, user);
        assert_eq!(messages[0].2, "please reconnect");
    }
}
