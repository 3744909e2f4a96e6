//! The workflow-owner identity.
//!
//! Registration and login are handled by an external collaborator; the engine
//! only reads user rows to resolve ownership and notification targets.

use crate::id::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A workflow owner.
///
/// Deleting a user cascades to all owned credentials, workflows, runs and
/// processed-trigger rows; log entries keep a nullable backreference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: UserId,
    /// Notification address.
    pub email: String,
    /// Display name.
    pub display_name: String,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a new user record.
    #[must_use]
    pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            email: email.into(),
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }
}
