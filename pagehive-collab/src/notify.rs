//! User-scoped notifications pushed over the realtime connection.
//!
//! Notifications are stored by the REST layer; this module only shapes the
//! payload that [`crate::hub::HubHandle::notify_user`] delivers as
//! `notification:new` to every live connection of the recipient.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::IdentityId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: IdentityId,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    #[serde(default)]
    pub read: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Notification {
    pub fn new(
        user_id: IdentityId,
        kind: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        related_id: Option<String>,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            related_id,
            read: false,
            created_at,
        }
    }

    pub fn team_invitation(user_id: IdentityId, team_id: &str, team_name: &str) -> Self {
        Self::new(
            user_id,
            "invitation",
            "Team invitation",
            format!("You were invited to \"{team_name}\""),
            Some(team_id.to_string()),
        )
    }

    pub fn workspace_invitation(
        user_id: IdentityId,
        workspace_id: &str,
        workspace_name: &str,
    ) -> Self {
        Self::new(
            user_id,
            "workspace_invitation",
            "Workspace invitation",
            format!("You were invited to \"{workspace_name}\""),
            Some(workspace_id.to_string()),
        )
    }
}
