use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Display snapshot taken from the user directory on first connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDisplay {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserDisplay {
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_string(),
            avatar: None,
        }
    }
}

/// Shared presence record. Exists only while `sessions` is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub display: Option<UserDisplay>,
    pub sessions: BTreeSet<Uuid>,
}

/// One element of a `loggedUsersUpdate` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
}

impl From<&PresenceEntry> for OnlineUser {
    fn from(entry: &PresenceEntry) -> Self {
        let display = entry.display.clone().unwrap_or_else(UserDisplay::unknown);
        Self {
            user_id: entry.user_id,
            name: display.name,
            avatar: display.avatar,
        }
    }
}
