use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Provider-specific sender id (Messenger PSID).
    pub identifier: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub additional_info: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Display name used when the sender profile cannot be fetched.
pub fn fallback_contact_name(identifier: &str) -> String {
    let prefix: String = identifier.chars().take(8).collect();
    format!("Facebook User ({})", prefix)
}
