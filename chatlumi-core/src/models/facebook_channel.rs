use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Binding between a Facebook Page and an inbox. Tokens never leave the server.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FacebookChannel {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub inbox_id: Uuid,
    pub page_id: String,
    #[serde(skip_serializing)]
    pub page_access_token: String,
    #[serde(skip_serializing)]
    pub user_access_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
