//! Conversations subsystem — agent-facing reads and writes on threads
//!
//! Every operation first resolves the conversation through the caller's
//! workspace memberships; a conversation in a workspace the caller does not
//! belong to is reported as not found.

use axum::http::StatusCode;
use chatlumi_core::facebook::GraphClient;
use chatlumi_core::models::{
    Contact, ContentType, Conversation, ConversationStatus, Message, SenderType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::http::{internal_error, message_body, ApiResponse};
use crate::subsystems::workspaces::find_membership;

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ListConversationsQuery {
    pub status: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateStatusRequest {
    /// Kept as raw JSON so a non-string status is a 400, not an extractor rejection.
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactBrief {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub status: ConversationStatus,
    pub contact: ContactBrief,
    pub last_message: Option<LastMessage>,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    status: ConversationStatus,
    last_message_at: DateTime<Utc>,
    contact_id: Uuid,
    contact_name: String,
    contact_avatar_url: Option<String>,
    last_content: Option<String>,
    last_created_at: Option<DateTime<Utc>>,
    unread_count: i64,
}

impl From<SummaryRow> for ConversationSummary {
    fn from(row: SummaryRow) -> Self {
        let last_message = match (row.last_content, row.last_created_at) {
            (Some(content), Some(created_at)) => Some(LastMessage {
                content,
                created_at,
            }),
            _ => None,
        };

        Self {
            id: row.id,
            status: row.status,
            contact: ContactBrief {
                id: row.contact_id,
                name: row.contact_name,
                avatar_url: row.contact_avatar_url,
            },
            last_message,
            last_message_at: row.last_message_at,
            unread_count: row.unread_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub content: String,
    pub content_type: ContentType,
    pub sender_type: SenderType,
    pub attachments: Option<serde_json::Value>,
    pub private: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageView {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            content: m.content,
            content_type: m.content_type,
            sender_type: m.sender_type,
            attachments: m.attachments,
            private: m.private,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    pub id: Uuid,
    pub status: ConversationStatus,
    pub contact: ContactBrief,
    pub messages: Vec<MessageView>,
}

// ============================================================================
// Queries
// ============================================================================

/// Escape `%`, `_` and `\` so user input matches literally inside ILIKE.
pub fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Conversation summaries for a workspace, newest activity first.
///
/// `unread_count` counts contact messages after the latest agent reply.
pub async fn list_summaries(
    pool: &PgPool,
    workspace_id: Uuid,
    status: Option<ConversationStatus>,
    search: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<ConversationSummary>, sqlx::Error> {
    let pattern = search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", escape_like(s)));

    let rows = sqlx::query_as::<_, SummaryRow>(
        r#"
        SELECT c.id, c.status, c.last_message_at,
               ct.id AS contact_id, ct.name AS contact_name, ct.avatar_url AS contact_avatar_url,
               lm.content AS last_content, lm.created_at AS last_created_at,
               (
                   SELECT COUNT(*) FROM messages mu
                   WHERE mu.conversation_id = c.id
                     AND mu.sender_type = 'CONTACT'
                     AND mu.created_at > COALESCE(
                         (SELECT MAX(ma.created_at) FROM messages ma
                          WHERE ma.conversation_id = c.id AND ma.sender_type = 'USER'),
                         '-infinity'::timestamptz)
               ) AS unread_count
        FROM conversations c
        JOIN contacts ct ON ct.id = c.contact_id
        LEFT JOIN LATERAL (
            SELECT m.content, m.created_at FROM messages m
            WHERE m.conversation_id = c.id
            ORDER BY m.created_at DESC
            LIMIT 1
        ) lm ON TRUE
        WHERE c.workspace_id = $1
          AND ($2::conversation_status IS NULL OR c.status = $2)
          AND ($3::text IS NULL
               OR ct.name ILIKE $3
               OR EXISTS (SELECT 1 FROM messages ms
                          WHERE ms.conversation_id = c.id AND ms.content ILIKE $3))
        ORDER BY c.last_message_at DESC
        LIMIT $4
        "#,
    )
    .bind(workspace_id)
    .bind(status)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(ConversationSummary::from).collect())
}

/// The conversation, if the user is a member of its workspace.
pub async fn find_accessible_conversation(
    pool: &PgPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(
        r#"
        SELECT c.*
        FROM conversations c
        JOIN workspace_users wu ON wu.workspace_id = c.workspace_id AND wu.user_id = $2
        WHERE c.id = $1
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_messages(pool: &PgPool, conversation_id: Uuid) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
}

async fn load_contact(pool: &PgPool, contact_id: Uuid) -> Result<Contact, sqlx::Error> {
    sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = $1")
        .bind(contact_id)
        .fetch_one(pool)
        .await
}

/// Contact identifier and page token needed to deliver a reply, if the inbox is Facebook-bound.
async fn delivery_target(
    pool: &PgPool,
    conversation_id: Uuid,
) -> Result<Option<(String, String)>, sqlx::Error> {
    sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT ct.identifier, fc.page_access_token
        FROM conversations c
        JOIN contacts ct ON ct.id = c.contact_id
        JOIN facebook_channels fc ON fc.inbox_id = c.inbox_id
        WHERE c.id = $1
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
}

fn parse_content_type(raw: Option<&str>) -> Option<ContentType> {
    match raw {
        None => Some(ContentType::Text),
        Some(s) => serde_json::from_value(serde_json::Value::String(s.to_string())).ok(),
    }
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn list_conversations_inner(
    pool: &PgPool,
    user_id: Uuid,
    workspace_id: Uuid,
    query: ListConversationsQuery,
) -> ApiResponse {
    let status = match query.status.as_deref().unwrap_or("OPEN").parse::<ConversationStatus>() {
        Ok(s) => s,
        Err(_) => return message_body(StatusCode::BAD_REQUEST, "Invalid status"),
    };

    match find_membership(pool, workspace_id, user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return message_body(StatusCode::NOT_FOUND, "Workspace not found"),
        Err(e) => return internal_error("Failed to check workspace access", e),
    }

    match list_summaries(pool, workspace_id, Some(status), query.search.as_deref(), None).await {
        Ok(items) => (StatusCode::OK, json!(items)),
        Err(e) => internal_error("Failed to list conversations", e),
    }
}

pub async fn get_conversation_inner(
    pool: &PgPool,
    user_id: Uuid,
    conversation_id: Uuid,
) -> ApiResponse {
    let conversation = match find_accessible_conversation(pool, conversation_id, user_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return message_body(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => return internal_error("Failed to load conversation", e),
    };

    let contact = match load_contact(pool, conversation.contact_id).await {
        Ok(c) => c,
        Err(e) => return internal_error("Failed to load contact", e),
    };

    let messages = match list_messages(pool, conversation.id).await {
        Ok(m) => m,
        Err(e) => return internal_error("Failed to load messages", e),
    };

    let detail = ConversationDetail {
        id: conversation.id,
        status: conversation.status,
        contact: ContactBrief {
            id: contact.id,
            name: contact.name,
            avatar_url: contact.avatar_url,
        },
        messages: messages.into_iter().map(MessageView::from).collect(),
    };

    (StatusCode::OK, json!(detail))
}

pub async fn update_status_inner(
    pool: &PgPool,
    user_id: Uuid,
    conversation_id: Uuid,
    req: UpdateStatusRequest,
) -> ApiResponse {
    // Validated before any lookup
    let status = match req
        .status
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .map(str::parse::<ConversationStatus>)
    {
        Some(Ok(s)) => s,
        _ => return message_body(StatusCode::BAD_REQUEST, "Invalid status"),
    };

    match find_accessible_conversation(pool, conversation_id, user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return message_body(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => return internal_error("Failed to load conversation", e),
    }

    match apply_status(pool, conversation_id, status).await {
        Ok(updated) => {
            tracing::info!(conversation_id = %conversation_id, status = %status, "Conversation status changed");
            (StatusCode::OK, json!(updated))
        }
        Err(e) if chatlumi_core::db::is_unique_violation(&e) => message_body(
            StatusCode::CONFLICT,
            "Another conversation with this contact is already open",
        ),
        Err(e) => internal_error("Failed to update conversation", e),
    }
}

/// Set the status and record a private system note, atomically.
pub async fn apply_status(
    pool: &PgPool,
    conversation_id: Uuid,
    status: ConversationStatus,
) -> Result<Conversation, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query_as::<_, Conversation>(
        "UPDATE conversations SET status = $2, updated_at = now() WHERE id = $1 RETURNING *",
    )
    .bind(conversation_id)
    .bind(status)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, content, sender_type, private)
        VALUES ($1, $2, $3, $4, TRUE)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(conversation_id)
    .bind(format!("Conversation marked as {}", status.label()))
    .bind(SenderType::System)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(updated)
}

pub async fn send_message_inner(
    pool: &PgPool,
    graph: &GraphClient,
    user_id: Uuid,
    conversation_id: Uuid,
    req: SendMessageRequest,
) -> ApiResponse {
    let content = req.content.unwrap_or_default();
    if content.trim().is_empty() {
        return message_body(StatusCode::BAD_REQUEST, "Message content cannot be empty");
    }

    let Some(content_type) = parse_content_type(req.content_type.as_deref()) else {
        return message_body(StatusCode::BAD_REQUEST, "Invalid content type");
    };

    let conversation = match find_accessible_conversation(pool, conversation_id, user_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return message_body(StatusCode::NOT_FOUND, "Conversation not found"),
        Err(e) => return internal_error("Failed to load conversation", e),
    };

    if conversation.status == ConversationStatus::Resolved {
        return message_body(
            StatusCode::BAD_REQUEST,
            "Cannot send messages in a resolved conversation",
        );
    }

    let mut message = match store_agent_message(pool, conversation.id, user_id, &content, content_type).await {
        Ok(m) => m,
        Err(e) => return internal_error("Failed to store message", e),
    };

    match deliver_to_facebook(pool, graph, &message).await {
        Ok(Some(source_id)) => message.source_id = Some(source_id),
        Ok(None) => {}
        // The reply stays stored; agents are not shown delivery failures
        Err(e) => tracing::error!(message_id = %message.id, "Facebook delivery failed: {:#}", e),
    }

    (StatusCode::OK, json!(message))
}

pub async fn store_agent_message(
    pool: &PgPool,
    conversation_id: Uuid,
    user_id: Uuid,
    content: &str,
    content_type: ContentType,
) -> Result<Message, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let message = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (id, conversation_id, content, content_type, sender_type, sender_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(conversation_id)
    .bind(content)
    .bind(content_type)
    .bind(SenderType::User)
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE conversations SET last_message_at = now(), updated_at = now() WHERE id = $1")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(message)
}

/// Send the reply through the Send API when the inbox is bound to a Page.
///
/// Returns the Facebook message id, recorded as the message `source_id`.
pub async fn deliver_to_facebook(
    pool: &PgPool,
    graph: &GraphClient,
    message: &Message,
) -> anyhow::Result<Option<String>> {
    let Some((recipient_id, page_token)) = delivery_target(pool, message.conversation_id).await?
    else {
        return Ok(None);
    };

    let sent = graph
        .send_text_message(&page_token, &recipient_id, &message.content)
        .await?;

    let Some(mid) = sent.message_id else {
        return Ok(None);
    };

    sqlx::query("UPDATE messages SET source_id = $2 WHERE id = $1")
        .bind(message.id)
        .bind(&mid)
        .execute(pool)
        .await?;

    Ok(Some(mid))
}
