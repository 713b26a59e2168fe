//! Webhook subsystem — turns Messenger deliveries into inbox records
//!
//! For every entry the Page id selects the Facebook channel (and so the
//! workspace and inbox). Each inbound message then runs:
//! 1. contact upsert (profile fetched from Graph on first contact)
//! 2. unresolved-conversation lookup, or a new OPEN conversation
//! 3. message insert + `last_message_at` touch
//!
//! Entries for unknown Pages are skipped; a failing event is logged and the
//! rest of the batch continues.

use axum::http::StatusCode;
use chatlumi_core::config::FacebookConfig;
use chatlumi_core::facebook::GraphClient;
use chatlumi_core::models::contact::fallback_contact_name;
use chatlumi_core::models::{
    Contact, Conversation, ConversationStatus, FacebookChannel, Message, SenderType,
};
use chatlumi_core::webhook::{
    verify_signature, EventKind, InboundMessage, MessagingEvent, WebhookPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::http::ApiResponse;

/// Per-request tally, logged once the batch is done.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookReport {
    pub entries: usize,
    pub unknown_pages: usize,
    pub messages_stored: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub receipts: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Stored {
        contact_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        new_conversation: bool,
    },
    /// Same `mid` already stored in this inbox (Facebook redelivery).
    Duplicate,
    /// Echo of a message the Page itself sent.
    Ignored,
}

// ============================================================================
// Channel / contact / conversation lookups
// ============================================================================

pub async fn find_channel_by_page(
    pool: &PgPool,
    page_id: &str,
) -> Result<Option<FacebookChannel>, sqlx::Error> {
    sqlx::query_as::<_, FacebookChannel>("SELECT * FROM facebook_channels WHERE page_id = $1")
        .bind(page_id)
        .fetch_optional(pool)
        .await
}

pub async fn find_contact(
    pool: &PgPool,
    workspace_id: Uuid,
    identifier: &str,
) -> Result<Option<Contact>, sqlx::Error> {
    sqlx::query_as::<_, Contact>(
        "SELECT * FROM contacts WHERE workspace_id = $1 AND identifier = $2",
    )
    .bind(workspace_id)
    .bind(identifier)
    .fetch_optional(pool)
    .await
}

/// Find the contact for a sender, creating it from the Graph profile when new.
pub async fn resolve_contact(
    pool: &PgPool,
    graph: &GraphClient,
    channel: &FacebookChannel,
    sender_id: &str,
) -> Result<Contact, sqlx::Error> {
    if let Some(contact) = find_contact(pool, channel.workspace_id, sender_id).await? {
        return Ok(contact);
    }

    let (name, avatar_url, additional_info) = match graph
        .fetch_user_profile(sender_id, &channel.page_access_token)
        .await
    {
        Ok(profile) => (
            profile
                .name
                .clone()
                .unwrap_or_else(|| fallback_contact_name(sender_id)),
            profile.profile_pic.clone(),
            Some(json!({ "facebookData": profile.raw })),
        ),
        Err(e) => {
            tracing::warn!(sender = %sender_id, "Profile lookup failed, using fallback name: {}", e);
            (fallback_contact_name(sender_id), None, None)
        }
    };

    // Concurrent first messages from one sender converge on the same row
    sqlx::query_as::<_, Contact>(
        r#"
        INSERT INTO contacts (id, workspace_id, identifier, name, avatar_url, additional_info)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (workspace_id, identifier)
        DO UPDATE SET updated_at = contacts.updated_at
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(channel.workspace_id)
    .bind(sender_id)
    .bind(&name)
    .bind(&avatar_url)
    .bind(&additional_info)
    .fetch_one(pool)
    .await
}

pub async fn find_unresolved_conversation(
    pool: &PgPool,
    workspace_id: Uuid,
    inbox_id: Uuid,
    contact_id: Uuid,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(
        r#"
        SELECT * FROM conversations
        WHERE workspace_id = $1 AND inbox_id = $2 AND contact_id = $3
          AND status <> 'RESOLVED'
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(workspace_id)
    .bind(inbox_id)
    .bind(contact_id)
    .fetch_optional(pool)
    .await
}

/// Returns the unresolved conversation and whether it was created now.
pub async fn resolve_conversation(
    pool: &PgPool,
    channel: &FacebookChannel,
    contact_id: Uuid,
) -> Result<(Conversation, bool), sqlx::Error> {
    if let Some(c) =
        find_unresolved_conversation(pool, channel.workspace_id, channel.inbox_id, contact_id)
            .await?
    {
        return Ok((c, false));
    }

    let created = sqlx::query_as::<_, Conversation>(
        r#"
        INSERT INTO conversations (id, workspace_id, inbox_id, contact_id, status)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (workspace_id, inbox_id, contact_id) WHERE status <> 'RESOLVED'
        DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(channel.workspace_id)
    .bind(channel.inbox_id)
    .bind(contact_id)
    .bind(ConversationStatus::Open)
    .fetch_optional(pool)
    .await?;

    if let Some(c) = created {
        return Ok((c, true));
    }

    // Lost the race to a concurrent delivery; its row is now visible
    find_unresolved_conversation(pool, channel.workspace_id, channel.inbox_id, contact_id)
        .await?
        .map(|c| (c, false))
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn is_duplicate_delivery(
    pool: &PgPool,
    inbox_id: Uuid,
    source_id: &str,
) -> Result<bool, sqlx::Error> {
    let row: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.inbox_id = $1 AND m.source_id = $2
        )
        "#,
    )
    .bind(inbox_id)
    .bind(source_id)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

// ============================================================================
// Event processing
// ============================================================================

pub async fn process_message_event(
    pool: &PgPool,
    graph: &GraphClient,
    channel: &FacebookChannel,
    event: &MessagingEvent,
    message: &InboundMessage,
) -> anyhow::Result<MessageOutcome> {
    let sender_id = event.sender.id.as_str();

    if message.is_echo || sender_id == channel.page_id {
        return Ok(MessageOutcome::Ignored);
    }

    if is_duplicate_delivery(pool, channel.inbox_id, &message.mid).await? {
        tracing::debug!(mid = %message.mid, "Duplicate delivery skipped");
        return Ok(MessageOutcome::Duplicate);
    }

    let contact = resolve_contact(pool, graph, channel, sender_id).await?;
    let (conversation, new_conversation) = resolve_conversation(pool, channel, contact.id).await?;

    let attachments = message.stored_attachments();
    let attachments_json = if attachments.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&attachments)?)
    };

    let mut tx = pool.begin().await?;

    let stored = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages
            (id, conversation_id, content, content_type, sender_type, attachments, source_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(conversation.id)
    .bind(message.content())
    .bind(message.content_type())
    .bind(SenderType::Contact)
    .bind(&attachments_json)
    .bind(&message.mid)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE conversations SET last_message_at = now(), updated_at = now() WHERE id = $1")
        .bind(conversation.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(
        conversation_id = %conversation.id,
        message_id = %stored.id,
        new_conversation,
        "Inbound Messenger message stored"
    );

    Ok(MessageOutcome::Stored {
        contact_id: contact.id,
        conversation_id: conversation.id,
        message_id: stored.id,
        new_conversation,
    })
}

/// Walk every entry and event of a delivery.
///
/// Only the channel lookup can fail the whole batch; per-event errors are
/// counted in `failures`.
pub async fn process_payload(
    pool: &PgPool,
    graph: &GraphClient,
    payload: &WebhookPayload,
) -> Result<WebhookReport, sqlx::Error> {
    let mut report = WebhookReport::default();

    for entry in &payload.entry {
        report.entries += 1;

        let channel = match find_channel_by_page(pool, &entry.id).await? {
            Some(c) => c,
            None => {
                tracing::info!(page_id = %entry.id, "No Facebook channel for page, skipping entry");
                report.unknown_pages += 1;
                continue;
            }
        };

        for event in &entry.messaging {
            match event.kind() {
                EventKind::Message(message) => {
                    match process_message_event(pool, graph, &channel, event, message).await {
                        Ok(MessageOutcome::Stored { .. }) => report.messages_stored += 1,
                        Ok(MessageOutcome::Duplicate) => report.duplicates += 1,
                        Ok(MessageOutcome::Ignored) => report.ignored += 1,
                        Err(e) => {
                            tracing::error!(mid = %message.mid, "Failed to process message: {:#}", e);
                            report.failures += 1;
                        }
                    }
                }
                EventKind::Delivery(d) => {
                    tracing::debug!(page_id = %entry.id, mids = d.mids.len(), watermark = d.watermark, "Delivery receipt");
                    report.receipts += 1;
                }
                EventKind::Read(r) => {
                    tracing::debug!(page_id = %entry.id, watermark = r.watermark, "Read receipt");
                    report.receipts += 1;
                }
                EventKind::Unsupported => report.ignored += 1,
            }
        }
    }

    Ok(report)
}

// ============================================================================
// Inner (directly testable) HTTP functions
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Subscription handshake: echo the challenge when mode and token match.
pub fn verify_inner(config: &FacebookConfig, query: VerifyQuery) -> (StatusCode, String) {
    let token_ok = !config.webhook_verify_token.is_empty()
        && query.verify_token.as_deref() == Some(config.webhook_verify_token.as_str());

    if query.mode.as_deref() == Some("subscribe") && token_ok {
        tracing::info!("Webhook verified");
        return (StatusCode::OK, query.challenge.unwrap_or_default());
    }

    tracing::warn!("Webhook verification failed");
    (StatusCode::FORBIDDEN, "Verification failed".to_string())
}

fn webhook_error(status: StatusCode, msg: &str) -> ApiResponse {
    (status, json!({ "error": msg }))
}

pub async fn receive_inner(
    pool: &PgPool,
    graph: &GraphClient,
    config: &FacebookConfig,
    signature: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    let Some(signature) = signature else {
        tracing::warn!("Webhook delivery without signature header");
        return webhook_error(StatusCode::UNAUTHORIZED, "Invalid signature");
    };

    if config.verify_signatures && !verify_signature(&config.app_secret, body, signature) {
        tracing::warn!("Webhook signature mismatch");
        return webhook_error(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let payload: WebhookPayload = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Unparseable webhook body: {}", e);
            return webhook_error(StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    if !payload.is_page_event() {
        return webhook_error(StatusCode::BAD_REQUEST, "Invalid event object");
    }

    match process_payload(pool, graph, &payload).await {
        Ok(report) => {
            tracing::info!(?report, "Webhook delivery processed");
            (StatusCode::OK, json!({ "status": "ok" }))
        }
        Err(e) => {
            tracing::error!("Webhook processing failed: {}", e);
            webhook_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
