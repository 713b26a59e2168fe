//! Messenger webhook payloads and request signing.
//!
//! Facebook delivers `{ "object": "page", "entry": [...] }` where every entry
//! carries the Page id and a `messaging` array of events. Only the fields the
//! inbox consumes are modelled; unknown fields are ignored.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::models::{Attachment, ContentType};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

impl WebhookPayload {
    pub fn is_page_event(&self) -> bool {
        self.object == "page"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    /// Facebook Page id the events belong to.
    pub id: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: Participant,
    pub recipient: Participant,
    #[serde(default)]
    pub timestamp: i64,
    pub message: Option<InboundMessage>,
    pub delivery: Option<DeliveryReceipt>,
    pub read: Option<ReadReceipt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub mid: String,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
    #[serde(default)]
    pub is_echo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentPayload {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub mids: Vec<String>,
    pub watermark: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadReceipt {
    pub watermark: i64,
}

/// Borrowed view of what a messaging event carries.
#[derive(Debug)]
pub enum EventKind<'a> {
    Message(&'a InboundMessage),
    Delivery(&'a DeliveryReceipt),
    Read(&'a ReadReceipt),
    Unsupported,
}

impl MessagingEvent {
    pub fn kind(&self) -> EventKind<'_> {
        if let Some(m) = &self.message {
            EventKind::Message(m)
        } else if let Some(d) = &self.delivery {
            EventKind::Delivery(d)
        } else if let Some(r) = &self.read {
            EventKind::Read(r)
        } else {
            EventKind::Unsupported
        }
    }
}

impl InboundMessage {
    pub fn content(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn stored_attachments(&self) -> Vec<Attachment> {
        self.attachments
            .iter()
            .map(|a| Attachment {
                kind: a.kind.clone(),
                url: a.payload.as_ref().and_then(|p| p.url.clone()),
            })
            .collect()
    }

    pub fn content_type(&self) -> ContentType {
        if self.attachments.is_empty() {
            ContentType::Text
        } else {
            ContentType::Attachment
        }
    }
}

/// Build the `x-hub-signature-256` header value for `body`.
pub fn sign_payload(app_secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC key of any length is valid"));
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check a `sha256=<hex>` signature against the raw request body.
pub fn verify_signature(app_secret: &str, body: &[u8], header_value: &str) -> bool {
    if app_secret.is_empty() {
        return false;
    }

    let Some(hex_sig) = header_value.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
