//! Facebook Graph API client
//!
//! Covers the handful of calls the inbox makes:
//! - OAuth dialog URL + code exchange for a user access token
//! - Page listing (`/me/accounts`) for the page-selection step
//! - Sender profile lookup for new contacts
//! - Text replies through the Send API (`/me/messages`)
//!
//! Tokens travel as the `access_token` query parameter.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FacebookConfig;

/// Permissions requested when connecting a Page.
pub const PAGE_SCOPES: &str =
    "pages_messaging,pages_show_list,pages_manage_metadata,pages_read_engagement";

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Graph API error ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("Missing app credentials")]
    MissingCredentials,

    #[error("Invalid Graph object id: {0:?}")]
    InvalidId(String),
}

/// Graph object ids (PSIDs, page ids) are opaque tokens; anything that could
/// change the request path is refused.
pub fn is_valid_object_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacebookPage {
    pub id: String,
    pub name: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageList {
    #[serde(default)]
    data: Vec<FacebookPage>,
}

/// Messenger sender profile. `raw` keeps the full response for contact metadata.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub name: Option<String>,
    pub profile_pic: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResponse {
    pub recipient_id: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    recipient: Recipient<'a>,
    message: TextMessage<'a>,
    messaging_type: &'static str,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GraphErrorResponse {
    error: Option<GraphErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: i64,
    message: String,
}

// ============================================================================
// GraphClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct GraphClient {
    client: Client,
    app_id: String,
    app_secret: String,
    graph_base_url: String,
    dialog_base_url: String,
    api_version: String,
}

impl GraphClient {
    pub fn new(config: &FacebookConfig) -> Result<Self, GraphError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            graph_base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            dialog_base_url: config.dialog_base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
        })
    }

    /// Create a client pointed at a custom Graph host (for testing / integration)
    pub fn with_base_url(config: &FacebookConfig, base_url: String) -> Result<Self, GraphError> {
        let mut client = Self::new(config)?;
        client.graph_base_url = base_url.trim_end_matches('/').to_string();
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.graph_base_url, self.api_version, path)
    }

    /// URL of the OAuth dialog a user is redirected to when connecting Pages.
    pub fn oauth_dialog_url(&self, redirect_uri: &str, state: &str) -> Result<String, GraphError> {
        let base = format!("{}/{}/dialog/oauth", self.dialog_base_url, self.api_version);
        let request = self
            .client
            .get(base)
            .query(&[
                ("client_id", self.app_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", PAGE_SCOPES),
                ("response_type", "code"),
                ("state", state),
            ])
            .build()?;
        Ok(request.url().to_string())
    }

    /// Exchange an OAuth `code` for a user access token.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<AccessToken, GraphError> {
        if self.app_id.is_empty() || self.app_secret.is_empty() {
            return Err(GraphError::MissingCredentials);
        }

        let response = self
            .client
            .get(self.endpoint("oauth/access_token"))
            .query(&[
                ("client_id", self.app_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("client_secret", self.app_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await?;

        Self::decode(response).await
    }

    /// Pages the user manages, each with its own page access token.
    pub async fn list_pages(&self, user_access_token: &str) -> Result<Vec<FacebookPage>, GraphError> {
        let response = self
            .client
            .get(self.endpoint("me/accounts"))
            .query(&[("access_token", user_access_token)])
            .send()
            .await?;

        let pages: PageList = Self::decode(response).await?;
        Ok(pages.data)
    }

    pub async fn fetch_user_profile(
        &self,
        user_id: &str,
        page_access_token: &str,
    ) -> Result<UserProfile, GraphError> {
        if !is_valid_object_id(user_id) {
            return Err(GraphError::InvalidId(user_id.to_string()));
        }

        let response = self
            .client
            .get(self.endpoint(user_id))
            .query(&[
                ("fields", "name,profile_pic"),
                ("access_token", page_access_token),
            ])
            .send()
            .await?;

        let raw: serde_json::Value = Self::decode(response).await?;
        Ok(UserProfile {
            name: raw["name"].as_str().map(str::to_string),
            profile_pic: raw["profile_pic"].as_str().map(str::to_string),
            raw,
        })
    }

    /// Send a plain-text reply to a Messenger user.
    pub async fn send_text_message(
        &self,
        page_access_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<SendResponse, GraphError> {
        let body = SendRequest {
            recipient: Recipient { id: recipient_id },
            message: TextMessage { text },
            messaging_type: "RESPONSE",
        };

        let response = self
            .client
            .post(self.endpoint("me/messages"))
            .query(&[("access_token", page_access_token)])
            .json(&body)
            .send()
            .await?;

        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GraphError> {
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<GraphErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let (code, message) = detail
                .map(|e| (e.code, e.message))
                .unwrap_or((i64::from(status.as_u16()), error_body));

            tracing::warn!(code = code, message = %message, "Graph API error");

            return Err(GraphError::Api { code, message });
        }

        Ok(response.json().await?)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> FacebookConfig {
        FacebookConfig {
            app_id: "app-123".to_string(),
            app_secret: "secret-456".to_string(),
            ..FacebookConfig::default()
        }
    }

    async fn client_for(server: &MockServer) -> GraphClient {
        GraphClient::with_base_url(&test_config(), server.uri()).expect("client")
    }

    #[test]
    fn test_oauth_dialog_url_contains_params() {
        let client = GraphClient::new(&test_config()).unwrap();
        let url = client
            .oauth_dialog_url("http://localhost:3000/api/auth/facebook-pages/callback", "user-1")
            .unwrap();

        assert!(url.starts_with("https://www.facebook.com/v17.0/dialog/oauth?"));
        assert!(url.contains("client_id=app-123"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("state=user-1"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fapi%2Fauth%2Ffacebook-pages%2Fcallback"
        ));
        assert!(url.contains("pages_messaging"));
    }

    #[tokio::test]
    async fn test_exchange_code_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v17.0/oauth/access_token"))
            .and(query_param("code", "the-code"))
            .and(query_param("client_secret", "secret-456"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "user-token",
                "token_type": "bearer"
            })))
            .mount(&server)
            .await;

        let token = client_for(&server)
            .await
            .exchange_code("the-code", "http://localhost/cb")
            .await
            .unwrap();
        assert_eq!(token.access_token, "user-token");
    }

    #[tokio::test]
    async fn test_exchange_code_requires_credentials() {
        let client = GraphClient::new(&FacebookConfig::default()).unwrap();
        let result = client.exchange_code("c", "http://localhost/cb").await;
        assert!(matches!(result, Err(GraphError::MissingCredentials)));
    }

    #[tokio::test]
    async fn test_list_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v17.0/me/accounts"))
            .and(query_param("access_token", "user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"id": "P1", "name": "Shop", "access_token": "page-token", "category": "Retail"}
                ]
            })))
            .mount(&server)
            .await;

        let pages = client_for(&server).await.list_pages("user-token").await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].id, "P1");
        assert_eq!(pages[0].access_token, "page-token");
    }

    #[tokio::test]
    async fn test_fetch_user_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v17.0/PSID_9"))
            .and(query_param("fields", "name,profile_pic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Ana Silva",
                "profile_pic": "https://cdn.example/ana.png",
                "id": "PSID_9"
            })))
            .mount(&server)
            .await;

        let profile = client_for(&server)
            .await
            .fetch_user_profile("PSID_9", "page-token")
            .await
            .unwrap();
        assert_eq!(profile.name.as_deref(), Some("Ana Silva"));
        assert_eq!(profile.profile_pic.as_deref(), Some("https://cdn.example/ana.png"));
        assert_eq!(profile.raw["id"], "PSID_9");
    }

    #[tokio::test]
    async fn test_fetch_user_profile_refuses_path_like_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        for id in ["../me/accounts", "me/accounts", "123?fields=email", "", "a%2Fb"] {
            let err = client.fetch_user_profile(id, "page-token").await.unwrap_err();
            assert!(matches!(err, GraphError::InvalidId(_)), "id {:?}", id);
        }
    }

    #[test]
    fn test_object_id_validation() {
        assert!(is_valid_object_id("1234567890"));
        assert!(is_valid_object_id("PSID_9"));
        assert!(is_valid_object_id("psid-abc"));
        assert!(!is_valid_object_id("../x"));
        assert!(!is_valid_object_id("a b"));
    }

    #[tokio::test]
    async fn test_send_text_message_posts_send_api_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v17.0/me/messages"))
            .and(query_param("access_token", "page-token"))
            .and(body_json(serde_json::json!({
                "recipient": {"id": "PSID_9"},
                "message": {"text": "hello"},
                "messaging_type": "RESPONSE"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "recipient_id": "PSID_9",
                "message_id": "m_out_1"
            })))
            .mount(&server)
            .await;

        let sent = client_for(&server)
            .await
            .send_text_message("page-token", "PSID_9", "hello")
            .await
            .unwrap();
        assert_eq!(sent.message_id.as_deref(), Some("m_out_1"));
    }

    #[tokio::test]
    async fn test_graph_error_envelope_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Invalid OAuth access token.", "type": "OAuthException", "code": 190}
            })))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .await
            .send_text_message("bad", "PSID_9", "hello")
            .await;
        match result {
            Err(GraphError::Api { code, message }) => {
                assert_eq!(code, 190);
                assert!(message.contains("OAuth"));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_body_falls_back_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let result = client_for(&server).await.list_pages("t").await;
        match result {
            Err(GraphError::Api { code, message }) => {
                assert_eq!(code, 502);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }
}
