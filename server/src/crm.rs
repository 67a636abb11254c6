use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use crate::{error::RelayError, tokens::TokenStore, types::Message};

pub const GHL_API_VERSION: &str = "2021-04-15";

/// Conversation lookups against the CRM.
#[async_trait]
pub trait Crm: Send + Sync {
    /// Returns the first conversation id for the contact, if any.
    async fn find_conversation_id(&self, contact_id: &str) -> Result<Option<String>, RelayError>;

    /// Returns the conversation history, newest first.
    async fn conversation_messages(&self, convo_id: &str) -> Result<Vec<Message>, RelayError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    conversations: Vec<ConversationHit>,
}

#[derive(Debug, Deserialize)]
struct ConversationHit {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: MessagesPage,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesPage {
    #[serde(default)]
    messages: Vec<Message>,
}

pub struct GhlClient {
    client: reqwest::Client,
    base_url: String,
    location_id: String,
    tokens: Arc<dyn TokenStore>,
}

impl GhlClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        location_id: impl Into<String>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            location_id: location_id.into(),
            tokens,
        }
    }

    async fn get(
        &self,
        url: String,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<reqwest::Response, RelayError> {
        let token = self.tokens.get().await?.access;
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(token)
            .header("Version", GHL_API_VERSION)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| RelayError::from_transport(what, err))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(scope = "CRM", %status, response = %body, "{what} call failed");
            return Err(RelayError::Downstream(format!("{what} returned {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl Crm for GhlClient {
    async fn find_conversation_id(&self, contact_id: &str) -> Result<Option<String>, RelayError> {
        let response = self
            .get(
                format!("{}/conversations/search", self.base_url),
                &[
                    ("locationId", self.location_id.as_str()),
                    ("contactId", contact_id),
                ],
                "conversation search",
            )
            .await?;

        let payload = response
            .json::<SearchResponse>()
            .await
            .map_err(|err| RelayError::Downstream(format!("conversation search parse failed: {err}")))?;
        let id = payload
            .conversations
            .into_iter()
            .next()
            .and_then(|hit| hit.id)
            .filter(|id| !id.is_empty());
        if id.is_none() {
            info!(scope = "Validation", ghl_contact_id = contact_id, "no conversation for contact");
        }
        Ok(id)
    }

    async fn conversation_messages(&self, convo_id: &str) -> Result<Vec<Message>, RelayError> {
        let response = self
            .get(
                format!("{}/conversations/{convo_id}/messages", self.base_url),
                &[],
                "conversation messages",
            )
            .await?;
        let payload = response
            .json::<MessagesResponse>()
            .await
            .map_err(|err| RelayError::Downstream(format!("conversation messages parse failed: {err}")))?;
        Ok(payload.messages.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{MemoryTokenStore, TokenPair};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn client_for(server: &MockServer, http: reqwest::Client) -> GhlClient {
        let tokens = Arc::new(MemoryTokenStore::new(TokenPair {
            access: "ghl-token".into(),
            refresh: "ghl-refresh".into(),
        }));
        GhlClient::new(http, server.uri(), "loc1", tokens)
    }

    #[tokio::test]
    async fn search_returns_first_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/search"))
            .and(query_param("locationId", "loc1"))
            .and(query_param("contactId", "c1"))
            .and(header("authorization", "Bearer ghl-token"))
            .and(header("version", GHL_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "conversations": [{ "id": "conv1" }, { "id": "conv2" }],
                "total": 2
            })))
            .mount(&server)
            .await;

        let crm = client_for(&server, reqwest::Client::new());
        assert_eq!(
            crm.find_conversation_id("c1").await.unwrap(),
            Some("conv1".to_string())
        );
    }

    #[tokio::test]
    async fn search_without_hits_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "conversations": [] })))
            .mount(&server)
            .await;

        let crm = client_for(&server, reqwest::Client::new());
        assert_eq!(crm.find_conversation_id("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn search_http_failure_is_downstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/search"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let crm = client_for(&server, reqwest::Client::new());
        assert!(matches!(
            crm.find_conversation_id("c1").await,
            Err(RelayError::Downstream(_))
        ));
    }

    #[tokio::test]
    async fn messages_are_read_from_nested_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/conv1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": {
                    "lastMessageId": "m2",
                    "nextPage": false,
                    "messages": [
                        { "id": "m2", "body": "hi", "direction": "inbound" },
                        { "id": "m1", "body": "prev", "direction": "outbound" }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let crm = client_for(&server, reqwest::Client::new());
        let messages = crm.conversation_messages("conv1").await.unwrap();
        assert_eq!(
            messages,
            vec![Message::inbound("hi"), Message::outbound("prev")]
        );
    }

    #[tokio::test]
    async fn slow_crm_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/conv1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "messages": { "messages": [] } }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let crm = client_for(&server, http);
        assert!(matches!(
            crm.conversation_messages("conv1").await,
            Err(RelayError::Timeout(_))
        ));
    }
}
