//! CRM OAuth token storage and the background refresh loop.
//!
//! The relay never keeps the token pair in process-wide globals: every reader
//! and writer goes through a [`TokenStore`]. The Railway store keeps the pair
//! in the hosting service's variables so a redeploy picks up the rotated pair.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::{
    config::{OAuthClientConfig, RailwayConfig},
    error::RelayError,
};

pub const ACCESS_VARIABLE: &str = "GHL_ACCESS";
pub const REFRESH_VARIABLE: &str = "GHL_REFRESH";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self) -> Result<TokenPair, RelayError>;
    async fn set(&self, pair: TokenPair) -> Result<(), RelayError>;
}

/// In-process store, seeded from the environment at startup.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    pair: RwLock<TokenPair>,
}

impl MemoryTokenStore {
    pub fn new(pair: TokenPair) -> Self {
        Self {
            pair: RwLock::new(pair),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self) -> Result<TokenPair, RelayError> {
        let pair = self.pair.read().await.clone();
        if pair.access.is_empty() {
            return Err(RelayError::Token("no access token configured".to_string()));
        }
        Ok(pair)
    }

    async fn set(&self, pair: TokenPair) -> Result<(), RelayError> {
        *self.pair.write().await = pair;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<V: Serialize> {
    query: &'static str,
    variables: V,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VariablesQuery<'a> {
    project_id: &'a str,
    environment_id: &'a str,
    service_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VariableUpsertInput<'a> {
    project_id: &'a str,
    environment_id: &'a str,
    service_id: &'a str,
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct VariableUpsert<'a> {
    input: VariableUpsertInput<'a>,
}

const VARIABLES_QUERY: &str = "query variables($projectId: String!, $environmentId: String!, $serviceId: String) { variables(projectId: $projectId, environmentId: $environmentId, serviceId: $serviceId) }";
const VARIABLE_UPSERT_MUTATION: &str =
    "mutation variableUpsert($input: VariableUpsertInput!) { variableUpsert(input: $input) }";

/// Reads and writes the pair as Railway service variables over GraphQL.
pub struct RailwayTokenStore {
    client: reqwest::Client,
    config: RailwayConfig,
}

impl RailwayTokenStore {
    pub fn new(client: reqwest::Client, config: RailwayConfig) -> Self {
        Self { client, config }
    }

    async fn post<V: Serialize + Send + Sync>(
        &self,
        request: &GraphqlRequest<V>,
    ) -> Result<Value, RelayError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_token)
            .json(request)
            .send()
            .await
            .map_err(|err| RelayError::Token(format!("railway request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Token(format!("railway returned {status}: {body}")));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| RelayError::Token(format!("railway parse failed: {err}")))?;
        if let Some(errors) = payload.get("errors").filter(|errors| !errors.is_null()) {
            return Err(RelayError::Token(format!("railway graphql errors: {errors}")));
        }
        Ok(payload)
    }

    async fn upsert(&self, name: &str, value: &str) -> Result<(), RelayError> {
        let request = GraphqlRequest {
            query: VARIABLE_UPSERT_MUTATION,
            variables: VariableUpsert {
                input: VariableUpsertInput {
                    project_id: &self.config.project_id,
                    environment_id: &self.config.environment_id,
                    service_id: &self.config.service_id,
                    name,
                    value,
                },
            },
        };
        self.post(&request).await.map(|_| ())
    }
}

#[async_trait]
impl TokenStore for RailwayTokenStore {
    async fn get(&self) -> Result<TokenPair, RelayError> {
        let request = GraphqlRequest {
            query: VARIABLES_QUERY,
            variables: VariablesQuery {
                project_id: &self.config.project_id,
                environment_id: &self.config.environment_id,
                service_id: &self.config.service_id,
            },
        };
        let payload = self.post(&request).await?;
        let variables = payload
            .get("data")
            .and_then(|data| data.get("variables"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let read = |name: &str| {
            variables
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };

        let pair = TokenPair {
            access: read(ACCESS_VARIABLE),
            refresh: read(REFRESH_VARIABLE),
        };
        if pair.access.is_empty() {
            return Err(RelayError::Token(format!(
                "{ACCESS_VARIABLE} missing from railway variables"
            )));
        }
        Ok(pair)
    }

    async fn set(&self, pair: TokenPair) -> Result<(), RelayError> {
        self.upsert(REFRESH_VARIABLE, &pair.refresh).await?;
        self.upsert(ACCESS_VARIABLE, &pair.access).await
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: String,
}

/// Exchanges the stored refresh token for a new pair and persists it.
pub async fn refresh_once(
    client: &reqwest::Client,
    store: &dyn TokenStore,
    ghl_base_url: &str,
    oauth: &OAuthClientConfig,
) -> Result<TokenPair, RelayError> {
    let current = store.get().await?;
    if current.refresh.is_empty() {
        return Err(RelayError::Token("no refresh token stored".to_string()));
    }

    let response = client
        .post(format!("{ghl_base_url}/oauth/token"))
        .header("Accept", "application/json")
        .form(&[
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh.as_str()),
        ])
        .send()
        .await
        .map_err(|err| RelayError::Token(format!("oauth refresh request failed: {err}")))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Token(format!("oauth refresh returned {status}: {body}")));
    }
    let tokens = response
        .json::<OAuthTokenResponse>()
        .await
        .map_err(|err| RelayError::Token(format!("oauth refresh parse failed: {err}")))?;

    let pair = TokenPair {
        access: tokens.access_token,
        refresh: tokens.refresh_token,
    };
    store.set(pair.clone()).await?;
    Ok(pair)
}

/// Runs [`refresh_once`] on a fixed interval until the task is dropped.
/// The first tick fires after one full interval.
pub fn spawn_refresher(
    client: reqwest::Client,
    store: Arc<dyn TokenStore>,
    ghl_base_url: String,
    oauth: OAuthClientConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = oauth.refresh_interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match refresh_once(&client, store.as_ref(), &ghl_base_url, &oauth).await {
                Ok(_) => info!(scope = "Token Refresh", "rotated CRM token pair"),
                Err(err) => error!(scope = "Token Refresh", error = %err, "token refresh failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::{
        matchers::{body_partial_json, body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn railway_config(api_url: String) -> RailwayConfig {
        RailwayConfig {
            api_url,
            api_token: "rw-token".to_string(),
            project_id: "proj".to_string(),
            environment_id: "env".to_string(),
            service_id: "svc".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_store_round_trip_and_empty_error() {
        let store = MemoryTokenStore::default();
        assert!(matches!(store.get().await, Err(RelayError::Token(_))));

        let pair = TokenPair {
            access: "a".into(),
            refresh: "r".into(),
        };
        store.set(pair.clone()).await.unwrap();
        assert_eq!(store.get().await.unwrap(), pair);
    }

    #[tokio::test]
    async fn railway_get_reads_variables_with_typed_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql/v2"))
            .and(header("authorization", "Bearer rw-token"))
            .and(body_partial_json(json!({
                "variables": { "projectId": "proj", "environmentId": "env", "serviceId": "svc" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "variables": { "GHL_ACCESS": "acc", "GHL_REFRESH": "ref", "OTHER": "x" } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = RailwayTokenStore::new(
            reqwest::Client::new(),
            railway_config(format!("{}/graphql/v2", server.uri())),
        );
        let pair = store.get().await.unwrap();
        assert_eq!(
            pair,
            TokenPair {
                access: "acc".into(),
                refresh: "ref".into()
            }
        );
    }

    #[tokio::test]
    async fn railway_set_keeps_values_out_of_query_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "query": VARIABLE_UPSERT_MUTATION,
                "variables": { "input": { "name": "GHL_ACCESS", "value": "new\"access" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "variableUpsert": true } })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "variables": { "input": { "name": "GHL_REFRESH", "value": "new-refresh" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "variableUpsert": true } })))
            .expect(1)
            .mount(&server)
            .await;

        let store = RailwayTokenStore::new(reqwest::Client::new(), railway_config(server.uri()));
        store
            .set(TokenPair {
                access: "new\"access".into(),
                refresh: "new-refresh".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn railway_graphql_errors_surface() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{ "message": "Not Authorized" }]
            })))
            .mount(&server)
            .await;

        let store = RailwayTokenStore::new(reqwest::Client::new(), railway_config(server.uri()));
        let err = store.get().await.unwrap_err();
        assert!(err.to_string().contains("Not Authorized"));
    }

    #[tokio::test]
    async fn refresh_once_rotates_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh-access",
                "refresh_token": "fresh-refresh",
                "expires_in": 86399
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::new(TokenPair {
            access: "old-access".into(),
            refresh: "old-refresh".into(),
        });
        let oauth = OAuthClientConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            refresh_interval: Duration::from_secs(60),
        };

        let pair = refresh_once(&reqwest::Client::new(), &store, &server.uri(), &oauth)
            .await
            .unwrap();
        assert_eq!(pair.access, "fresh-access");
        assert_eq!(store.get().await.unwrap(), pair);
    }

    #[tokio::test]
    async fn refresh_once_keeps_old_pair_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let original = TokenPair {
            access: "old-access".into(),
            refresh: "old-refresh".into(),
        };
        let store = MemoryTokenStore::new(original.clone());
        let oauth = OAuthClientConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            refresh_interval: Duration::from_secs(60),
        };

        let err = refresh_once(&reqwest::Client::new(), &store, &server.uri(), &oauth)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
        assert_eq!(store.get().await.unwrap(), original);
    }
}
