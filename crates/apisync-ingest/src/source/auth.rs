//! Source credentials

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::SourceError;
use crate::retry::BackoffPolicy;

/// Default header carrying the tenant identifier
pub const DEFAULT_TENANT_HEADER: &str = "Xero-Tenant-Id";

/// Default JSON pointer of the tenant identifier in the connections response
pub const DEFAULT_TENANT_POINTER: &str = "/0/tenantId";

fn default_tenant_header() -> String {
    DEFAULT_TENANT_HEADER.to_string()
}

fn default_tenant_pointer() -> String {
    DEFAULT_TENANT_POINTER.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum AuthConfig {
    #[default]
    None,
    /// Static headers sent with every request (API key style)
    Headers { headers: BTreeMap<String, String> },
    /// OAuth client-credentials grant plus tenant discovery
    ClientCredentials {
        token_url: String,
        connections_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default = "default_tenant_header")]
        tenant_header: String,
        #[serde(default = "default_tenant_pointer")]
        tenant_pointer: String,
    },
}

#[derive(Debug, Clone)]
struct Credentials {
    token: String,
    tenant: String,
}

/// Holds the credentials of one source for the length of a run
pub struct Authenticator {
    config: AuthConfig,
    credentials: RwLock<Option<Credentials>>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            credentials: RwLock::new(None),
        }
    }

    /// Exchange client credentials for a fresh token and tenant
    pub async fn refresh(&self, client: &Client, backoff: &BackoffPolicy) {
        let AuthConfig::ClientCredentials {
            token_url,
            connections_url,
            client_id,
            client_secret,
            tenant_pointer,
            ..
        } = &self.config
        else {
            return;
        };

        let token = backoff
            .retry_forever("token exchange", || {
                request_token(client, token_url, client_id, client_secret)
            })
            .await;
        let tenant = backoff
            .retry_forever("tenant discovery", || {
                request_tenant(client, connections_url, &token, tenant_pointer)
            })
            .await;

        info!(tenant = %tenant, "Acquired access token");
        *self.credentials.write().await = Some(Credentials { token, tenant });
    }

    /// Forget the current token so the next request fetches a new one
    pub async fn invalidate(&self) {
        if self.credentials.write().await.take().is_some() {
            warn!("Access token rejected, refreshing before the next attempt");
        }
    }

    /// Headers to attach to a source request
    pub async fn headers(&self, client: &Client, backoff: &BackoffPolicy) -> Vec<(String, String)> {
        match &self.config {
            AuthConfig::None => Vec::new(),
            AuthConfig::Headers { headers } => headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            AuthConfig::ClientCredentials { tenant_header, .. } => {
                if self.credentials.read().await.is_none() {
                    self.refresh(client, backoff).await;
                }
                let guard = self.credentials.read().await;
                match guard.as_ref() {
                    Some(credentials) => vec![
                        ("Authorization".to_string(), format!("Bearer {}", credentials.token)),
                        (tenant_header.clone(), credentials.tenant.clone()),
                    ],
                    None => Vec::new(),
                }
            }
        }
    }
}

async fn request_token(
    client: &Client,
    url: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<String, SourceError> {
    let response = client
        .post(url)
        .basic_auth(client_id, Some(client_secret))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await?;
    let body = json_body(url, response).await?;

    body.get("access_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SourceError::MissingCredential("access_token".to_string()))
}

async fn request_tenant(
    client: &Client,
    url: &str,
    token: &str,
    pointer: &str,
) -> Result<String, SourceError> {
    let response = client
        .get(url)
        .bearer_auth(token)
        .header("Accept", "application/json")
        .send()
        .await?;
    let body = json_body(url, response).await?;

    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SourceError::MissingCredential(pointer.to_string()))
}

async fn json_body(url: &str, response: reqwest::Response) -> Result<Value, SourceError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| SourceError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_credentials_defaults() {
        let config: AuthConfig = serde_json::from_str(
            r#"{
                "kind": "client_credentials",
                "token_url": "https://identity.example/connect/token",
                "connections_url": "https://api.example/connections",
                "client_id": "id",
                "client_secret": "secret"
            }"#,
        )
        .unwrap();

        match config {
            AuthConfig::ClientCredentials {
                tenant_header,
                tenant_pointer,
                ..
            } => {
                assert_eq!(tenant_header, DEFAULT_TENANT_HEADER);
                assert_eq!(tenant_pointer, DEFAULT_TENANT_POINTER);
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_static_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("api-auth-accountid".to_string(), "acc".to_string());
        headers.insert("api-auth-applicationkey".to_string(), "key".to_string());

        let auth = Authenticator::new(AuthConfig::Headers { headers });
        let sent = auth.headers(&Client::new(), &BackoffPolicy::default()).await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("api-auth-accountid".to_string(), "acc".to_string()));
    }
}
