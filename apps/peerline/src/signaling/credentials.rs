use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::ice::IceServer;

/// Identity of the local user, forwarded to the credential service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl UserContext {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Supplies the STUN/TURN servers a session may use.
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn ice_servers(&self, user: &UserContext) -> Result<Vec<IceServer>, CredentialError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIceServers {
    servers: Vec<IceServer>,
}

impl StaticIceServers {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn ice_servers(&self, _user: &UserContext) -> Result<Vec<IceServer>, CredentialError> {
        Ok(self.servers.clone())
    }
}

/// Fetches `[{url, username, credential}]` from an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpIceServerProvider {
    client: Client,
    endpoint: Url,
}

impl HttpIceServerProvider {
    pub fn new(endpoint: &str) -> Result<Self, CredentialError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| CredentialError::Config(format!("invalid ice server url '{endpoint}': {err}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| CredentialError::Config(err.to_string()))?;
        Ok(Self { client, endpoint })
    }

    pub fn request_url(&self, user: &UserContext) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user", &user.name);
            if let Some(token) = &user.token {
                query.append_pair("token", token);
            }
        }
        url
    }
}

#[async_trait]
impl IceServerProvider for HttpIceServerProvider {
    async fn ice_servers(&self, user: &UserContext) -> Result<Vec<IceServer>, CredentialError> {
        let url = self.request_url(user);
        debug!(target = "peerline::signaling::credentials", endpoint = %self.endpoint, user = %user.name, "fetching ice servers");
        let servers = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<IceServer>>()
            .await?;
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_its_list() {
        let servers = vec![IceServer::stun("stun:stun.example.org")];
        let provider = StaticIceServers::new(servers.clone());
        assert_eq!(provider.ice_servers(&UserContext::named("alice")).await.unwrap(), servers);
    }

    #[test]
    fn request_url_carries_user_context() {
        let provider = HttpIceServerProvider::new("https://ice.example.org/servers?v=1").unwrap();
        let user = UserContext {
            name: "alice smith".into(),
            token: Some("t0k".into()),
        };
        assert_eq!(
            provider.request_url(&user).as_str(),
            "https://ice.example.org/servers?v=1&user=alice+smith&token=t0k"
        );
    }

    #[test]
    fn invalid_endpoint_is_a_config_error() {
        assert!(matches!(
            HttpIceServerProvider::new("not a url"),
            Err(CredentialError::Config(_))
        ));
    }
}
