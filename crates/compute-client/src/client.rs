//! Compute API client
//!
//! The client talks to the identity and compute services of a cloud host. Every call that
//! needs authentication takes a token from [`Client::token`], which reuses a cached token as
//! long as the identity service still accepts it.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::ComputeError;
use crate::secrets::Credentials;
use crate::token_cache::TokenCache;

const TOKENS_PATH: &str = "/identity/v3/auth/tokens";
const SERVERS_PATH: &str = "/compute/v2.1/servers";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// A client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Which protocol the client should use for hosts given without a scheme
    pub protocol: ClientProtocol,

    /// Bound on every request
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            protocol: ClientProtocol::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Http
    }
}

impl ClientProtocol {
    fn scheme(&self) -> &str {
        match self {
            ClientProtocol::Http => "http",
            ClientProtocol::Https => "https",
        }
    }
}

/// The server to create.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServerRequest {
    /// Server name.
    pub name: String,
    /// Image the server boots from.
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    /// Flavor of the server.
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    /// Networks to attach.
    pub networks: Vec<Network>,
    /// Security groups to apply.
    pub security_groups: Vec<SecurityGroup>,
}

/// A network a server attaches to.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Network {
    /// Network id.
    pub uuid: String,
}

/// A security group applied to a server.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SecurityGroup {
    /// Group name.
    pub name: String,
}

#[derive(Serialize)]
struct ServerEnvelope<'a> {
    server: &'a ServerRequest,
}

#[derive(Deserialize)]
struct ServerResponse {
    server: Server,
}

#[derive(Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    status: String,
}

/// The lifecycle state of a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    /// The server is being built.
    Build,
    /// The server is running.
    Active,
    /// The server failed.
    Error,
    /// Any other state reported by the cloud.
    Other(String),
}

impl From<&str> for ServerStatus {
    fn from(s: &str) -> Self {
        match s {
            "BUILD" => ServerStatus::Build,
            "ACTIVE" => ServerStatus::Active,
            "ERROR" => ServerStatus::Error,
            other => ServerStatus::Other(other.to_owned()),
        }
    }
}

/// The compute client creates, polls and deletes servers on cloud hosts.
///
/// Hosts are given as `address[:port]`, or as a full URL to pick the scheme explicitly. The
/// client is safe to share between tasks.
pub struct Client {
    config: ClientConfig,
    credentials: Credentials,
    tokens: TokenCache,
    client: reqwest::Client,
}

impl Client {
    /// Create a new client authenticating with the given credentials
    pub fn new(config: ClientConfig, credentials: Credentials) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Client {
            config,
            credentials,
            tokens: TokenCache::default(),
            client,
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}{}", host.trim_end_matches('/'), path)
        } else {
            format!("{}://{}{}", self.config.protocol.scheme(), host, path)
        }
    }

    /// A token for the host: the cached one if the identity service still accepts it,
    /// otherwise a fresh one.
    #[instrument(level = "debug", skip(self))]
    pub async fn token(&self, host: &str) -> Result<String, ComputeError> {
        if let Some(token) = self.tokens.get(host).await {
            if self.token_is_valid(host, &token).await {
                return Ok(token);
            }
            debug!("cached token was rejected");
            self.tokens.remove(host).await;
        }
        let token = self.acquire_token(host).await?;
        self.tokens.insert(host, token.clone()).await;
        Ok(token)
    }

    /// Asks the identity service whether a token is still valid.
    pub async fn token_is_valid(&self, host: &str, token: &str) -> bool {
        let res = self
            .client
            .head(self.url(host, TOKENS_PATH))
            .header(AUTH_TOKEN_HEADER, token)
            .header(SUBJECT_TOKEN_HEADER, token)
            .send()
            .await;
        match res {
            Ok(r) => r.status() == StatusCode::OK,
            Err(e) => {
                warn!(%host, error = %e, "token probe failed");
                false
            }
        }
    }

    /// Requests a new token with the password grant.
    #[instrument(level = "info", skip(self))]
    pub async fn acquire_token(&self, host: &str) -> Result<String, ComputeError> {
        const OPERATION: &str = "acquire token";
        let res = self
            .client
            .post(self.url(host, TOKENS_PATH))
            .json(&self.credentials.password_grant())
            .send()
            .await
            .map_err(ComputeError::transport(OPERATION))?;
        if res.status() != StatusCode::CREATED {
            return Err(unexpected(OPERATION, res).await);
        }
        let token = res
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(ComputeError::MissingSubjectToken)?;
        debug!("successfully authorized");
        Ok(token.to_owned())
    }

    /// Creates a server and returns its id.
    #[instrument(level = "info", skip(self, server), fields(server = %server.name))]
    pub async fn create_server(
        &self,
        host: &str,
        server: &ServerRequest,
    ) -> Result<String, ComputeError> {
        const OPERATION: &str = "create server";
        let token = self.token(host).await?;
        let res = self
            .client
            .post(self.url(host, SERVERS_PATH))
            .header(AUTH_TOKEN_HEADER, token)
            .json(&ServerEnvelope { server })
            .send()
            .await
            .map_err(ComputeError::transport(OPERATION))?;
        if res.status() == StatusCode::FORBIDDEN {
            return Err(ComputeError::CapacityExceeded);
        }
        if !res.status().is_success() {
            return Err(unexpected(OPERATION, res).await);
        }
        let created: ServerResponse = decode(OPERATION, res).await?;
        debug!(id = %created.server.id, "server created");
        Ok(created.server.id)
    }

    /// Reads the lifecycle state of a server.
    pub async fn server_status(&self, host: &str, id: &str) -> Result<ServerStatus, ComputeError> {
        const OPERATION: &str = "get server";
        let token = self.token(host).await?;
        let res = self
            .client
            .get(self.url(host, &format!("{}/{}", SERVERS_PATH, id)))
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(ComputeError::transport(OPERATION))?;
        if res.status() != StatusCode::OK {
            return Err(unexpected(OPERATION, res).await);
        }
        let server: ServerResponse = decode(OPERATION, res).await?;
        Ok(ServerStatus::from(server.server.status.as_str()))
    }

    /// Deletes a server.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_server(&self, host: &str, id: &str) -> Result<(), ComputeError> {
        const OPERATION: &str = "delete server";
        let token = self.token(host).await?;
        let res = self
            .client
            .delete(self.url(host, &format!("{}/{}", SERVERS_PATH, id)))
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(ComputeError::transport(OPERATION))?;
        if res.status() != StatusCode::NO_CONTENT {
            return Err(unexpected(OPERATION, res).await);
        }
        Ok(())
    }
}

async fn unexpected(operation: &'static str, res: Response) -> ComputeError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    debug!(operation, status, %body, "unexpected response");
    ComputeError::UnexpectedStatus {
        operation,
        status,
        body,
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    res: Response,
) -> Result<T, ComputeError> {
    let raw = res
        .bytes()
        .await
        .map_err(ComputeError::transport(operation))?;
    serde_json::from_slice(&raw).map_err(|source| ComputeError::Decode { operation, source })
}
