pub mod cipher;
pub mod http;
pub mod token;

use crate::errors::AppError;
use crate::models::{Provider, TokenSet};
use async_trait::async_trait;
use thiserror::Error;

pub use cipher::CredentialCipher;
pub use http::{HttpOAuthConnector, Pagination, ProviderProfile, TokenAuthStyle};
pub use token::TokenManager;

/// Failure of a single provider call. `Unauthorized` is the only variant
/// that triggers a token refresh.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<ConnectorError> for AppError {
    fn from(value: ConnectorError) -> Self {
        match value {
            ConnectorError::Unauthorized(message) => Self::Credential(message),
            other => Self::Provider(other.to_string()),
        }
    }
}

/// Capabilities a SaaS source exposes to the engine. Implementations must be
/// stateless with respect to tokens; the caller passes the live access token.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    fn provider(&self) -> Provider;

    fn authorization_url(&self, state: &str) -> Result<String, ConnectorError>;

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenSet, ConnectorError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ConnectorError>;

    async fn discover_tables(&self, access_token: &str) -> Result<Vec<String>, ConnectorError>;

    async fn fetch_entities(
        &self,
        access_token: &str,
        entity: &str,
    ) -> Result<Vec<serde_json::Value>, ConnectorError>;
}
