use super::{ConnectorError, CredentialCipher, ProviderConnector};
use crate::db::{Database, StoredCredential};
use crate::errors::{AppError, AppResult};
use crate::models::{OAuthCredential, Provider, TenantId, TokenSet};
use crate::redaction::Redactor;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;

/// Owns the stored OAuth grant of every `(tenant, provider)` pair and wraps
/// provider calls with a single refresh-and-retry on `Unauthorized`.
#[derive(Clone)]
pub struct TokenManager {
    db: Arc<Database>,
    cipher: CredentialCipher,
    redactor: Redactor,
}

impl TokenManager {
    pub fn new(db: Arc<Database>, cipher: CredentialCipher, redactor: Redactor) -> Self {
        Self { db, cipher, redactor }
    }

    /// Stores `tokens` as the live credential, replacing any previous one.
    /// A token set without a refresh token keeps the stored refresh token.
    pub fn save_tokens(
        &self,
        tenant_id: TenantId,
        provider: Provider,
        tokens: &TokenSet,
        provider_metadata: Option<serde_json::Value>,
    ) -> AppResult<OAuthCredential> {
        let existing = self.db.get_credential(tenant_id, provider)?;
        let now = Utc::now();

        let refresh_token_ciphertext = match &tokens.refresh_token {
            Some(refresh_token) => Some(self.cipher.encrypt(refresh_token)?),
            None => existing.as_ref().and_then(|row| row.refresh_token_ciphertext.clone()),
        };
        let provider_metadata = provider_metadata
            .or_else(|| existing.as_ref().map(|row| row.provider_metadata.clone()))
            .unwrap_or_else(|| serde_json::json!({}));

        let row = StoredCredential {
            tenant_id,
            provider,
            access_token_ciphertext: self.cipher.encrypt(&tokens.access_token)?,
            refresh_token_ciphertext,
            expires_at: tokens.expires_at(now),
            provider_metadata,
            updated_at: now,
        };
        self.db.upsert_credential(&row)?;

        tracing::info!(tenant_id = %tenant_id, provider = provider.as_str(), "stored oauth credential");
        self.decrypt_row(row)
    }

    pub fn load_credential(&self, tenant_id: TenantId, provider: Provider) -> AppResult<OAuthCredential> {
        let row = self.db.get_credential(tenant_id, provider)?.ok_or_else(|| {
            AppError::NotFound(format!(
                "no {} credential for tenant {}",
                provider.as_str(),
                tenant_id
            ))
        })?;
        self.decrypt_row(row)
    }

    pub fn revoke(&self, tenant_id: TenantId, provider: Provider) -> AppResult<bool> {
        self.db.delete_credential(tenant_id, provider)
    }

    /// Completes the authorization-code grant and persists the resulting tokens.
    pub async fn complete_authorization(
        &self,
        tenant_id: TenantId,
        connector: &dyn ProviderConnector,
        code: &str,
        provider_metadata: Option<serde_json::Value>,
    ) -> AppResult<OAuthCredential> {
        let tokens = connector
            .exchange_code_for_tokens(code)
            .await
            .map_err(|error| AppError::Credential(self.scrub(&error.to_string())))?;
        self.save_tokens(tenant_id, connector.provider(), &tokens, provider_metadata)
    }

    /// Refreshes the stored grant in place.
    pub async fn refresh_credential(
        &self,
        tenant_id: TenantId,
        connector: &dyn ProviderConnector,
    ) -> AppResult<OAuthCredential> {
        let provider = connector.provider();
        let current = self.load_credential(tenant_id, provider)?;
        let refresh_token = current.refresh_token.ok_or_else(|| {
            AppError::Credential(format!(
                "{} credential for tenant {} has no refresh token",
                provider.as_str(),
                tenant_id
            ))
        })?;

        let tokens = connector.refresh_token(&refresh_token).await.map_err(|error| {
            let message = self.scrub(&error.to_string());
            tracing::warn!(tenant_id = %tenant_id, provider = provider.as_str(), error = %message, "token refresh failed");
            AppError::Credential(format!("token refresh failed: {}", message))
        })?;

        self.save_tokens(tenant_id, provider, &tokens, None)
    }

    /// Runs `call` with the current access token. On `Unauthorized` the token
    /// is refreshed once and the call retried once; there is no further loop.
    pub async fn execute_with_token_refresh<T, F, Fut>(
        &self,
        tenant_id: TenantId,
        connector: &dyn ProviderConnector,
        call: F,
    ) -> AppResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let provider = connector.provider();
        let credential = self.load_credential(tenant_id, provider)?;

        match call(credential.access_token).await {
            Ok(value) => Ok(value),
            Err(ConnectorError::Unauthorized(message)) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    provider = provider.as_str(),
                    reason = %self.scrub(&message),
                    "access token rejected, refreshing"
                );
                let refreshed = self.refresh_credential(tenant_id, connector).await?;
                call(refreshed.access_token).await.map_err(|error| self.to_app_error(error))
            }
            Err(error) => Err(self.to_app_error(error)),
        }
    }

    fn to_app_error(&self, error: ConnectorError) -> AppError {
        match error {
            ConnectorError::Unauthorized(message) => AppError::Credential(self.scrub(&message)),
            other => AppError::Provider(self.scrub(&other.to_string())),
        }
    }

    fn scrub(&self, message: &str) -> String {
        self.redactor.redact(message).content
    }

    fn decrypt_row(&self, row: StoredCredential) -> AppResult<OAuthCredential> {
        Ok(OAuthCredential {
            tenant_id: row.tenant_id,
            provider: row.provider,
            access_token: self.cipher.decrypt(&row.access_token_ciphertext)?,
            refresh_token: row
                .refresh_token_ciphertext
                .as_deref()
                .map(|value| self.cipher.decrypt(value))
                .transpose()?,
            expires_at: row.expires_at,
            provider_metadata: row.provider_metadata,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::TokenManager;
    use crate::db::Database;
    use crate::models::{Provider, TenantId, TokenSet};
    use crate::oauth::{ConnectorError, CredentialCipher, ProviderConnector};
    use crate::redaction::Redactor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const TENANT: TenantId = TenantId(3);

    struct FakeConnector {
        refresh_calls: AtomicUsize,
        refresh_result: Mutex<Option<Result<TokenSet, ConnectorError>>>,
    }

    impl FakeConnector {
        fn refreshing_to(tokens: TokenSet) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_result: Mutex::new(Some(Ok(tokens))),
            }
        }

        fn failing_refresh() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                refresh_result: Mutex::new(Some(Err(ConnectorError::Unauthorized(
                    "invalid_grant refresh_token=abcdef123456".to_string(),
                )))),
            }
        }
    }

    #[async_trait]
    impl ProviderConnector for FakeConnector {
        fn provider(&self) -> Provider {
            Provider::Hubspot
        }

        fn authorization_url(&self, state: &str) -> Result<String, ConnectorError> {
            Ok(format!("https://auth.example.com/?state={}", state))
        }

        async fn exchange_code_for_tokens(&self, _code: &str) -> Result<TokenSet, ConnectorError> {
            Ok(tokens("initial-access", Some("initial-refresh")))
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenSet, ConnectorError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_result
                .lock()
                .expect("lock")
                .take()
                .unwrap_or_else(|| Err(ConnectorError::Http("refresh called twice".to_string())))
        }

        async fn discover_tables(&self, _access_token: &str) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["deals".to_string()])
        }

        async fn fetch_entities(
            &self,
            _access_token: &str,
            _entity: &str,
        ) -> Result<Vec<serde_json::Value>, ConnectorError> {
            Ok(Vec::new())
        }
    }

    fn tokens(access: &str, refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            refresh_token: refresh.map(ToString::to_string),
            expires_in: Some(3600),
            extra: serde_json::Map::new(),
        }
    }

    fn manager(dir: &tempfile::TempDir) -> TokenManager {
        let db = Arc::new(Database::new(&dir.path().join("registry.db")).expect("db"));
        TokenManager::new(db, CredentialCipher::from_key([9u8; 32]), Redactor::new(true))
    }

    #[tokio::test]
    async fn refreshes_once_and_retries_with_new_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        manager
            .save_tokens(TENANT, Provider::Hubspot, &tokens("stale", Some("keep-me")), None)
            .expect("save");

        let connector = FakeConnector::refreshing_to(tokens("fresh", None));
        let seen = Mutex::new(Vec::new());
        let result = manager
            .execute_with_token_refresh(TENANT, &connector, |access_token| {
                seen.lock().expect("lock").push(access_token.clone());
                async move {
                    if access_token == "stale" {
                        Err(ConnectorError::Unauthorized("expired".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .expect("call succeeds after refresh");

        assert_eq!(result, 42);
        assert_eq!(*seen.lock().expect("lock"), vec!["stale".to_string(), "fresh".to_string()]);
        assert_eq!(connector.refresh_calls.load(Ordering::SeqCst), 1);

        let stored = manager.load_credential(TENANT, Provider::Hubspot).expect("stored");
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token.as_deref(), Some("keep-me"));
    }

    #[tokio::test]
    async fn second_unauthorized_is_not_retried_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        manager
            .save_tokens(TENANT, Provider::Hubspot, &tokens("stale", Some("rt")), None)
            .expect("save");

        let connector = FakeConnector::refreshing_to(tokens("also-rejected", Some("rt-2")));
        let attempts = AtomicUsize::new(0);
        let error = manager
            .execute_with_token_refresh(TENANT, &connector, |_access_token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ConnectorError::Unauthorized("nope".to_string())) }
            })
            .await
            .expect_err("still unauthorized");

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connector.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(error.to_string().starts_with("CREDENTIAL:"));
    }

    #[tokio::test]
    async fn refresh_failure_surfaces_as_redacted_credential_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        manager
            .save_tokens(TENANT, Provider::Hubspot, &tokens("stale", Some("rt")), None)
            .expect("save");

        let connector = FakeConnector::failing_refresh();
        let error = manager
            .execute_with_token_refresh(TENANT, &connector, |_access_token| async {
                Err::<(), _>(ConnectorError::Unauthorized("expired".to_string()))
            })
            .await
            .expect_err("refresh fails");

        let message = error.to_string();
        assert!(message.starts_with("CREDENTIAL: token refresh failed"));
        assert!(!message.contains("abcdef123456"));
        let stored = manager.load_credential(TENANT, Provider::Hubspot).expect("stored");
        assert_eq!(stored.access_token, "stale");
    }

    #[tokio::test]
    async fn non_auth_errors_do_not_trigger_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        manager
            .save_tokens(TENANT, Provider::Hubspot, &tokens("ok", Some("rt")), None)
            .expect("save");

        let connector = FakeConnector::refreshing_to(tokens("unused", None));
        let error = manager
            .execute_with_token_refresh(TENANT, &connector, |_access_token| async {
                Err::<(), _>(ConnectorError::Http("503".to_string()))
            })
            .await
            .expect_err("http error");

        assert!(error.to_string().starts_with("PROVIDER:"));
        assert_eq!(connector.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        let connector = FakeConnector::refreshing_to(tokens("unused", None));

        let error = manager
            .execute_with_token_refresh(TENANT, &connector, |_access_token| async { Ok::<_, ConnectorError>(()) })
            .await
            .expect_err("no credential");
        assert!(error.to_string().starts_with("NOT_FOUND:"));
    }

    #[tokio::test]
    async fn complete_authorization_persists_encrypted_tokens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        let connector = FakeConnector::refreshing_to(tokens("unused", None));

        let credential = manager
            .complete_authorization(TENANT, &connector, "code", Some(serde_json::json!({ "portal_id": 1 })))
            .await
            .expect("authorize");
        assert_eq!(credential.access_token, "initial-access");
        assert!(credential.expires_at.is_some());

        let raw = manager
            .db
            .get_credential(TENANT, Provider::Hubspot)
            .expect("row")
            .expect("exists");
        assert_ne!(raw.access_token_ciphertext, "initial-access");
        assert_eq!(raw.provider_metadata["portal_id"], 1);
    }
}
