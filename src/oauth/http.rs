use super::{ConnectorError, ProviderConnector};
use crate::errors::{AppError, AppResult};
use crate::models::{Provider, TokenSet};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

/// How the token endpoint expects client credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAuthStyle {
    /// `Authorization: Basic base64(client_id:client_secret)`.
    Basic,
    /// `client_id` and `client_secret` as form fields.
    Form,
}

/// How a provider splits an entity listing into pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// The first response holds everything.
    Single,
    /// Opaque cursor read from `next_pointer` and sent back as query `param`.
    Cursor { next_pointer: String, param: String },
    /// Next `{page}` while the boolean at `more_pointer` is true.
    MoreFlag { more_pointer: String },
    /// Next `{offset}` until the count at `total_pointer` has been read.
    Total { total_pointer: String },
    /// Next `{start}` until a page comes back shorter than `page_size`.
    ShortPage,
}

/// Upper bound on requests per entity listing.
const MAX_PAGES: usize = 1_000;

/// Everything the generic OAuth2 connector needs to talk to one provider.
///
/// `entity_path` and `records_pointer` may contain `{entity}` plus any
/// `{key}` found in the credential's provider metadata (for example
/// `{realm_id}` or `{dc}`). `entity_path` may also use the paging
/// placeholders `{page_size}`, `{page}` (from 1), `{offset}` (from 0) and
/// `{start}` (from 1).
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    pub entity_path: String,
    pub records_pointer: String,
    pub scopes: Vec<String>,
    pub default_entities: Vec<String>,
    pub token_auth: TokenAuthStyle,
    pub auth_scheme: String,
    pub pagination: Pagination,
    pub page_size: usize,
}

impl ProviderProfile {
    pub fn builtin(provider: Provider) -> Self {
        let strings = |items: &[&str]| items.iter().map(|item| item.to_string()).collect::<Vec<_>>();
        match provider {
            Provider::Hubspot => Self {
                provider,
                client_id: String::new(),
                client_secret: String::new(),
                redirect_uri: String::new(),
                authorize_url: "https://app.hubspot.com/oauth/authorize".to_string(),
                token_url: "https://api.hubapi.com/oauth/v1/token".to_string(),
                api_base_url: "https://api.hubapi.com".to_string(),
                entity_path: "/crm/v3/objects/{entity}?limit={page_size}".to_string(),
                records_pointer: "/results".to_string(),
                scopes: strings(&[
                    "crm.objects.contacts.read",
                    "crm.objects.companies.read",
                    "crm.objects.deals.read",
                ]),
                default_entities: strings(&["contacts", "companies", "deals", "tickets", "products", "line_items"]),
                token_auth: TokenAuthStyle::Form,
                auth_scheme: "Bearer".to_string(),
                pagination: Pagination::Cursor {
                    next_pointer: "/paging/next/after".to_string(),
                    param: "after".to_string(),
                },
                page_size: 100,
            },
            Provider::Quickbooks => Self {
                provider,
                client_id: String::new(),
                client_secret: String::new(),
                redirect_uri: String::new(),
                authorize_url: "https://appcenter.intuit.com/connect/oauth2".to_string(),
                token_url: "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer".to_string(),
                api_base_url: "https://quickbooks.api.intuit.com/v3/company/{realm_id}".to_string(),
                entity_path:
                    "/query?query=select%20*%20from%20{entity}%20startposition%20{start}%20maxresults%20{page_size}"
                        .to_string(),
                records_pointer: "/QueryResponse/{entity}".to_string(),
                scopes: strings(&["com.intuit.quickbooks.accounting"]),
                default_entities: strings(&[
                    "Invoice", "Customer", "Item", "Payment", "Bill", "Vendor", "Purchase", "Account",
                ]),
                token_auth: TokenAuthStyle::Basic,
                auth_scheme: "Bearer".to_string(),
                pagination: Pagination::ShortPage,
                page_size: 1000,
            },
            Provider::Zoho => Self {
                provider,
                client_id: String::new(),
                client_secret: String::new(),
                redirect_uri: String::new(),
                authorize_url: "https://accounts.zoho.com/oauth/v2/auth".to_string(),
                token_url: "https://accounts.zoho.com/oauth/v2/token".to_string(),
                api_base_url: "https://www.zohoapis.com/crm/v6".to_string(),
                entity_path: "/{entity}?per_page={page_size}&page={page}".to_string(),
                records_pointer: "/data".to_string(),
                scopes: strings(&["ZohoCRM.modules.READ"]),
                default_entities: strings(&["Deals", "Contacts", "Accounts", "Leads", "Tasks"]),
                token_auth: TokenAuthStyle::Form,
                auth_scheme: "Zoho-oauthtoken".to_string(),
                pagination: Pagination::MoreFlag {
                    more_pointer: "/info/more_records".to_string(),
                },
                page_size: 200,
            },
            Provider::Mailchimp => Self {
                provider,
                client_id: String::new(),
                client_secret: String::new(),
                redirect_uri: String::new(),
                authorize_url: "https://login.mailchimp.com/oauth2/authorize".to_string(),
                token_url: "https://login.mailchimp.com/oauth2/token".to_string(),
                api_base_url: "https://{dc}.api.mailchimp.com/3.0".to_string(),
                entity_path: "/{entity}?count={page_size}&offset={offset}".to_string(),
                records_pointer: "/{entity}".to_string(),
                scopes: Vec::new(),
                default_entities: strings(&["lists", "campaigns", "automations", "reports"]),
                token_auth: TokenAuthStyle::Form,
                auth_scheme: "Bearer".to_string(),
                pagination: Pagination::Total {
                    total_pointer: "/total_items".to_string(),
                },
                page_size: 1000,
            },
        }
    }

    /// Builtin profile with app credentials from `<PROVIDER>_CLIENT_ID`,
    /// `<PROVIDER>_CLIENT_SECRET` and `<PROVIDER>_REDIRECT_URI`.
    pub fn from_env(provider: Provider) -> AppResult<Self> {
        let prefix = provider.as_str().to_ascii_uppercase();
        let read = |suffix: &str| {
            let name = format!("{}_{}", prefix, suffix);
            std::env::var(&name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| AppError::Validation(format!("missing environment variable {}", name)))
        };

        let mut profile = Self::builtin(provider);
        profile.client_id = read("CLIENT_ID")?;
        profile.client_secret = read("CLIENT_SECRET")?;
        profile.redirect_uri = read("REDIRECT_URI")?;
        Ok(profile)
    }
}

/// Standard OAuth2 authorization-code connector driven by a [`ProviderProfile`].
pub struct HttpOAuthConnector {
    client: Client,
    profile: ProviderProfile,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl HttpOAuthConnector {
    pub fn new(profile: ProviderProfile) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|error| AppError::Internal(format!("failed to create HTTP client: {}", error)))?;

        Ok(Self {
            client,
            profile,
            metadata: serde_json::Map::new(),
        })
    }

    /// Provider metadata from the stored credential, used to fill URL placeholders.
    pub fn with_metadata(mut self, metadata: &serde_json::Value) -> Self {
        if let Some(map) = metadata.as_object() {
            self.metadata = map.clone();
        }
        self
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn fill(&self, template: &str, entity: &str) -> String {
        let mut rendered = template.replace("{entity}", entity);
        for (key, value) in &self.metadata {
            let replacement = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&format!("{{{}}}", key), &replacement);
        }
        rendered
    }

    fn page_url(&self, entity: &str, page: usize, offset: usize, cursor: Option<&str>) -> Result<Url, ConnectorError> {
        let path = self
            .fill(&self.profile.entity_path, entity)
            .replace("{page_size}", &self.profile.page_size.to_string())
            .replace("{page}", &page.to_string())
            .replace("{offset}", &offset.to_string())
            .replace("{start}", &(offset + 1).to_string());
        let raw = format!("{}{}", self.fill(&self.profile.api_base_url, entity), path);
        let mut url =
            Url::parse(&raw).map_err(|error| ConnectorError::Decode(format!("invalid entity url {}: {}", raw, error)))?;
        if let (Pagination::Cursor { param, .. }, Some(cursor)) = (&self.profile.pagination, cursor) {
            url.query_pairs_mut().append_pair(param, cursor);
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url, access_token: &str, entity: &str) -> Result<serde_json::Value, ConnectorError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("{} {}", self.profile.auth_scheme, access_token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| ConnectorError::Http(format!("request to {} failed: {}", entity, error)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::Unauthorized(format!("{} rejected the access token", entity)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Http(format!("{} returned {}: {}", entity, status, body)));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|error| ConnectorError::Decode(error.to_string()))
    }

    async fn request_tokens(&self, form: &[(&str, &str)]) -> Result<TokenSet, ConnectorError> {
        let mut fields = form.to_vec();
        let mut request = self.client.post(&self.profile.token_url).header("Accept", "application/json");
        match self.profile.token_auth {
            TokenAuthStyle::Basic => {
                request = request.basic_auth(&self.profile.client_id, Some(&self.profile.client_secret));
            }
            TokenAuthStyle::Form => {
                fields.push(("client_id", self.profile.client_id.as_str()));
                fields.push(("client_secret", self.profile.client_secret.as_str()));
            }
        }

        let response = request
            .form(&fields)
            .send()
            .await
            .map_err(|error| ConnectorError::Http(format!("token request failed: {}", error)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A rejected refresh or code grant means the stored grant is no longer usable.
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                    ConnectorError::Unauthorized(format!("token endpoint returned {}: {}", status, body))
                }
                _ => ConnectorError::Http(format!("token endpoint returned {}: {}", status, body)),
            });
        }

        let tokens = response
            .json::<TokenSet>()
            .await
            .map_err(|error| ConnectorError::Decode(format!("invalid token response: {}", error)))?;
        if tokens.access_token.is_empty() {
            return Err(ConnectorError::Decode("token response without access_token".to_string()));
        }
        Ok(tokens)
    }
}

#[async_trait]
impl ProviderConnector for HttpOAuthConnector {
    fn provider(&self) -> Provider {
        self.profile.provider
    }

    fn authorization_url(&self, state: &str) -> Result<String, ConnectorError> {
        let mut url = Url::parse(&self.profile.authorize_url)
            .map_err(|error| ConnectorError::Decode(format!("invalid authorize url: {}", error)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.profile.client_id)
                .append_pair("redirect_uri", &self.profile.redirect_uri)
                .append_pair("state", state);
            if !self.profile.scopes.is_empty() {
                query.append_pair("scope", &self.profile.scopes.join(" "));
            }
            if self.profile.provider == Provider::Zoho {
                query.append_pair("access_type", "offline");
            }
        }
        Ok(url.to_string())
    }

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenSet, ConnectorError> {
        self.request_tokens(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.profile.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ConnectorError> {
        self.request_tokens(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }

    async fn discover_tables(&self, _access_token: &str) -> Result<Vec<String>, ConnectorError> {
        Ok(self.profile.default_entities.clone())
    }

    /// Reads every page of `entity` and returns the records in provider order.
    async fn fetch_entities(
        &self,
        access_token: &str,
        entity: &str,
    ) -> Result<Vec<serde_json::Value>, ConnectorError> {
        let pointer = self.fill(&self.profile.records_pointer, entity);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 1..=MAX_PAGES {
            let url = self.page_url(entity, page, records.len(), cursor.as_deref())?;
            let body = self.get_json(url, access_token, entity).await?;
            let batch = records_at(&body, &pointer)?;
            let fetched = batch.len();
            records.extend(batch);

            let more = match &self.profile.pagination {
                Pagination::Single => false,
                Pagination::Cursor { next_pointer, .. } => {
                    cursor = body.pointer(next_pointer).and_then(cursor_value);
                    cursor.is_some()
                }
                Pagination::MoreFlag { more_pointer } => body
                    .pointer(more_pointer)
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
                Pagination::Total { total_pointer } => body
                    .pointer(total_pointer)
                    .and_then(serde_json::Value::as_u64)
                    .is_some_and(|total| (records.len() as u64) < total),
                Pagination::ShortPage => fetched >= self.profile.page_size,
            };
            if !more || fetched == 0 {
                tracing::debug!(entity, pages = page, records = records.len(), "fetched entity listing");
                return Ok(records);
            }
        }

        Err(ConnectorError::Decode(format!(
            "{} still reported more records after {} pages",
            entity, MAX_PAGES
        )))
    }
}

fn records_at(body: &serde_json::Value, pointer: &str) -> Result<Vec<serde_json::Value>, ConnectorError> {
    match body.pointer(pointer) {
        Some(serde_json::Value::Array(records)) => Ok(records.clone()),
        Some(serde_json::Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(ConnectorError::Decode(format!(
            "expected an array at {} but found {}",
            pointer, other
        ))),
    }
}

fn cursor_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) if !text.is_empty() => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
