use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolated analytics namespace. Every warehouse object of a tenant lives in
/// the schema returned by [`TenantId::schema_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    pub fn schema_name(self) -> String {
        format!("analytics_company_{}", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transformation stage. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Layer {
    #[serde(rename = "stg")]
    Staging,
    #[serde(rename = "int")]
    Intermediate,
    #[serde(rename = "core")]
    Core,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Staging, Layer::Intermediate, Layer::Core];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "stg",
            Self::Intermediate => "int",
            Self::Core => "core",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stg" | "staging" => Some(Self::Staging),
            "int" | "intermediate" => Some(Self::Intermediate),
            "core" => Some(Self::Core),
            _ => None,
        }
    }

    /// Rank used by SQL ordering, since the stored text does not sort in layer order.
    pub fn rank(self) -> i64 {
        match self {
            Self::Staging => 0,
            Self::Intermediate => 1,
            Self::Core => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelStatus {
    Draft,
    Pending,
    Deployed,
    Error,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "deployed" => Some(Self::Deployed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub tenant_id: TenantId,
    pub name: String,
    pub layer: Layer,
    pub query_body: String,
    pub target_table: Option<String>,
    pub execution_order: i64,
    pub dependencies: Vec<String>,
    pub status: ModelStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `Database::register_model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    pub tenant_id: TenantId,
    pub name: String,
    pub layer: Layer,
    pub query_body: String,
    pub target_table: Option<String>,
    pub execution_order: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResult {
    pub model_name: String,
    pub success: bool,
    pub rows_affected: Option<i64>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ModelResult {
    pub fn succeeded(model_name: &str, rows_affected: Option<i64>, execution_time_ms: u64) -> Self {
        Self {
            model_name: model_name.to_string(),
            success: true,
            rows_affected,
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(model_name: &str, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            model_name: model_name.to_string(),
            success: false,
            rows_affected: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetricDefinition {
    pub id: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub custom_query: Option<String>,
    pub category: String,
    pub format: String,
    pub yearly_goal: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveUserMetricPayload {
    pub id: Option<String>,
    pub tenant_id: TenantId,
    pub name: String,
    pub custom_query: Option<String>,
    pub category: Option<String>,
    pub format: Option<String>,
    pub yearly_goal: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Hubspot,
    Quickbooks,
    Zoho,
    Mailchimp,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hubspot => "hubspot",
            Self::Quickbooks => "quickbooks",
            Self::Zoho => "zoho",
            Self::Mailchimp => "mailchimp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hubspot" => Some(Self::Hubspot),
            "quickbooks" => Some(Self::Quickbooks),
            "zoho" => Some(Self::Zoho),
            "mailchimp" => Some(Self::Mailchimp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredential {
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub provider_metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Token endpoint response, normalized across providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenSet {
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|seconds| issued_at + chrono::Duration::seconds(seconds))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    CompilingUserMetrics,
    RunningStg,
    RunningInt,
    RefreshingCoreAggregator,
    RunningCore,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CompilingUserMetrics => "compiling_user_metrics",
            Self::RunningStg => "running_stg",
            Self::RunningInt => "running_int",
            Self::RefreshingCoreAggregator => "refreshing_core_aggregator",
            Self::RunningCore => "running_core",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunResult {
    pub run_id: String,
    pub tenant_id: TenantId,
    pub success: bool,
    pub final_state: PipelineState,
    pub results: Vec<ModelResult>,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub status: String,
    pub final_state: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_time_ms: Option<i64>,
    pub results: Vec<ModelResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    pub model_timeout_seconds: u64,
    pub scheduler_global_limit: usize,
    pub scheduler_max_queue: usize,
    pub refresh_interval_minutes: u64,
    pub redact_aggressive: bool,
    pub run_history_retention_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_timeout_seconds: 300,
            scheduler_global_limit: 4,
            scheduler_max_queue: 256,
            refresh_interval_minutes: 60,
            redact_aggressive: true,
            run_history_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub records_synced: usize,
    pub tables_synced: Vec<String>,
    pub failed_tables: Vec<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{Layer, TenantId, TokenSet};
    use chrono::{TimeZone, Utc};

    #[test]
    fn layers_sort_in_execution_order() {
        let mut layers = vec![Layer::Core, Layer::Staging, Layer::Intermediate];
        layers.sort();
        assert_eq!(layers, Layer::ALL.to_vec());
        assert_eq!(Layer::parse("STG"), Some(Layer::Staging));
        assert_eq!(Layer::parse("reporting"), None);
    }

    #[test]
    fn schema_name_is_namespaced_by_tenant() {
        assert_eq!(TenantId(42).schema_name(), "analytics_company_42");
    }

    #[test]
    fn token_set_keeps_unknown_fields_and_computes_expiry() {
        let tokens: TokenSet = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "expires_in": 3600,
            "x_refresh_token_expires_in": 8726400
        }))
        .expect("parse token set");
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.extra.contains_key("x_refresh_token_expires_in"));

        let issued = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let expires = tokens.expires_at(issued).expect("expiry");
        assert_eq!((expires - issued).num_seconds(), 3600);
    }
}
