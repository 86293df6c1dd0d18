use crate::compiler::METRIC_MODEL_PREFIX;
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{Layer, Model, ModelDefinition, ModelStatus, TenantId};

pub const CORE_USER_METRICS_MODEL: &str = "core_user_metrics";

const METRIC_COLUMNS: &str = "metric_name, category, format, yearly_goal, calculated_at, current_value";

const EMPTY_USER_METRICS_QUERY: &str = "SELECT CAST(NULL AS TEXT) AS metric_name, CAST(NULL AS TEXT) AS category, \
CAST(NULL AS TEXT) AS format, CAST(NULL AS REAL) AS yearly_goal, CAST(NULL AS TEXT) AS calculated_at, \
CAST(NULL AS REAL) AS current_value, CAST(NULL AS REAL) AS progress_pct WHERE 1 = 0";

/// Body of `core_user_metrics` for the given deployed metric tables.
pub fn build_union_query(metric_tables: &[String]) -> String {
    if metric_tables.is_empty() {
        return EMPTY_USER_METRICS_QUERY.to_string();
    }

    let branches = metric_tables
        .iter()
        .map(|table| format!("  SELECT {} FROM {{{{schema}}}}.{}", METRIC_COLUMNS, table))
        .collect::<Vec<_>>()
        .join("\n  UNION ALL\n");

    format!(
        "SELECT {},\n  CASE WHEN yearly_goal > 0 THEN CAST(current_value AS REAL) / yearly_goal * 100 ELSE NULL END AS progress_pct\nFROM (\n{}\n) metrics",
        METRIC_COLUMNS, branches
    )
}

/// Rewrites the stored body of `core_user_metrics` to union every currently
/// deployed metric table. Only the registry changes; nothing is executed.
pub fn refresh_core_user_metrics(db: &Database, tenant_id: TenantId) -> AppResult<Model> {
    let mut metric_tables = db
        .list_models(tenant_id, Some(Layer::Intermediate))?
        .into_iter()
        .filter(|model| model.name.starts_with(METRIC_MODEL_PREFIX) && model.status == ModelStatus::Deployed)
        .filter_map(|model| model.target_table)
        .collect::<Vec<_>>();
    metric_tables.sort();
    metric_tables.dedup();

    let execution_order = db
        .get_model(tenant_id, CORE_USER_METRICS_MODEL)?
        .map(|existing| existing.execution_order)
        .unwrap_or(0);

    let model = db.register_generated_model(&ModelDefinition {
        tenant_id,
        name: CORE_USER_METRICS_MODEL.to_string(),
        layer: Layer::Core,
        query_body: build_union_query(&metric_tables),
        target_table: Some(CORE_USER_METRICS_MODEL.to_string()),
        execution_order,
        dependencies: metric_tables.clone(),
    })?;

    tracing::info!(
        tenant_id = %tenant_id,
        metrics = metric_tables.len(),
        status = model.status.as_str(),
        "refreshed core user metrics aggregator"
    );
    Ok(model)
}
