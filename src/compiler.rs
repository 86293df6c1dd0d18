use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Layer, ModelDefinition, ModelResult, TenantId, UserMetricDefinition};
use crate::warehouse::TenantSession;
use std::collections::HashSet;
use std::time::Instant;

/// Reserved name prefix of compiled metric models. Nothing else may use it.
pub const METRIC_MODEL_PREFIX: &str = "int_metric_";

/// Compiled metrics run after every hand-written INT model.
pub const METRIC_EXECUTION_ORDER_BASE: i64 = 1000;

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Accepts exactly one `SELECT`/`WITH` statement, with at most a trailing `;`.
fn normalize_user_query(query: &str) -> Result<&str, String> {
    let trimmed = query.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    if trimmed.is_empty() {
        return Err("custom query is empty".to_string());
    }
    if trimmed.contains(';') {
        return Err("custom query must be a single statement".to_string());
    }

    let first_word = trimmed
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if first_word != "SELECT" && first_word != "WITH" {
        return Err(format!(
            "custom query must start with SELECT or WITH, found '{}'",
            first_word
        ));
    }
    Ok(trimmed)
}

/// Wraps a user metric query into the standard metric row shape. Pure text
/// transformation; the query is not prepared or executed here.
pub fn build_metric_query(definition: &UserMetricDefinition) -> Result<String, String> {
    let query = normalize_user_query(definition.custom_query.as_deref().unwrap_or_default())?;
    if !definition.yearly_goal.is_finite() {
        return Err("yearly goal must be a finite number".to_string());
    }

    Ok(format!(
        "SELECT {} AS metric_name, {} AS category, {} AS format, {:?} AS yearly_goal, \
         CURRENT_TIMESTAMP AS calculated_at, result.value AS current_value FROM ({}) result",
        sql_literal(&definition.name),
        sql_literal(&definition.category),
        sql_literal(&definition.format),
        definition.yearly_goal,
        query
    ))
}

/// Recreates one `int_metric_<slug>` INT model per user metric with a custom
/// query. Previously compiled models are removed first, so deleted
/// definitions leave no model behind. Each definition that cannot be compiled
/// yields a failed result; the rest still compile.
pub fn compile_user_metrics(db: &Database, tenant_id: TenantId) -> AppResult<Vec<ModelResult>> {
    let definitions = db.list_compilable_user_metrics(tenant_id)?;
    let removed = db.delete_models_with_prefix(tenant_id, METRIC_MODEL_PREFIX)?;
    tracing::info!(
        tenant_id = %tenant_id,
        definitions = definitions.len(),
        removed,
        "compiling user metrics"
    );

    let mut results = Vec::with_capacity(definitions.len());
    let mut seen = HashSet::new();
    for (index, definition) in definitions.iter().enumerate() {
        let started = Instant::now();
        let slug = slugify(&definition.name);
        let model_name = format!("{}{}", METRIC_MODEL_PREFIX, slug);

        let compiled = if slug.is_empty() {
            Err(format!("metric '{}' has no usable characters for a model name", definition.name))
        } else if !seen.insert(model_name.clone()) {
            Err(format!("metric '{}' collides with another metric named '{}'", definition.name, model_name))
        } else {
            build_metric_query(definition)
        };

        let outcome = compiled.map_err(AppError::Validation).and_then(|query_body| {
            db.register_generated_model(&ModelDefinition {
                tenant_id,
                name: model_name.clone(),
                layer: Layer::Intermediate,
                query_body,
                target_table: Some(model_name.clone()),
                execution_order: METRIC_EXECUTION_ORDER_BASE + index as i64,
                dependencies: Vec::new(),
            })
        });

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(_) => results.push(ModelResult::succeeded(&model_name, None, elapsed)),
            Err(error) => {
                tracing::warn!(tenant_id = %tenant_id, metric = %definition.name, error = %error, "metric compilation failed");
                let label = if slug.is_empty() { definition.name.as_str() } else { model_name.as_str() };
                results.push(ModelResult::failed(label, error.to_string(), elapsed));
            }
        }
    }

    Ok(results)
}

/// Drops `int_metric_*` tables in the warehouse that no longer have a model.
pub fn drop_orphaned_metric_tables(db: &Database, session: &TenantSession) -> AppResult<Vec<String>> {
    let registered = db
        .list_models(session.tenant_id(), Some(Layer::Intermediate))?
        .into_iter()
        .map(|model| model.name)
        .collect::<HashSet<_>>();

    let mut dropped = Vec::new();
    for table in session.list_tables()? {
        if table.starts_with(METRIC_MODEL_PREFIX) && !registered.contains(&table) {
            session.execute_statement(&format!("DROP TABLE IF EXISTS {}", session.qualified(&table)?))?;
            dropped.push(table);
        }
    }
    if !dropped.is_empty() {
        tracing::info!(tenant_id = %session.tenant_id(), tables = ?dropped, "dropped orphaned metric tables");
    }
    Ok(dropped)
}
