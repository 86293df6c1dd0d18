use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{Layer, ModelResult, ModelStatus};
use crate::redaction::Redactor;
use crate::resolver::dependency_errors;
use crate::warehouse::TenantSession;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Per-model statement deadline. `None` runs without a limit.
    pub model_timeout: Option<Duration>,
    pub redactor: Redactor,
}

impl ExecutionOptions {
    pub fn from_timeout_seconds(seconds: u64, redactor: Redactor) -> Self {
        Self {
            model_timeout: (seconds > 0).then(|| Duration::from_secs(seconds)),
            redactor,
        }
    }
}

/// Executes every model of `layer` for the session's tenant in registry order.
///
/// A failing model is marked `error` and execution moves on, so the returned
/// results always cover the whole layer. Registry failures abort with `Err`.
pub fn execute_layer(
    db: &Database,
    session: &TenantSession,
    layer: Layer,
    options: &ExecutionOptions,
) -> AppResult<Vec<ModelResult>> {
    let tenant_id = session.tenant_id();
    let mut registry = db
        .list_models(tenant_id, None)?
        .into_iter()
        .map(|model| (model.name.clone(), model))
        .collect::<HashMap<_, _>>();
    let models = db.list_models(tenant_id, Some(layer))?;

    tracing::info!(tenant_id = %tenant_id, layer = layer.as_str(), models = models.len(), "executing layer");

    let mut results = Vec::with_capacity(models.len());
    for model in models {
        let started = Instant::now();

        let blocked = dependency_errors(&model, &registry);
        if !blocked.is_empty() {
            let message = format!("dependency check failed: {}", blocked.join("; "));
            tracing::warn!(tenant_id = %tenant_id, model = %model.name, error = %message, "model skipped");
            db.mark_model_failed(tenant_id, &model.name, &message, Utc::now())?;
            set_status(&mut registry, &model.name, ModelStatus::Error);
            results.push(ModelResult::failed(&model.name, message, elapsed_ms(started)));
            continue;
        }

        let sql = session.render(&model.query_body);
        session.set_statement_timeout(options.model_timeout);
        let outcome = match &model.target_table {
            Some(target) => session.materialize(target, &sql).map(Some),
            None => session.execute_statement(&sql).map(|_| None),
        };
        session.set_statement_timeout(None);

        match outcome {
            Ok(rows_affected) => {
                db.mark_model_deployed(tenant_id, &model.name, Utc::now())?;
                set_status(&mut registry, &model.name, ModelStatus::Deployed);
                let elapsed = elapsed_ms(started);
                tracing::info!(
                    tenant_id = %tenant_id,
                    model = %model.name,
                    rows = rows_affected.unwrap_or(0),
                    elapsed_ms = elapsed,
                    "model deployed"
                );
                results.push(ModelResult::succeeded(&model.name, rows_affected, elapsed));
            }
            Err(error) => {
                let mut message = options.redactor.redact(&error.to_string()).content;
                if let (Some(timeout), true) = (options.model_timeout, message.contains("timed out")) {
                    message = format!("model exceeded the {}s execution timeout", timeout.as_secs());
                }
                tracing::warn!(tenant_id = %tenant_id, model = %model.name, error = %message, "model failed");
                db.mark_model_failed(tenant_id, &model.name, &message, Utc::now())?;
                set_status(&mut registry, &model.name, ModelStatus::Error);
                results.push(ModelResult::failed(&model.name, message, elapsed_ms(started)));
            }
        }
    }

    Ok(results)
}

fn set_status(registry: &mut HashMap<String, crate::models::Model>, name: &str, status: ModelStatus) {
    if let Some(model) = registry.get_mut(name) {
        model.status = status;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
