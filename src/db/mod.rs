use crate::aggregator::CORE_USER_METRICS_MODEL;
use crate::compiler::{METRIC_EXECUTION_ORDER_BASE, METRIC_MODEL_PREFIX};
use crate::errors::{AppError, AppResult};
use crate::models::{
    EngineSettings, Layer, Model, ModelDefinition, ModelStatus, PipelineRunRecord, PipelineRunResult, Provider,
    SaveUserMetricPayload, TenantId, UserMetricDefinition,
};
use crate::warehouse::validate_identifier;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const MODEL_COLUMNS: &str = "tenant_id, name, layer, query_body, target_table, execution_order,
     dependencies_json, status, deployed_at, last_refreshed_at, last_error, created_at, updated_at";

const USER_METRIC_COLUMNS: &str =
    "id, tenant_id, name, custom_query, category, format, yearly_goal, created_at, updated_at";

/// Credential row as persisted. Token columns hold ciphertext; decryption
/// happens in `TokenManager` (`oauth::token`).
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub provider_metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Shared registry database: models, user metric definitions, OAuth
/// credentials, run history and settings for every tenant.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Model Registry ─────────────────────────────────────────────────────

    /// Creates or updates the model keyed by `(tenant, name)`.
    ///
    /// New models start as `draft`. An existing model whose definition changed
    /// moves to `pending`; an identical re-registration keeps its status.
    /// Names and execution orders owned by compiled user metrics and the core
    /// aggregator are rejected.
    pub fn register_model(&self, definition: &ModelDefinition) -> AppResult<Model> {
        if definition.name.starts_with(METRIC_MODEL_PREFIX) || definition.name == CORE_USER_METRICS_MODEL {
            return Err(AppError::Validation(format!(
                "model name '{}' is reserved for generated metric models",
                definition.name
            )));
        }
        if definition.layer == Layer::Intermediate && definition.execution_order >= METRIC_EXECUTION_ORDER_BASE {
            return Err(AppError::Validation(format!(
                "INT model '{}' uses execution order {}; orders from {} are reserved for compiled metrics",
                definition.name, definition.execution_order, METRIC_EXECUTION_ORDER_BASE
            )));
        }
        self.register_generated_model(definition)
    }

    /// `register_model` without the reserved-name checks, for the metric
    /// compiler and the core aggregator.
    pub(crate) fn register_generated_model(&self, definition: &ModelDefinition) -> AppResult<Model> {
        validate_identifier(&definition.name)?;
        if let Some(target) = &definition.target_table {
            validate_identifier(target)?;
        }
        if definition.query_body.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "model '{}' has an empty query body",
                definition.name
            )));
        }

        let now = Utc::now();
        let dependencies_json = serde_json::to_string(&definition.dependencies)?;

        let conn = self.lock()?;
        let existing = conn
            .query_row(
                &format!("SELECT {MODEL_COLUMNS} FROM models WHERE tenant_id = ?1 AND name = ?2"),
                params![definition.tenant_id.0, definition.name],
                parse_model_row,
            )
            .optional()?;

        match existing {
            Some(current) => {
                let changed = current.layer != definition.layer
                    || current.query_body != definition.query_body
                    || current.target_table != definition.target_table
                    || current.execution_order != definition.execution_order
                    || current.dependencies != definition.dependencies;
                let status = if changed { ModelStatus::Pending } else { current.status };

                conn.execute(
                    "UPDATE models SET layer = ?1, layer_rank = ?2, query_body = ?3, target_table = ?4,
                     execution_order = ?5, dependencies_json = ?6, status = ?7, updated_at = ?8
                     WHERE tenant_id = ?9 AND name = ?10",
                    params![
                        definition.layer.as_str(),
                        definition.layer.rank(),
                        definition.query_body,
                        definition.target_table,
                        definition.execution_order,
                        dependencies_json,
                        status.as_str(),
                        now.to_rfc3339(),
                        definition.tenant_id.0,
                        definition.name,
                    ],
                )?;

                Ok(Model {
                    layer: definition.layer,
                    query_body: definition.query_body.clone(),
                    target_table: definition.target_table.clone(),
                    execution_order: definition.execution_order,
                    dependencies: definition.dependencies.clone(),
                    status,
                    updated_at: now,
                    ..current
                })
            }
            None => {
                conn.execute(
                    "INSERT INTO models (tenant_id, name, layer, layer_rank, query_body, target_table,
                     execution_order, dependencies_json, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    params![
                        definition.tenant_id.0,
                        definition.name,
                        definition.layer.as_str(),
                        definition.layer.rank(),
                        definition.query_body,
                        definition.target_table,
                        definition.execution_order,
                        dependencies_json,
                        ModelStatus::Draft.as_str(),
                        now.to_rfc3339(),
                    ],
                )?;

                Ok(Model {
                    tenant_id: definition.tenant_id,
                    name: definition.name.clone(),
                    layer: definition.layer,
                    query_body: definition.query_body.clone(),
                    target_table: definition.target_table.clone(),
                    execution_order: definition.execution_order,
                    dependencies: definition.dependencies.clone(),
                    status: ModelStatus::Draft,
                    deployed_at: None,
                    last_refreshed_at: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                })
            }
        }
    }

    pub fn get_model(&self, tenant_id: TenantId, name: &str) -> AppResult<Option<Model>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {MODEL_COLUMNS} FROM models WHERE tenant_id = ?1 AND name = ?2"),
            params![tenant_id.0, name],
            parse_model_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Models ordered by `(execution_order, layer, name)`.
    pub fn list_models(&self, tenant_id: TenantId, layer: Option<Layer>) -> AppResult<Vec<Model>> {
        let conn = self.lock()?;
        let mut result = Vec::new();
        match layer {
            Some(layer) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MODEL_COLUMNS} FROM models WHERE tenant_id = ?1 AND layer = ?2
                     ORDER BY execution_order ASC, layer_rank ASC, name ASC"
                ))?;
                let rows = stmt.query_map(params![tenant_id.0, layer.as_str()], parse_model_row)?;
                for row in rows {
                    result.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MODEL_COLUMNS} FROM models WHERE tenant_id = ?1
                     ORDER BY execution_order ASC, layer_rank ASC, name ASC"
                ))?;
                let rows = stmt.query_map(params![tenant_id.0], parse_model_row)?;
                for row in rows {
                    result.push(row?);
                }
            }
        }
        Ok(result)
    }

    pub fn mark_model_deployed(&self, tenant_id: TenantId, name: &str, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.lock()?;
        let now = at.to_rfc3339();
        conn.execute(
            "UPDATE models SET status = ?1, deployed_at = ?2, last_refreshed_at = ?2, last_error = NULL,
             updated_at = ?2 WHERE tenant_id = ?3 AND name = ?4",
            params![ModelStatus::Deployed.as_str(), now, tenant_id.0, name],
        )?;
        Ok(())
    }

    pub fn mark_model_failed(
        &self,
        tenant_id: TenantId,
        name: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.lock()?;
        let now = at.to_rfc3339();
        conn.execute(
            "UPDATE models SET status = ?1, last_refreshed_at = ?2, last_error = ?3, updated_at = ?2
             WHERE tenant_id = ?4 AND name = ?5",
            params![ModelStatus::Error.as_str(), now, error_message, tenant_id.0, name],
        )?;
        Ok(())
    }

    pub fn delete_model(&self, tenant_id: TenantId, name: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM models WHERE tenant_id = ?1 AND name = ?2",
            params![tenant_id.0, name],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_models_with_prefix(&self, tenant_id: TenantId, prefix: &str) -> AppResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM models WHERE tenant_id = ?1 AND substr(name, 1, length(?2)) = ?2",
            params![tenant_id.0, prefix],
        )?;
        Ok(changed)
    }

    pub fn list_tenants_with_models(&self) -> AppResult<Vec<TenantId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT tenant_id FROM models ORDER BY tenant_id ASC")?;
        let rows = stmt.query_map([], |row| Ok(TenantId(row.get(0)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ─── User Metric Definitions ────────────────────────────────────────────

    pub fn save_user_metric(&self, payload: SaveUserMetricPayload) -> AppResult<UserMetricDefinition> {
        if payload.name.trim().is_empty() {
            return Err(AppError::Validation("metric name cannot be empty".to_string()));
        }

        let now = Utc::now();
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let category = payload.category.unwrap_or_else(|| "custom".to_string());
        let format = payload.format.unwrap_or_else(|| "number".to_string());
        let yearly_goal = payload.yearly_goal.unwrap_or(0.0);

        let conn = self.lock()?;
        let existing = conn
            .query_row(
                "SELECT tenant_id, created_at FROM user_metric_definitions WHERE id = ?1",
                [id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let not_found = || {
            AppError::NotFound(format!(
                "user metric {} does not exist for tenant {}",
                id, payload.tenant_id
            ))
        };
        let created_at = match existing {
            Some((owner, _)) if owner != payload.tenant_id.0 => return Err(not_found()),
            Some((_, created_at)) => Some(created_at),
            None => None,
        };

        match &created_at {
            Some(_) => {
                let changed = conn.execute(
                    "UPDATE user_metric_definitions SET name = ?1, custom_query = ?2, category = ?3,
                     format = ?4, yearly_goal = ?5, updated_at = ?6 WHERE id = ?7 AND tenant_id = ?8",
                    params![
                        payload.name,
                        payload.custom_query,
                        category,
                        format,
                        yearly_goal,
                        now.to_rfc3339(),
                        id,
                        payload.tenant_id.0,
                    ],
                )?;
                if changed == 0 {
                    return Err(not_found());
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO user_metric_definitions (id, tenant_id, name, custom_query, category,
                     format, yearly_goal, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        id,
                        payload.tenant_id.0,
                        payload.name,
                        payload.custom_query,
                        category,
                        format,
                        yearly_goal,
                        now.to_rfc3339(),
                    ],
                )?;
            }
        }

        let created_at = created_at
            .map(|raw| parse_time(&raw))
            .transpose()?
            .unwrap_or(now);

        Ok(UserMetricDefinition {
            id,
            tenant_id: payload.tenant_id,
            name: payload.name,
            custom_query: payload.custom_query,
            category,
            format,
            yearly_goal,
            created_at,
            updated_at: now,
        })
    }

    pub fn list_user_metrics(&self, tenant_id: TenantId) -> AppResult<Vec<UserMetricDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_METRIC_COLUMNS} FROM user_metric_definitions WHERE tenant_id = ?1 ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map([tenant_id.0], parse_user_metric_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Definitions carrying a non-empty custom query.
    pub fn list_compilable_user_metrics(&self, tenant_id: TenantId) -> AppResult<Vec<UserMetricDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_METRIC_COLUMNS} FROM user_metric_definitions
             WHERE tenant_id = ?1 AND custom_query IS NOT NULL AND TRIM(custom_query) <> ''
             ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map([tenant_id.0], parse_user_metric_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_user_metric(&self, tenant_id: TenantId, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM user_metric_definitions WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id.0, id],
        )?;
        Ok(changed > 0)
    }

    // ─── OAuth Credentials ──────────────────────────────────────────────────

    /// Upserts the single live credential for `(tenant, provider)`.
    pub fn upsert_credential(&self, credential: &StoredCredential) -> AppResult<()> {
        let conn = self.lock()?;
        let now = credential.updated_at.to_rfc3339();
        conn.execute(
            "INSERT INTO oauth_credentials (tenant_id, provider, access_token_ciphertext,
             refresh_token_ciphertext, expires_at, provider_metadata_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(tenant_id, provider) DO UPDATE SET
               access_token_ciphertext = excluded.access_token_ciphertext,
               refresh_token_ciphertext = excluded.refresh_token_ciphertext,
               expires_at = excluded.expires_at,
               provider_metadata_json = excluded.provider_metadata_json,
               updated_at = excluded.updated_at",
            params![
                credential.tenant_id.0,
                credential.provider.as_str(),
                credential.access_token_ciphertext,
                credential.refresh_token_ciphertext,
                credential.expires_at.map(|at| at.to_rfc3339()),
                serde_json::to_string(&credential.provider_metadata)?,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_credential(&self, tenant_id: TenantId, provider: Provider) -> AppResult<Option<StoredCredential>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT tenant_id, provider, access_token_ciphertext, refresh_token_ciphertext, expires_at,
             provider_metadata_json, updated_at
             FROM oauth_credentials WHERE tenant_id = ?1 AND provider = ?2",
            params![tenant_id.0, provider.as_str()],
            parse_credential_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn delete_credential(&self, tenant_id: TenantId, provider: Provider) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM oauth_credentials WHERE tenant_id = ?1 AND provider = ?2",
            params![tenant_id.0, provider.as_str()],
        )?;
        Ok(changed > 0)
    }

    // ─── Pipeline Run History ───────────────────────────────────────────────

    pub fn insert_pipeline_run(&self, run_id: &str, tenant_id: TenantId, started_at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pipeline_runs (id, tenant_id, status, started_at) VALUES (?1, ?2, 'running', ?3)",
            params![run_id, tenant_id.0, started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn complete_pipeline_run(&self, result: &PipelineRunResult) -> AppResult<()> {
        let conn = self.lock()?;
        let status = if result.success { "succeeded" } else { "failed" };
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, final_state = ?2, ended_at = ?3, total_time_ms = ?4,
             results_json = ?5 WHERE id = ?6",
            params![
                status,
                result.final_state.as_str(),
                Utc::now().to_rfc3339(),
                result.total_time_ms as i64,
                serde_json::to_string(&result.results)?,
                result.run_id,
            ],
        )?;
        Ok(())
    }

    pub fn list_pipeline_runs(&self, tenant_id: TenantId, limit: u32) -> AppResult<Vec<PipelineRunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, status, final_state, started_at, ended_at, total_time_ms, results_json
             FROM pipeline_runs WHERE tenant_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant_id.0, limit], parse_pipeline_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Runs left `running` by a previous process can never finish.
    pub fn mark_orphan_runs_interrupted(&self) -> AppResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE pipeline_runs SET status = 'interrupted', ended_at = ?1 WHERE status = 'running'",
            [Utc::now().to_rfc3339()],
        )?;
        Ok(changed as u64)
    }

    pub fn prune_run_history(&self, retention_days: u32) -> AppResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM pipeline_runs WHERE started_at < ?1 AND status <> 'running'",
            [cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> AppResult<EngineSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'engine'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<EngineSettings>(&raw).unwrap_or_default()),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: EngineSettings = serde_json::from_value(merged)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('engine', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'engine'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('engine', ?1, ?2)",
                params![
                    serde_json::to_string(&EngineSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

fn parse_model_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Model> {
    Ok(Model {
        tenant_id: TenantId(row.get(0)?),
        name: row.get(1)?,
        layer: parse_layer(&row.get::<_, String>(2)?)?,
        query_body: row.get(3)?,
        target_table: row.get(4)?,
        execution_order: row.get(5)?,
        dependencies: serde_json::from_str::<Vec<String>>(&row.get::<_, String>(6)?).unwrap_or_default(),
        status: ModelStatus::parse(&row.get::<_, String>(7)?).unwrap_or(ModelStatus::Error),
        deployed_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        last_refreshed_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        last_error: row.get(10)?,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
        updated_at: parse_time(&row.get::<_, String>(12)?)?,
    })
}

fn parse_user_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserMetricDefinition> {
    Ok(UserMetricDefinition {
        id: row.get(0)?,
        tenant_id: TenantId(row.get(1)?),
        name: row.get(2)?,
        custom_query: row.get(3)?,
        category: row.get(4)?,
        format: row.get(5)?,
        yearly_goal: row.get(6)?,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_credential_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredCredential> {
    Ok(StoredCredential {
        tenant_id: TenantId(row.get(0)?),
        provider: parse_provider(&row.get::<_, String>(1)?)?,
        access_token_ciphertext: row.get(2)?,
        refresh_token_ciphertext: row.get(3)?,
        expires_at: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        provider_metadata: serde_json::from_str::<serde_json::Value>(&row.get::<_, String>(5)?)
            .unwrap_or(serde_json::json!({})),
        updated_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn parse_pipeline_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRunRecord> {
    Ok(PipelineRunRecord {
        id: row.get(0)?,
        tenant_id: TenantId(row.get(1)?),
        status: row.get(2)?,
        final_state: row.get(3)?,
        started_at: parse_time(&row.get::<_, String>(4)?)?,
        ended_at: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        total_time_ms: row.get(6)?,
        results: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
    })
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_layer(raw: &str) -> rusqlite::Result<Layer> {
    Layer::parse(raw).ok_or_else(|| conversion_error(format!("Unknown layer '{}'", raw)))
}

fn parse_provider(raw: &str) -> rusqlite::Result<Provider> {
    Provider::parse(raw).ok_or_else(|| conversion_error(format!("Unknown provider '{}'", raw)))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Database, StoredCredential};
    use crate::models::{
        Layer, ModelDefinition, ModelStatus, PipelineRunResult, PipelineState, Provider, SaveUserMetricPayload,
        TenantId,
    };
    use chrono::Utc;

    const TENANT: TenantId = TenantId(7);

    fn definition(name: &str, layer: Layer, order: i64) -> ModelDefinition {
        ModelDefinition {
            tenant_id: TENANT,
            name: name.to_string(),
            layer,
            query_body: format!("SELECT 1 AS value -- {name}"),
            target_table: Some(name.to_string()),
            execution_order: order,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn register_model_upserts_without_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        let created = db
            .register_model(&definition("stg_deals", Layer::Staging, 10))
            .expect("register");
        assert_eq!(created.status, ModelStatus::Draft);

        db.mark_model_deployed(TENANT, "stg_deals", Utc::now()).expect("deploy");
        let unchanged = db
            .register_model(&definition("stg_deals", Layer::Staging, 10))
            .expect("re-register");
        assert_eq!(unchanged.status, ModelStatus::Deployed);

        let mut changed = definition("stg_deals", Layer::Staging, 10);
        changed.query_body = "SELECT 2 AS value".to_string();
        let updated = db.register_model(&changed).expect("update");
        assert_eq!(updated.status, ModelStatus::Pending);
        assert_eq!(updated.query_body, "SELECT 2 AS value");

        let models = db.list_models(TENANT, None).expect("list");
        assert_eq!(models.len(), 1);
        assert!(models[0].deployed_at.is_some());
    }

    #[test]
    fn list_models_orders_by_execution_order_then_layer_then_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        db.register_model(&definition("core_revenue", Layer::Core, 5)).expect("core");
        db.register_model(&definition("stg_b", Layer::Staging, 5)).expect("stg b");
        db.register_model(&definition("stg_a", Layer::Staging, 5)).expect("stg a");
        db.register_model(&definition("int_seed", Layer::Intermediate, 1)).expect("int");

        let names = db
            .list_models(TENANT, None)
            .expect("list")
            .into_iter()
            .map(|model| model.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["int_seed", "stg_a", "stg_b", "core_revenue"]);

        let staging = db.list_models(TENANT, Some(Layer::Staging)).expect("list stg");
        assert_eq!(staging.len(), 2);
        assert!(db.list_models(TenantId(8), None).expect("other tenant").is_empty());
    }

    #[test]
    fn register_model_rejects_unsafe_identifiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        let mut bad = definition("stg_deals", Layer::Staging, 0);
        bad.target_table = Some("deals; DROP TABLE models".to_string());
        assert!(db.register_model(&bad).is_err());
    }

    #[test]
    fn delete_models_with_prefix_only_touches_matching_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        db.register_generated_model(&definition("int_metric_mrr", Layer::Intermediate, 1000)).expect("metric");
        db.register_model(&definition("int_metrics_rollup", Layer::Intermediate, 10)).expect("rollup");

        let deleted = db.delete_models_with_prefix(TENANT, "int_metric_").expect("delete");
        assert_eq!(deleted, 1);
        assert!(db.get_model(TENANT, "int_metrics_rollup").expect("get").is_some());
    }

    #[test]
    fn compilable_user_metrics_skip_blank_queries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        for (name, query) in [("Revenue", Some("SELECT 1 AS value")), ("Blank", Some("   ")), ("None", None)] {
            db.save_user_metric(SaveUserMetricPayload {
                id: None,
                tenant_id: TENANT,
                name: name.to_string(),
                custom_query: query.map(ToString::to_string),
                category: None,
                format: None,
                yearly_goal: Some(100.0),
            })
            .expect("save metric");
        }

        let compilable = db.list_compilable_user_metrics(TENANT).expect("list");
        assert_eq!(compilable.len(), 1);
        assert_eq!(compilable[0].name, "Revenue");
        assert_eq!(db.list_user_metrics(TENANT).expect("all").len(), 3);
    }

    #[test]
    fn credential_upsert_keeps_one_row_per_tenant_provider() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        let mut credential = StoredCredential {
            tenant_id: TENANT,
            provider: Provider::Zoho,
            access_token_ciphertext: "first".to_string(),
            refresh_token_ciphertext: Some("refresh".to_string()),
            expires_at: None,
            provider_metadata: serde_json::json!({ "datacenter": "eu" }),
            updated_at: Utc::now(),
        };
        db.upsert_credential(&credential).expect("insert");
        credential.access_token_ciphertext = "second".to_string();
        db.upsert_credential(&credential).expect("update");

        let stored = db.get_credential(TENANT, Provider::Zoho).expect("get").expect("exists");
        assert_eq!(stored.access_token_ciphertext, "second");
        assert_eq!(stored.provider_metadata["datacenter"], "eu");
        assert!(db.get_credential(TENANT, Provider::Hubspot).expect("get").is_none());
    }

    #[test]
    fn pipeline_runs_are_recorded_and_orphans_interrupted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        db.insert_pipeline_run("run-1", TENANT, Utc::now()).expect("insert");
        db.complete_pipeline_run(&PipelineRunResult {
            run_id: "run-1".to_string(),
            tenant_id: TENANT,
            success: true,
            final_state: PipelineState::Succeeded,
            results: Vec::new(),
            total_time_ms: 12,
        })
        .expect("complete");
        db.insert_pipeline_run("run-2", TENANT, Utc::now()).expect("insert orphan");

        assert_eq!(db.mark_orphan_runs_interrupted().expect("interrupt"), 1);
        let runs = db.list_pipeline_runs(TENANT, 10).expect("list");
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|run| run.status == "succeeded" && run.total_time_ms == Some(12)));
        assert!(runs.iter().any(|run| run.status == "interrupted"));
    }

    #[test]
    fn settings_merge_partial_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        let updated = db
            .update_settings(serde_json::json!({ "modelTimeoutSeconds": 5 }))
            .expect("update");
        assert_eq!(updated.model_timeout_seconds, 5);
        assert_eq!(db.get_settings().expect("get").scheduler_global_limit, 4);
    }

    #[test]
    fn save_user_metric_rejects_an_id_owned_by_another_tenant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");
        let payload = |tenant_id: TenantId, id: Option<String>, name: &str| SaveUserMetricPayload {
            id,
            tenant_id,
            name: name.to_string(),
            custom_query: Some("SELECT 1 AS value".to_string()),
            category: None,
            format: None,
            yearly_goal: None,
        };

        let original = db.save_user_metric(payload(TenantId(1), None, "A")).expect("save A");
        let error = db
            .save_user_metric(payload(TenantId(2), Some(original.id.clone()), "B"))
            .expect_err("foreign id");
        assert!(error.to_string().starts_with("NOT_FOUND:"));

        assert!(db.list_user_metrics(TenantId(2)).expect("tenant 2").is_empty());
        let kept = db.list_user_metrics(TenantId(1)).expect("tenant 1");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "A");

        let renamed = db
            .save_user_metric(payload(TenantId(1), Some(original.id.clone()), "A2"))
            .expect("owner update");
        assert_eq!(renamed.created_at, original.created_at);
        assert_eq!(db.list_user_metrics(TenantId(1)).expect("tenant 1")[0].name, "A2");
    }

    #[test]
    fn register_model_rejects_reserved_names_and_orders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        for reserved in [
            definition("int_metric_mrr", Layer::Intermediate, 10),
            definition("core_user_metrics", Layer::Core, 0),
            definition("int_late_rollup", Layer::Intermediate, 1000),
        ] {
            let error = db.register_model(&reserved).expect_err("reserved");
            assert!(error.to_string().starts_with("VALIDATION:"), "{}", error);
            assert!(db.get_model(TENANT, &reserved.name).expect("get").is_none());
        }

        db.register_model(&definition("core_late_rollup", Layer::Core, 1000))
            .expect("high orders are only reserved in INT");
        db.register_generated_model(&definition("int_metric_mrr", Layer::Intermediate, 1000))
            .expect("generated metric");
    }
}
