use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Layer, Model, ModelDefinition, TenantId};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Optional `<name>.yml` next to a model's `.sql` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ModelSidecar {
    target_table: Option<String>,
    /// `true` runs the body as-is instead of materializing a table.
    statement_only: bool,
    execution_order: Option<i64>,
    dependencies: Vec<String>,
}

/// Registers every model found under `<dir>/{stg,int,core}/*.sql` for the
/// tenant. Files are visited in name order so repeated loads are stable.
pub fn register_models_from_dir(db: &Database, tenant_id: TenantId, dir: &Path) -> AppResult<Vec<Model>> {
    let mut registered = Vec::new();

    for layer in Layer::ALL {
        let layer_dir = dir.join(layer.as_str());
        if !layer_dir.is_dir() {
            continue;
        }

        let mut sql_files = fs::read_dir(&layer_dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("sql"))
            .collect::<Vec<_>>();
        sql_files.sort();

        for (position, path) in sql_files.iter().enumerate() {
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| AppError::Validation(format!("invalid model file name: {}", path.display())))?
                .to_string();

            let sidecar_path = path.with_extension("yml");
            let sidecar = if sidecar_path.is_file() {
                let raw = fs::read_to_string(&sidecar_path)?;
                if raw.trim().is_empty() {
                    ModelSidecar::default()
                } else {
                    serde_yaml::from_str::<ModelSidecar>(&raw).map_err(|error| {
                        AppError::Validation(format!("{}: {}", sidecar_path.display(), error))
                    })?
                }
            } else {
                ModelSidecar::default()
            };

            let target_table = if sidecar.statement_only {
                None
            } else {
                Some(sidecar.target_table.unwrap_or_else(|| name.clone()))
            };

            let model = db.register_model(&ModelDefinition {
                tenant_id,
                name,
                layer,
                query_body: fs::read_to_string(path)?,
                target_table,
                execution_order: sidecar.execution_order.unwrap_or(position as i64 * 10),
                dependencies: sidecar.dependencies,
            })?;
            registered.push(model);
        }
    }

    tracing::info!(tenant_id = %tenant_id, dir = %dir.display(), models = registered.len(), "registered models from directory");
    Ok(registered)
}
