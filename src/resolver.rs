use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{DependencyValidation, Model, ModelStatus, TenantId};
use std::collections::HashMap;

/// Problems with `model`'s declared dependencies, given every model of the
/// tenant keyed by name. Empty when all dependencies exist and are deployed.
pub fn dependency_errors(model: &Model, registry: &HashMap<String, Model>) -> Vec<String> {
    model
        .dependencies
        .iter()
        .filter_map(|dependency| match registry.get(dependency) {
            None => Some(format!(
                "model '{}' depends on '{}', which does not exist",
                model.name, dependency
            )),
            Some(upstream) if upstream.status != ModelStatus::Deployed => Some(format!(
                "model '{}' depends on '{}', which is not deployed (status: {})",
                model.name,
                dependency,
                upstream.status.as_str()
            )),
            Some(_) => None,
        })
        .collect()
}

/// Checks every dependency of every model of the tenant. Never mutates the
/// registry; validation problems are data, not errors.
pub fn validate_dependencies(db: &Database, tenant_id: TenantId) -> AppResult<DependencyValidation> {
    let models = db.list_models(tenant_id, None)?;
    let registry = models
        .iter()
        .map(|model| (model.name.clone(), model.clone()))
        .collect::<HashMap<_, _>>();

    let errors = models
        .iter()
        .flat_map(|model| dependency_errors(model, &registry))
        .collect::<Vec<_>>();

    Ok(DependencyValidation {
        valid: errors.is_empty(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::validate_dependencies;
    use crate::db::Database;
    use crate::models::{Layer, ModelDefinition, TenantId};
    use chrono::Utc;

    const TENANT: TenantId = TenantId(2);

    fn register(db: &Database, name: &str, layer: Layer, dependencies: &[&str]) {
        db.register_model(&ModelDefinition {
            tenant_id: TENANT,
            name: name.to_string(),
            layer,
            query_body: "SELECT 1 AS value".to_string(),
            target_table: Some(name.to_string()),
            execution_order: 0,
            dependencies: dependencies.iter().map(ToString::to_string).collect(),
        })
        .expect("register");
    }

    #[test]
    fn reports_missing_and_undeployed_dependencies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        register(&db, "stg_deals", Layer::Staging, &[]);
        register(&db, "int_pipeline", Layer::Intermediate, &["stg_deals", "stg_ghost"]);

        let validation = validate_dependencies(&db, TENANT).expect("validate");
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 2);
        assert!(validation.errors.iter().any(|error| error.contains("'stg_ghost', which does not exist")));
        assert!(validation.errors.iter().any(|error| error.contains("not deployed (status: draft)")));
    }

    #[test]
    fn valid_once_dependencies_are_deployed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("registry.db")).expect("db");

        register(&db, "stg_deals", Layer::Staging, &[]);
        register(&db, "int_pipeline", Layer::Intermediate, &["stg_deals"]);
        db.mark_model_deployed(TENANT, "stg_deals", Utc::now()).expect("deploy");

        let validation = validate_dependencies(&db, TENANT).expect("validate");
        assert!(validation.valid, "{:?}", validation.errors);

        let status_before = db.get_model(TENANT, "int_pipeline").expect("get").expect("model").status;
        validate_dependencies(&db, TENANT).expect("validate again");
        let status_after = db.get_model(TENANT, "int_pipeline").expect("get").expect("model").status;
        assert_eq!(status_before, status_after);
    }
}
