use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::executor::ExecutionOptions;
use crate::ingest::sync_connector;
use crate::loader::register_models_from_dir;
use crate::models::{
    DependencyValidation, EngineSettings, Model, ModelDefinition, PeriodType, PipelineRunRecord, PipelineRunResult,
    SaveUserMetricPayload, SyncResult, TenantId, UserMetricDefinition,
};
use crate::oauth::{CredentialCipher, ProviderConnector, TokenManager};
use crate::pipeline::run_pipeline;
use crate::redaction::Redactor;
use crate::resolver::validate_dependencies;
use crate::scheduler::{ScheduledRun, Scheduler};
use crate::warehouse::Warehouse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};

const REGISTRY_FILE: &str = "registry.sqlite";
const WAREHOUSE_DIR: &str = "warehouse";

/// Process-wide entry point: owns the registry, the tenant warehouses, the
/// token manager and the run scheduler.
pub struct EngineCore {
    db: Arc<Database>,
    warehouse: Warehouse,
    tokens: TokenManager,
    scheduler: Scheduler,
    /// One lock per tenant; held for the whole of a pipeline run.
    run_locks: Mutex<HashMap<TenantId, Arc<Mutex<()>>>>,
    data_dir: PathBuf,
}

impl EngineCore {
    /// Production constructor; the credential key lives in the OS keyring.
    pub fn new(data_dir: PathBuf) -> AppResult<Arc<Self>> {
        Self::with_cipher(data_dir, CredentialCipher::from_keyring()?)
    }

    pub fn with_cipher(data_dir: PathBuf, cipher: CredentialCipher) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&data_dir.join(REGISTRY_FILE))?);
        let warehouse = Warehouse::new(&data_dir.join(WAREHOUSE_DIR))?;
        let settings = db.get_settings()?;
        let tokens = TokenManager::new(db.clone(), cipher, Redactor::new(settings.redact_aggressive));
        let scheduler = Scheduler::new(settings.scheduler_global_limit, settings.scheduler_max_queue);

        let this = Arc::new(Self {
            db,
            warehouse,
            tokens,
            scheduler: scheduler.clone(),
            run_locks: Mutex::new(HashMap::new()),
            data_dir,
        });

        if let Ok(interrupted) = this.db.mark_orphan_runs_interrupted() {
            if interrupted > 0 {
                tracing::warn!(count = interrupted, "marked orphaned pipeline runs as interrupted on startup");
            }
        }
        match this.db.prune_run_history(settings.run_history_retention_days) {
            Ok(pruned) if pruned > 0 => tracing::info!(count = pruned, "pruned old pipeline runs"),
            Ok(_) => {}
            Err(error) => tracing::warn!(error = %error, "run history pruning failed"),
        }

        let weak = Arc::downgrade(&this);
        scheduler.set_executor(Arc::new(move |tenant_id: TenantId| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(strong) => match strong.run_pipeline(tenant_id).await {
                        Ok(result) => result.success,
                        Err(error) => {
                            tracing::error!(tenant_id = %tenant_id, error = %error, "scheduled pipeline run errored");
                            false
                        }
                    },
                    None => false,
                }
            })
        }));

        Ok(this)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn start_scheduler(&self) {
        self.scheduler.start();
    }

    pub fn settings(&self) -> AppResult<EngineSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        self.db.update_settings(update)
    }

    // ─── Models ─────────────────────────────────────────────────────────────

    pub fn register_model(&self, definition: &ModelDefinition) -> AppResult<Model> {
        self.db.register_model(definition)
    }

    pub fn register_models_from_dir(&self, tenant_id: TenantId, dir: &Path) -> AppResult<Vec<Model>> {
        register_models_from_dir(&self.db, tenant_id, dir)
    }

    pub fn validate_dependencies(&self, tenant_id: TenantId) -> AppResult<DependencyValidation> {
        validate_dependencies(&self.db, tenant_id)
    }

    pub fn save_user_metric(&self, payload: SaveUserMetricPayload) -> AppResult<UserMetricDefinition> {
        self.db.save_user_metric(payload)
    }

    pub fn delete_user_metric(&self, tenant_id: TenantId, id: &str) -> AppResult<bool> {
        self.db.delete_user_metric(tenant_id, id)
    }

    // ─── Pipeline ───────────────────────────────────────────────────────────

    /// Runs the tenant pipeline synchronously on the calling thread.
    ///
    /// Runs of the same tenant are serialized: a call made while another run
    /// of that tenant is in flight waits for it to finish first.
    pub fn run_pipeline_blocking(&self, tenant_id: TenantId) -> AppResult<PipelineRunResult> {
        let tenant_lock = self.tenant_run_lock(tenant_id)?;
        let _guard = match tenant_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::info!(tenant_id = %tenant_id, "waiting for in-flight pipeline run of tenant");
                tenant_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let settings = self.db.get_settings()?;
        let options = ExecutionOptions::from_timeout_seconds(
            settings.model_timeout_seconds,
            Redactor::new(settings.redact_aggressive),
        );
        run_pipeline(&self.db, &self.warehouse, tenant_id, &options)
    }

    /// Runs the tenant pipeline on the blocking thread pool.
    pub async fn run_pipeline(self: &Arc<Self>, tenant_id: TenantId) -> AppResult<PipelineRunResult> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.run_pipeline_blocking(tenant_id))
            .await
            .map_err(|error| AppError::Internal(format!("pipeline task failed: {}", error)))?
    }

    fn tenant_run_lock(&self, tenant_id: TenantId) -> AppResult<Arc<Mutex<()>>> {
        let mut locks = self
            .run_locks
            .lock()
            .map_err(|_| AppError::Internal("run lock table poisoned".to_string()))?;
        Ok(locks.entry(tenant_id).or_default().clone())
    }

    /// Queues a background run. `Ok(false)` means the tenant was already queued.
    pub async fn enqueue_pipeline(&self, tenant_id: TenantId) -> AppResult<bool> {
        self.scheduler
            .enqueue(ScheduledRun::new(tenant_id))
            .await
            .map_err(AppError::Validation)
    }

    /// Queues a run for every tenant that has registered models.
    pub async fn enqueue_all_tenants(&self) -> AppResult<usize> {
        let mut queued = 0usize;
        for tenant_id in self.db.list_tenants_with_models()? {
            match self.enqueue_pipeline(tenant_id).await {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %error, "could not queue pipeline run");
                }
            }
        }
        Ok(queued)
    }

    pub fn list_pipeline_runs(&self, tenant_id: TenantId, limit: u32) -> AppResult<Vec<PipelineRunRecord>> {
        self.db.list_pipeline_runs(tenant_id, limit)
    }

    // ─── Ingest ─────────────────────────────────────────────────────────────

    pub async fn sync_connector(
        &self,
        tenant_id: TenantId,
        connector: &dyn ProviderConnector,
        entities: Option<&[String]>,
    ) -> SyncResult {
        sync_connector(&self.tokens, &self.warehouse, tenant_id, connector, entities).await
    }

    // ─── Reporting ──────────────────────────────────────────────────────────

    /// Rows of `core_metrics` for one period type. Empty when the tenant has
    /// not materialized the table yet.
    pub fn get_current_metrics(&self, tenant_id: TenantId, period: PeriodType) -> AppResult<Vec<serde_json::Value>> {
        self.read_core_table(tenant_id, "core_metrics", Some(period))
    }

    /// Rows of `core_user_metrics`, one per deployed user metric.
    pub fn get_user_defined_metrics(&self, tenant_id: TenantId) -> AppResult<Vec<serde_json::Value>> {
        self.read_core_table(tenant_id, "core_user_metrics", None)
    }

    fn read_core_table(
        &self,
        tenant_id: TenantId,
        table: &str,
        period: Option<PeriodType>,
    ) -> AppResult<Vec<serde_json::Value>> {
        if !self.warehouse.tenant_path(tenant_id).exists() {
            return Ok(Vec::new());
        }
        let session = self.warehouse.open_session(tenant_id)?;
        if !session.table_exists(table)? {
            return Ok(Vec::new());
        }

        let qualified = session.qualified(table)?;
        match period {
            Some(period) => session.query_json(
                &format!("SELECT * FROM {} WHERE period_type = ?1", qualified),
                &[&period.as_str()],
            ),
            None => session.query_json(&format!("SELECT * FROM {} ORDER BY metric_name ASC", qualified), &[]),
        }
    }
}
