use crate::models::TenantId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub tenant_id: TenantId,
    pub queued_at: DateTime<Utc>,
}

impl ScheduledRun {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            queued_at: Utc::now(),
        }
    }
}

type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Executor = Arc<dyn Fn(TenantId) -> ExecutorFuture + Send + Sync>;

/// FIFO queue of tenant pipeline runs. At most one run per tenant executes at
/// a time and at most `global_limit` tenants run concurrently. A tenant already
/// waiting in the queue is not queued twice.
#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<Mutex<VecDeque<ScheduledRun>>>,
    running_global: Arc<Mutex<usize>>,
    running_tenants: Arc<Mutex<HashMap<TenantId, usize>>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    global_limit: usize,
    per_tenant_limit: usize,
    max_queue_size: usize,
}

impl Scheduler {
    pub fn new(global_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            running_global: Arc::new(Mutex::new(0)),
            running_tenants: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            global_limit: global_limit.max(1),
            per_tenant_limit: 1,
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = match self.executor.write() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        *writer = Some(executor);
    }

    /// Returns `Ok(false)` when the tenant is already queued.
    pub async fn enqueue(&self, run: ScheduledRun) -> Result<bool, String> {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued.tenant_id == run.tenant_id) {
                return Ok(false);
            }
            if queue.len() >= self.max_queue_size {
                return Err(format!(
                    "Queue capacity exceeded (max {}).",
                    self.max_queue_size
                ));
            }
            queue.push_back(run);
        }
        self.notify.notify_one();
        Ok(true)
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            while let Some(run) = self.take_next_runnable().await {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    let waited_ms = (Utc::now() - run.queued_at).num_milliseconds().max(0);
                    tracing::debug!(tenant_id = %run.tenant_id, waited_ms, "starting scheduled pipeline run");
                    let succeeded = scheduler.execute(run.tenant_id).await;
                    scheduler.release_slot(run.tenant_id).await;
                    if !succeeded {
                        tracing::warn!(tenant_id = %run.tenant_id, "scheduled pipeline run did not succeed");
                    }
                    scheduler.notify.notify_one();
                });
            }
        }
    }

    async fn execute(&self, tenant_id: TenantId) -> bool {
        let executor = match self.executor.read() {
            Ok(reader) => reader.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match executor {
            Some(executor) => executor(tenant_id).await,
            None => false,
        }
    }

    /// Removes the oldest queued run whose tenant has a free slot and reserves
    /// that slot. Runs of a busy tenant keep their place in the queue.
    async fn take_next_runnable(&self) -> Option<ScheduledRun> {
        let mut queue = self.queue.lock().await;
        let mut global = self.running_global.lock().await;
        if *global >= self.global_limit {
            return None;
        }

        let mut tenant_map = self.running_tenants.lock().await;
        let index = queue.iter().position(|run| {
            tenant_map.get(&run.tenant_id).copied().unwrap_or(0) < self.per_tenant_limit
        })?;
        let run = queue.remove(index)?;

        *global += 1;
        *tenant_map.entry(run.tenant_id).or_insert(0) += 1;
        Some(run)
    }

    async fn release_slot(&self, tenant_id: TenantId) {
        let mut global = self.running_global.lock().await;
        if *global > 0 {
            *global -= 1;
        }

        let mut tenant_map = self.running_tenants.lock().await;
        if let Some(entry) = tenant_map.get_mut(&tenant_id) {
            if *entry > 0 {
                *entry -= 1;
            }
            if *entry == 0 {
                tenant_map.remove(&tenant_id);
            }
        }
    }
}
