//! Cron-driven tenant jobs.
//!
//! The live registry maps job ids to scheduler handles and only exists in this
//! process. It is rebuilt from the `job` table at startup and re-synced whenever
//! a job row changes.

pub mod maintenance;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::auth::Identity;
use crate::core::config::OverlapPolicy;
use crate::core::error::{CoreError, CoreResult};
use crate::core::executor::{self, ContextVars, to_marker_text};
use crate::core::store::SystemStore;
use crate::core::store::types::{JobRecord, JobStatus};
use crate::core::tenant::TenantRegistry;

pub const SQL_MODE: &str = "sql";

/// Adds the leading seconds field to classic 5-field expressions.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Runs one invocation of a `sql` job in its own transaction.
///
/// With a loop script, every driver row becomes the `$i` markers of one run of the
/// main script. Returns how many times the main script ran.
pub async fn run_job(tenants: &TenantRegistry, job: &JobRecord) -> CoreResult<usize> {
    let mut tx = tenants.begin(&job.project_id).await?;
    let vars = ContextVars::for_caller(&Identity::system(&job.project_id), None);
    let once = [Vec::new()];

    let runs = match &job.loop_script {
        Some(driver) => {
            let drivers = executor::query_batch(&mut tx, driver, &[], &[], &vars, None)?;
            for row in &drivers.rows {
                let markers: Vec<String> = row.iter().map(to_marker_text).collect();
                executor::execute_batch(&mut tx, &job.script, &markers, &once, &vars)?;
            }
            drivers.rows.len()
        }
        None => {
            executor::execute_batch(&mut tx, &job.script, &[], &once, &vars)?;
            1
        }
    };
    tx.commit()?;
    Ok(runs)
}

/// Runs `fut` on its own task so a panic stays inside that invocation.
pub async fn guarded<F>(label: &str, fut: F)
where
    F: Future<Output = CoreResult<()>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(Ok(())) => debug!("Job '{}' finished", label),
        Ok(Err(e)) => error!("Job '{}' failed: {}", label, e),
        Err(e) if e.is_panic() => error!("Job '{}' panicked; scheduler keeps running", label),
        Err(e) => warn!("Job '{}' was cancelled: {}", label, e),
    }
}

/// Per-job overlap control. Under `Skip` only one run of a job is active at a time.
#[derive(Clone)]
pub struct RunGate {
    lock: Option<Arc<Mutex<()>>>,
}

/// Held for the duration of one run.
pub struct GatePass {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl RunGate {
    pub fn new(policy: OverlapPolicy) -> Self {
        let lock = match policy {
            OverlapPolicy::Skip => Some(Arc::new(Mutex::new(()))),
            OverlapPolicy::Allow => None,
        };
        Self { lock }
    }

    /// `None` while the previous run still holds the gate.
    pub fn enter(&self) -> Option<GatePass> {
        match &self.lock {
            None => Some(GatePass { _guard: None }),
            Some(lock) => lock
                .clone()
                .try_lock_owned()
                .ok()
                .map(|guard| GatePass { _guard: Some(guard) }),
        }
    }
}

/// Wraps `tokio_cron_scheduler::JobScheduler` with a job-id keyed handle registry.
pub struct JobScheduler {
    inner: tokio_cron_scheduler::JobScheduler,
    handles: Mutex<HashMap<String, Uuid>>,
    gates: Mutex<HashMap<String, RunGate>>,
    store: SystemStore,
    tenants: Arc<TenantRegistry>,
    overlap: OverlapPolicy,
}

impl JobScheduler {
    pub async fn new(
        store: SystemStore,
        tenants: Arc<TenantRegistry>,
        overlap: OverlapPolicy,
    ) -> CoreResult<Self> {
        let inner = tokio_cron_scheduler::JobScheduler::new()
            .await
            .map_err(|e| CoreError::Schedule(e.to_string()))?;
        Ok(Self {
            inner,
            handles: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            store,
            tenants,
            overlap,
        })
    }

    pub async fn start(&self) -> CoreResult<()> {
        self.inner
            .start()
            .await
            .map_err(|e| CoreError::Schedule(e.to_string()))
    }

    pub async fn shutdown(&self) -> CoreResult<()> {
        let mut inner = self.inner.clone();
        inner
            .shutdown()
            .await
            .map_err(|e| CoreError::Schedule(e.to_string()))
    }

    /// Registers a tenant job, replacing any handle it already had.
    pub async fn start_job(&self, job: &JobRecord) -> CoreResult<()> {
        if job.mode != SQL_MODE {
            return Err(CoreError::Schedule(format!(
                "Unsupported job mode '{}' for job {}",
                job.mode, job.id
            )));
        }
        let cron = normalize_cron(&job.cron);
        let label = format!("{}:{}", job.project_id, job.id);
        let gate = self.gate_for(&job.id).await;
        let tenants = self.tenants.clone();
        let definition = Arc::new(job.clone());

        let handle = self
            .add_task(&cron, label.clone(), gate, move || {
                let tenants = tenants.clone();
                let definition = definition.clone();
                async move { run_job(&tenants, &definition).await.map(|_| ()) }
            })
            .await?;

        let previous = self.handles.lock().await.insert(job.id.clone(), handle);
        if let Some(previous) = previous {
            if let Err(e) = self.inner.remove(&previous).await {
                warn!("Failed to remove previous handle of job {}: {}", job.id, e);
            }
        }
        info!("Registered job '{}' ({}) with cron '{}'", job.name, label, cron);
        Ok(())
    }

    /// Deregisters a job. Returns false when it was not registered.
    pub async fn stop_job(&self, id: &str) -> CoreResult<bool> {
        let Some(handle) = self.handles.lock().await.remove(id) else {
            return Ok(false);
        };
        self.inner
            .remove(&handle)
            .await
            .map_err(|e| CoreError::Schedule(e.to_string()))?;
        info!("Stopped job {}", id);
        Ok(true)
    }

    /// Brings the live handle in line with the persisted row.
    pub async fn sync_job(&self, id: &str) -> CoreResult<()> {
        match self.store.find_job(id).await? {
            Some(job) if job.status == JobStatus::Running => self.start_job(&job).await,
            _ => self.stop_job(id).await.map(|_| ()),
        }
    }

    /// Registers every persisted running job. A job that fails to register is logged and skipped.
    pub async fn load_persisted(&self) -> CoreResult<usize> {
        let mut loaded = 0;
        for job in self.store.list_jobs(Some(JobStatus::Running)).await? {
            match self.start_job(&job).await {
                Ok(()) => loaded += 1,
                Err(e) => error!("Failed to register job {}: {}", job.id, e),
            }
        }
        info!("Loaded {} persisted jobs", loaded);
        Ok(loaded)
    }

    /// The gate outlives re-registrations so a run in flight still blocks the next tick.
    pub async fn gate_for(&self, id: &str) -> RunGate {
        self.gates
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| RunGate::new(self.overlap))
            .clone()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.handles.lock().await.contains_key(id)
    }

    pub async fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registers an internal task that is not backed by a `job` row.
    pub async fn schedule_task<F, Fut>(&self, name: &str, cron: &str, task: F) -> CoreResult<Uuid>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let cron = normalize_cron(cron);
        let handle = self
            .add_task(&cron, name.to_string(), RunGate::new(OverlapPolicy::Skip), task)
            .await?;
        info!("Registered task '{}' with cron '{}'", name, cron);
        Ok(handle)
    }

    async fn add_task<F, Fut>(&self, cron: &str, label: String, gate: RunGate, task: F) -> CoreResult<Uuid>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let task = Arc::new(task);
        let cron_job = tokio_cron_scheduler::Job::new_async(cron, move |_uuid, _lock| {
            let task = task.clone();
            let gate = gate.clone();
            let label = label.clone();
            Box::pin(async move {
                let Some(_pass) = gate.enter() else {
                    info!("Skipping tick of '{}': previous run still active", label);
                    return;
                };
                guarded(&label, task()).await;
            })
        })
        .map_err(|e| CoreError::Schedule(format!("Invalid cron expression '{}': {}", cron, e)))?;

        self.inner
            .add(cron_job)
            .await
            .map_err(|e| CoreError::Schedule(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use rusqlite::Connection;

    fn sql_job(id: &str, script: &str, loop_script: Option<&str>) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            project_id: "p1".to_string(),
            name: format!("job {}", id),
            mode: SQL_MODE.to_string(),
            cron: "0 0 0 1 1 *".to_string(),
            script: script.to_string(),
            loop_script: loop_script.map(String::from),
            status: JobStatus::Running,
        }
    }

    async fn tenants_with(setup: &str) -> (Arc<TenantRegistry>, SystemStore, Arc<Mutex<Connection>>, tempfile::TempDir) {
        let (store, dir) = test_store().await;
        let tenants = Arc::new(TenantRegistry::new(store.clone(), dir.path().join("tenants")));
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(setup).unwrap();
        let db = Arc::new(Mutex::new(conn));
        tenants.register("p1", db.clone()).await;
        (tenants, store, db, dir)
    }

    #[test]
    fn five_field_cron_gets_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron(" 0 30 * * * * "), "0 30 * * * *");
    }

    #[tokio::test]
    async fn loop_script_drives_one_run_per_row() {
        let (tenants, _store, db, _dir) = tenants_with(
            "CREATE TABLE src (name TEXT, qty INTEGER);
             INSERT INTO src VALUES ('a', 1), ('b', 2);
             CREATE TABLE dst (name TEXT, qty INTEGER);",
        )
        .await;
        let job = sql_job(
            "j1",
            "INSERT INTO dst VALUES ('$0', $1)",
            Some("SELECT name, qty FROM src ORDER BY name"),
        );
        assert_eq!(run_job(&tenants, &job).await.unwrap(), 2);

        let conn = db.lock().await;
        let total: i64 = conn.query_row("SELECT SUM(qty) FROM dst", [], |r| r.get(0)).unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn failing_row_rolls_back_the_whole_run() {
        let (tenants, _store, db, _dir) = tenants_with(
            "CREATE TABLE src (name TEXT);
             INSERT INTO src VALUES ('a'), ('b');
             CREATE TABLE dst (name TEXT UNIQUE);
             INSERT INTO dst VALUES ('b');",
        )
        .await;
        let job = sql_job("j1", "INSERT INTO dst VALUES ('$0')", Some("SELECT name FROM src ORDER BY name"));
        assert!(run_job(&tenants, &job).await.is_err());

        let conn = db.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dst", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn skip_gate_admits_one_run_at_a_time() {
        let gate = RunGate::new(OverlapPolicy::Skip);
        let first = gate.enter();
        assert!(first.is_some());
        assert!(gate.enter().is_none());
        drop(first);
        assert!(gate.enter().is_some());

        let open = RunGate::new(OverlapPolicy::Allow);
        let _a = open.enter().unwrap();
        assert!(open.enter().is_some());
    }

    #[tokio::test]
    async fn panics_stay_inside_the_invocation() {
        let boom = async {
            let fail = true;
            if fail {
                panic!("job blew up");
            }
            Ok(())
        };
        guarded("boom", boom).await;
        guarded("fine", async { Ok(()) }).await;
    }

    #[tokio::test]
    async fn register_replace_and_stop() {
        let (tenants, store, _db, _dir) = tenants_with("CREATE TABLE t (x);").await;
        let scheduler = JobScheduler::new(store, tenants, OverlapPolicy::Skip).await.unwrap();
        let job = sql_job("j1", "SELECT 1", None);

        scheduler.start_job(&job).await.unwrap();
        scheduler.start_job(&job).await.unwrap();
        assert_eq!(scheduler.registered().await, vec!["j1"]);

        assert!(scheduler.stop_job("j1").await.unwrap());
        assert!(!scheduler.stop_job("j1").await.unwrap());
        assert!(!scheduler.is_registered("j1").await);
    }

    #[tokio::test]
    async fn rejects_bad_cron_and_unknown_modes() {
        let (tenants, store, _db, _dir) = tenants_with("CREATE TABLE t (x);").await;
        let scheduler = JobScheduler::new(store, tenants, OverlapPolicy::Skip).await.unwrap();

        let mut bad_cron = sql_job("j1", "SELECT 1", None);
        bad_cron.cron = "every tuesday".into();
        assert!(matches!(scheduler.start_job(&bad_cron).await, Err(CoreError::Schedule(_))));

        let mut other = sql_job("j2", "SELECT 1", None);
        other.mode = "http".into();
        assert!(matches!(scheduler.start_job(&other).await, Err(CoreError::Schedule(_))));
        assert!(scheduler.registered().await.is_empty());
    }

    #[tokio::test]
    async fn sync_follows_the_persisted_status() {
        let (tenants, store, _db, _dir) = tenants_with("CREATE TABLE t (x);").await;
        let scheduler = JobScheduler::new(store.clone(), tenants, OverlapPolicy::Skip).await.unwrap();
        let saved = store.save_job(&sql_job("", "SELECT 1", None)).await.unwrap();

        scheduler.sync_job(&saved.id).await.unwrap();
        assert!(scheduler.is_registered(&saved.id).await);

        assert!(store.set_job_status(&saved.id, JobStatus::Running, JobStatus::Stopped).await.unwrap());
        scheduler.sync_job(&saved.id).await.unwrap();
        assert!(!scheduler.is_registered(&saved.id).await);

        assert_eq!(scheduler.load_persisted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_in_flight_blocks_ticks_after_a_resync() {
        let (tenants, store, _db, _dir) = tenants_with("CREATE TABLE t (x);").await;
        let scheduler = JobScheduler::new(store.clone(), tenants, OverlapPolicy::Skip).await.unwrap();
        let saved = store.save_job(&sql_job("", "SELECT 1", None)).await.unwrap();
        scheduler.sync_job(&saved.id).await.unwrap();

        let running = scheduler.gate_for(&saved.id).await.enter();
        assert!(running.is_some());

        assert!(store.set_job_status(&saved.id, JobStatus::Running, JobStatus::Stopped).await.unwrap());
        scheduler.sync_job(&saved.id).await.unwrap();
        assert!(store.set_job_status(&saved.id, JobStatus::Stopped, JobStatus::Running).await.unwrap());
        scheduler.sync_job(&saved.id).await.unwrap();
        assert!(scheduler.is_registered(&saved.id).await);

        assert!(scheduler.gate_for(&saved.id).await.enter().is_none());
        drop(running);
        assert!(scheduler.gate_for(&saved.id).await.enter().is_some());
    }
}
