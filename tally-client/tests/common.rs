use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_client::queries::{DbHelpers, Queries};
use tally_client::{Engine, RecordStore, RemoteSync, SyncReport};
use tally_core::{
    config::EngineConfig,
    errors::SyncError,
    models::RecordFields,
};

/// Creates a new in-memory test sqlite database and runs migrations.
#[allow(dead_code)]
pub async fn setup_test_store() -> RecordStore {
    RecordStore::in_memory().await.unwrap()
}

/// Short cadences so scheduler behaviour is observable within a test.
#[allow(dead_code)]
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        idle_interval: Duration::from_millis(400),
        urgent_interval: Duration::from_millis(200),
        settle_delay: Duration::from_millis(20),
    }
}

#[allow(dead_code)]
pub async fn setup_engine(remote: Arc<ScriptedRemote>) -> Engine {
    let store = setup_test_store().await;
    Engine::new(store, remote, fast_config()).await.unwrap()
}

#[allow(dead_code)]
pub fn fields(name: &str, qty: i64) -> RecordFields {
    RecordFields {
        name: name.to_string(),
        qty,
        ..Default::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A `RemoteSync` test double that can be told to fail, to take its time, or
/// to deliver rows "from the remote" straight into the local table.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedRemote {
    fail: AtomicBool,
    delay_ms: AtomicU64,
    incoming: Mutex<Vec<RecordFields>>,
    calls: AtomicUsize,
    completed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Row that the next successful sync writes into the local table.
    pub fn deliver(&self, fields: RecordFields) {
        self.incoming.lock().unwrap().push(fields);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSync for ScriptedRemote {
    async fn sync(&self, store: &RecordStore) -> Result<SyncReport, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let result = if self.fail.load(Ordering::SeqCst) {
            Err(SyncError::Unavailable("scripted outage".into()))
        } else {
            let incoming: Vec<RecordFields> = self.incoming.lock().unwrap().drain(..).collect();
            let now = DbHelpers::timestamp(&chrono::Utc::now());
            for fields in &incoming {
                let params = DbHelpers::record_params(fields);
                sqlx::query(Queries::INSERT_RECORD)
                    .bind(params.0)
                    .bind(params.1)
                    .bind(params.2)
                    .bind(params.3)
                    .bind(params.4)
                    .bind(params.5)
                    .bind(params.6)
                    .bind(now.as_str())
                    .bind(now.as_str())
                    .execute(&store.pool)
                    .await?;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(SyncReport::default())
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
