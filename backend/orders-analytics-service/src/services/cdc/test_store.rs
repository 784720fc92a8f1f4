use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::applier::{ApplyError, OrderAnalyticsRow, OrderStore};

/// In-memory stand-in for the analytics table.
///
/// Clones share state, so a test can hand one clone to the applier and keep
/// another for inspection. `failing(n)` makes the next `n` store calls fail
/// with a store error before succeeding.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    rows: Arc<Mutex<HashMap<i64, OrderAnalyticsRow>>>,
    calls: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
}

impl MemoryStore {
    pub(crate) fn failing(times: u32) -> Self {
        let store = Self::default();
        store.failures.store(times, Ordering::SeqCst);
        store
    }

    pub(crate) fn row(&self, id: i64) -> Option<OrderAnalyticsRow> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Store calls attempted, failed ones included.
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), ApplyError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ApplyError::Store(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn upsert(&self, row: &OrderAnalyticsRow) -> Result<(), ApplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.rows.lock().unwrap().insert(row.id, row.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), ApplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.rows.lock().unwrap().remove(&id);
        Ok(())
    }
}
