//! Query correlation: turns the fire-and-forget wire protocol into
//! awaitable request/response calls.
//!
//! Callers allocate a correlation id, embed it in an outgoing command, and
//! wait on a single-resolution slot. The dispatch path resolves the slot
//! when a response echoing the id arrives; teardown fails every pending
//! slot so no caller blocks forever across a reconnect.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// First correlation id handed out. Low ids are reserved by the protocol.
const FIRST_QUERY_ID: i64 = 20;

type QueryResult = ClientResult<Option<Value>>;

/// Handle for one pending query. Await it with [`PendingQuery::wait`].
pub struct PendingQuery {
    rx: oneshot::Receiver<QueryResult>,
}

impl PendingQuery {
    /// Waits for the matching response. A `None` result means the queried
    /// subject does not exist.
    pub async fn wait(self) -> QueryResult {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: the engine was torn down.
            Err(_) => Err(ClientError::Disconnected),
        }
    }
}

/// Allocates correlation ids and resolves pending requests.
#[derive(Debug, Default)]
pub struct QueryCorrelator {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<QueryResult>>>,
}

impl QueryCorrelator {
    /// Creates a correlator with the protocol's id seed.
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(FIRST_QUERY_ID),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a fresh id. Ids are unique for the life of the allocator and
    /// monotonically increasing; safe under concurrent callers.
    pub fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Records a pending query and returns the awaitable handle.
    pub fn register(&self, id: i64) -> PendingQuery {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .insert(id, tx);
        PendingQuery { rx }
    }

    /// Resolves the pending query for `id`, removing it first so it cannot
    /// fire twice. Resolving an id with no registration is a no-op (late or
    /// duplicate response).
    pub fn resolve(&self, id: i64, value: Option<Value>) -> bool {
        let slot = self
            .pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(&id);
        match slot {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Drops a registration without resolving it (e.g. the request could
    /// not be sent).
    pub fn discard(&self, id: i64) {
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(&id);
    }

    /// Fails every pending query with a disconnect error, exactly once
    /// each. Invoked on teardown.
    pub fn fail_all(&self) {
        let pending: Vec<_> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().collect()
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending queries on teardown");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }

    /// Number of outstanding queries.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }
}
