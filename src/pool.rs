//! PostgreSQL connection pool.
//!
//! A named, bounded set of live connections with checkout/checkin, a
//! strict-FIFO waiter queue, liveness tracking, and breakage handling.
//! Ready connections are handed out LIFO to keep caches warm; waiters
//! are served strictly in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{ConnectConfig, Connection};
use crate::error::{Error, Result};
use crate::types::TypeRegistry;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of connections
    pub size: usize,
    /// Connection settings shared by every pool member
    pub connect: ConnectConfig,
    /// Default time a queued checkout waits before `PoolTimeout`
    pub checkout_timeout: Duration,
}

impl PoolConfig {
    pub fn new(connect: ConnectConfig) -> Self {
        Self {
            size: 10,
            connect,
            checkout_timeout: Duration::from_secs(5),
        }
    }

    /// Parse a connection URL into a pool configuration.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(ConnectConfig::from_url(url)?))
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }
}

/// Options for a single checkout.
#[derive(Debug, Clone)]
pub struct CheckoutOpts {
    /// Whether to wait for a connection when the pool is at size
    pub queue: bool,
    /// Wait limit; the pool default applies when unset
    pub timeout: Option<Duration>,
}

impl Default for CheckoutOpts {
    fn default() -> Self {
        Self {
            queue: true,
            timeout: None,
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A checked-out connection.
///
/// The mutex makes the handle shareable with the ambient session binding
/// while still giving the current owner exclusive use of the socket.
#[derive(Clone)]
pub struct ConnHandle {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl ConnHandle {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        }
    }

    /// Lock the underlying connection for protocol use.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle").finish_non_exhaustive()
    }
}

/// Opaque checkout receipt.
///
/// Pairs the connection with its checkout bookkeeping entry so check-in
/// is O(1) and a double check-in is detectable.
#[derive(Debug)]
pub struct PoolRef {
    id: u64,
    pool: Pool,
    queue_time: Duration,
}

impl PoolRef {
    /// The pool this receipt belongs to.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Time the checkout spent enqueued before handoff.
    pub fn queue_time(&self) -> Duration {
        self.queue_time
    }
}

// ============================================================================
// Pool internals
// ============================================================================

struct Waiter {
    id: u64,
    tx: oneshot::Sender<(u64, ConnHandle)>,
}

struct PoolState {
    /// Idle connections, popped LIFO
    ready: Vec<ConnHandle>,
    /// Live checkout receipts
    checked_out: HashMap<u64, Instant>,
    /// Pending checkouts, served FIFO
    waiters: VecDeque<Waiter>,
    /// Connections alive or being spawned; never exceeds the target size
    total: usize,
    closed: bool,
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

/// A named PostgreSQL connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.config.size)
            .finish_non_exhaustive()
    }
}

enum CheckoutPlan {
    Ready(u64, ConnHandle),
    Spawn,
    Wait(u64, oneshot::Receiver<(u64, ConnHandle)>),
    Full,
}

impl Pool {
    fn new(name: String, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                config,
                state: Mutex::new(PoolState {
                    ready: Vec::new(),
                    checked_out: HashMap::new(),
                    waiters: VecDeque::new(),
                    total: 0,
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of idle connections.
    pub fn ready_count(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Number of checked-out connections.
    pub fn checked_out_count(&self) -> usize {
        self.inner.state.lock().checked_out.len()
    }

    /// Number of queued checkouts.
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a connection from the pool.
    ///
    /// A ready connection is handed out immediately; below target size a
    /// fresh one is spawned and handshaken; otherwise the caller queues
    /// (FIFO) unless `opts.queue` is false.
    pub async fn checkout(&self, opts: CheckoutOpts) -> Result<(PoolRef, ConnHandle)> {
        let start = Instant::now();

        let plan = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }

            if let Some(handle) = state.ready.pop() {
                let id = self.next_id();
                state.checked_out.insert(id, start);
                CheckoutPlan::Ready(id, handle)
            } else if state.total < self.inner.config.size {
                // Reserve the slot before the handshake await
                state.total += 1;
                CheckoutPlan::Spawn
            } else if opts.queue {
                let id = self.next_id();
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                CheckoutPlan::Wait(id, rx)
            } else {
                CheckoutPlan::Full
            }
        };

        match plan {
            CheckoutPlan::Ready(id, handle) => Ok(self.receipt(id, handle, start)),
            CheckoutPlan::Spawn => match self.spawn_connection().await {
                Ok(handle) => {
                    let id = self.next_id();
                    self.inner.state.lock().checked_out.insert(id, start);
                    Ok(self.receipt(id, handle, start))
                }
                Err(e) => {
                    self.inner.state.lock().total -= 1;
                    Err(e)
                }
            },
            CheckoutPlan::Wait(waiter_id, mut rx) => {
                let timeout = opts.timeout.unwrap_or(self.inner.config.checkout_timeout);
                match tokio::time::timeout(timeout, &mut rx).await {
                    Ok(Ok((id, handle))) => Ok(self.receipt(id, handle, start)),
                    Ok(Err(_)) => Err(Error::PoolClosed),
                    Err(_) => {
                        let still_queued = {
                            let mut state = self.inner.state.lock();
                            let before = state.waiters.len();
                            state.waiters.retain(|w| w.id != waiter_id);
                            state.waiters.len() != before
                        };
                        if !still_queued {
                            // A handoff raced the timeout; put the lost
                            // connection back
                            if let Ok((id, handle)) = rx.try_recv() {
                                let lost = PoolRef {
                                    id,
                                    pool: self.clone(),
                                    queue_time: start.elapsed(),
                                };
                                self.checkin(lost, handle).await;
                            }
                        }
                        Err(Error::PoolTimeout)
                    }
                }
            }
            CheckoutPlan::Full => Err(Error::PoolFull),
        }
    }

    fn receipt(&self, id: u64, handle: ConnHandle, start: Instant) -> (PoolRef, ConnHandle) {
        let queue_time = start.elapsed();
        debug!(
            target: "pgkit::pool",
            pool = %self.inner.name,
            queue_time_us = queue_time.as_micros() as u64,
            "connection checked out"
        );
        (
            PoolRef {
                id,
                pool: self.clone(),
                queue_time,
            },
            handle,
        )
    }

    async fn spawn_connection(&self) -> Result<ConnHandle> {
        let conn =
            Connection::connect(self.inner.name.clone(), self.inner.config.connect.clone())
                .await?;
        debug!(target: "pgkit::pool", pool = %self.inner.name, "connection established");
        Ok(ConnHandle::new(conn))
    }

    /// Return a connection to the pool.
    ///
    /// Broken (or cancelled mid-protocol) connections are discarded and
    /// replaced; healthy ones go to the oldest waiter or back onto the
    /// ready stack. Double check-in with the same receipt is a no-op.
    pub async fn checkin(&self, pool_ref: PoolRef, handle: ConnHandle) {
        let reusable = handle.lock().await.is_reusable();

        let discarded = {
            let mut state = self.inner.state.lock();
            if state.checked_out.remove(&pool_ref.id).is_none() {
                warn!(
                    target: "pgkit::pool",
                    pool = %self.inner.name,
                    receipt = pool_ref.id,
                    "double check-in ignored"
                );
                return;
            }

            if state.closed || !reusable {
                state.total -= 1;
                true
            } else {
                self.hand_off_or_park(&mut state, handle.clone());
                false
            }
        };

        if discarded {
            if !reusable {
                warn!(
                    target: "pgkit::pool",
                    pool = %self.inner.name,
                    "broken connection discarded at check-in"
                );
            }
            terminate(handle);
            self.replace_if_below_size();
        }
    }

    /// Forcibly tear a connection down, replacing it to hold the pool at
    /// target size.
    pub async fn break_conn(&self, pool_ref: PoolRef, handle: ConnHandle) {
        handle.lock().await.mark_broken();

        {
            let mut state = self.inner.state.lock();
            if state.checked_out.remove(&pool_ref.id).is_none() {
                warn!(
                    target: "pgkit::pool",
                    pool = %self.inner.name,
                    receipt = pool_ref.id,
                    "break of unknown checkout ignored"
                );
                return;
            }
            state.total -= 1;
        }

        debug!(target: "pgkit::pool", pool = %self.inner.name, "connection broken");
        terminate(handle);
        self.replace_if_below_size();
    }

    /// Hand a connection to the oldest live waiter, or park it.
    fn hand_off_or_park(&self, state: &mut PoolState, handle: ConnHandle) {
        while let Some(waiter) = state.waiters.pop_front() {
            let id = self.next_id();
            state.checked_out.insert(id, Instant::now());
            match waiter.tx.send((id, handle.clone())) {
                Ok(()) => return,
                Err(_) => {
                    // Receiver timed out; try the next waiter
                    state.checked_out.remove(&id);
                }
            }
        }
        state.ready.push(handle);
    }

    /// Spawn a replacement connection when the pool dropped below its
    /// target size.
    fn replace_if_below_size(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed || state.total >= self.inner.config.size {
                return;
            }
            state.total += 1;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            match pool.spawn_connection().await {
                Ok(handle) => {
                    let mut state = pool.inner.state.lock();
                    if state.closed {
                        state.total -= 1;
                        drop(state);
                        terminate(handle);
                        return;
                    }
                    pool.hand_off_or_park(&mut state, handle);
                }
                Err(e) => {
                    pool.inner.state.lock().total -= 1;
                    warn!(
                        target: "pgkit::pool",
                        pool = %pool.inner.name,
                        error = %e,
                        "replacement connection failed"
                    );
                }
            }
        });
    }

    /// Shut the pool down: idle connections are terminated, waiters are
    /// failed, and further checkouts return `PoolClosed`.
    pub async fn close(&self) {
        let (ready, waiters) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let ready = std::mem::take(&mut state.ready);
            let waiters = std::mem::take(&mut state.waiters);
            state.total -= ready.len();
            (ready, waiters)
        };

        // Dropping the senders wakes every waiter with PoolClosed
        drop(waiters);

        for handle in ready {
            let mut conn = handle.lock().await;
            let _ = conn.close().await;
        }
    }
}

/// Best-effort Terminate on a connection we no longer track.
fn terminate(handle: ConnHandle) {
    tokio::spawn(async move {
        let mut conn = handle.lock().await;
        let _ = conn.close().await;
    });
}

// ============================================================================
// Pool registry
// ============================================================================

fn pools() -> &'static RwLock<HashMap<String, Pool>> {
    static POOLS: OnceLock<RwLock<HashMap<String, Pool>>> = OnceLock::new();
    POOLS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Start a named pool and register it process-wide.
///
/// Connections are spawned on demand up to the configured size; starting
/// the pool performs no I/O.
pub fn start_pool(name: impl Into<String>, config: PoolConfig) -> Result<Pool> {
    let name = name.into();
    if config.size == 0 {
        return Err(Error::Config("pool size must be nonzero".to_string()));
    }

    let mut registry = pools().write();
    if registry.contains_key(&name) {
        return Err(Error::Config(format!("pool {name:?} already started")));
    }

    TypeRegistry::global().register_builtins(&name);
    let pool = Pool::new(name.clone(), config);
    registry.insert(name, pool.clone());
    Ok(pool)
}

/// Look up a registered pool by name.
pub fn lookup_pool(name: &str) -> Result<Pool> {
    pools()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownPool(name.to_string()))
}

/// Deregister and shut down a pool.
pub async fn stop_pool(name: &str) -> Result<()> {
    let pool = {
        let mut registry = pools().write();
        registry
            .remove(name)
            .ok_or_else(|| Error::UnknownPool(name.to_string()))?
    };
    pool.close().await;
    Ok(())
}
