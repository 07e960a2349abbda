//! Per-node connection pool
//!
//! Each node gets one bounded pool. Callers that cannot be served at once
//! queue in strict FIFO order; a released connection (or a freed slot) is
//! handed directly to the head of the queue, so a newly arriving caller can
//! never overtake a waiter.
//!
//! ```text
//!  acquire ──▶ waiters empty? ──yes──▶ idle conn ──▶ lease
//!                  │                 └▶ free slot ──▶ connect ──▶ lease
//!                  no / at capacity
//!                  ▼
//!            queue full? ──yes──▶ PoolExhausted
//!                  │
//!                  ▼
//!            wait min(deadline, fast_fail_after)
//!              ├─ grant ──▶ lease
//!              ├─ deadline ──▶ Timeout
//!              └─ fast-fail ──▶ PoolExhausted
//! ```
//!
//! Counting: `active` covers leased connections and slots reserved for a
//! handshake in progress; `idle + active` never exceeds `max_connections`
//! except transiently after the limit is lowered, in which case surplus
//! connections are closed as they come back.

use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::node::{Node, NodeId};
use crate::observability::PoolMetrics;
use crate::transport::Transport;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// How a leased connection is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The connection is in a clean state and may be reused
    Reusable,
    /// The connection failed and must be closed
    Broken,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Leased connections plus handshakes in progress
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
    pub quarantined: bool,
}

impl PoolStats {
    /// Load figure used by least-connections routing
    pub fn load(&self) -> usize {
        self.active + self.waiters
    }
}

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

enum Grant<C> {
    Reuse(IdleConn<C>),
    Open,
}

struct Waiter<C> {
    id: u64,
    /// Limit captured with the caller's configuration snapshot
    max_connections: usize,
    tx: oneshot::Sender<Grant<C>>,
}

struct PoolState<C> {
    node: Node,
    idle: VecDeque<IdleConn<C>>,
    active: usize,
    waiters: VecDeque<Waiter<C>>,
    next_waiter_id: u64,
    closed: bool,
    quarantined: bool,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active
    }

    fn has_capacity(&self, limits: &PoolConfig) -> bool {
        self.total() < limits.max_connections
    }

    fn reap_expired(&mut self, now: Instant, limits: &PoolConfig, discard: &mut Vec<C>) {
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for idle in self.idle.drain(..) {
            if now.saturating_duration_since(idle.last_used) > limits.max_idle_age {
                discard.push(idle.conn);
            } else {
                kept.push_back(idle);
            }
        }
        self.idle = kept;
    }

    /// Hand idle connections and free slots to queued waiters, oldest first
    ///
    /// A new slot is opened only while the head waiter's own limit allows it.
    fn dispatch(&mut self) {
        loop {
            while self.waiters.front().is_some_and(|w| w.tx.is_closed()) {
                self.waiters.pop_front();
            }
            let Some(max_connections) = self.waiters.front().map(|w| w.max_connections) else {
                break;
            };
            let grant = if let Some(idle) = self.idle.pop_back() {
                Grant::Reuse(idle)
            } else if self.total() < max_connections && !self.closed {
                Grant::Open
            } else {
                break;
            };
            self.active += 1;
            if let Err(grant) = self.send_to_head(grant) {
                self.active -= 1;
                if let Grant::Reuse(idle) = grant {
                    self.idle.push_back(idle);
                }
                break;
            }
        }
    }

    /// Send `grant` to the oldest live waiter; gives it back if none is left
    fn send_to_head(&mut self, mut grant: Grant<C>) -> std::result::Result<(), Grant<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return Ok(()),
                Err(returned) => grant = returned,
            }
        }
        Err(grant)
    }
}

enum Admission<T: Transport> {
    Ready(Grant<T::Connection>),
    Full(usize),
    Queued(WaiterGuard<T>),
}

/// Where a failed acquire gave up
#[derive(Debug)]
pub enum AcquireError {
    /// Queue full, queue wait expired or pool closed; the node was never contacted
    Queue(ClientError),
    /// Opening a new connection to the node failed
    Handshake(ClientError),
}

impl AcquireError {
    pub fn into_inner(self) -> ClientError {
        match self {
            AcquireError::Queue(err) | AcquireError::Handshake(err) => err,
        }
    }
}

impl From<AcquireError> for ClientError {
    fn from(err: AcquireError) -> Self {
        err.into_inner()
    }
}

/// Connection pool for one node
pub struct NodePool<T: Transport> {
    node_id: NodeId,
    transport: Arc<T>,
    state: Mutex<PoolState<T::Connection>>,
}

impl<T: Transport> fmt::Debug for NodePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("node", &self.node_id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Transport> NodePool<T> {
    pub fn new(node: Node, transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            node_id: node.id(),
            transport,
            state: Mutex::new(PoolState {
                node,
                idle: VecDeque::new(),
                active: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                closed: false,
                quarantined: false,
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Update address or TLS reference after a topology refresh
    pub fn set_node(&self, node: Node) {
        self.state.lock().node = node;
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            active: st.active,
            idle: st.idle.len(),
            waiters: st.waiters.len(),
            quarantined: st.quarantined,
        }
    }

    /// No leases, handshakes or waiters reference the pool
    pub fn is_unused(&self) -> bool {
        let st = self.state.lock();
        st.active == 0 && st.waiters.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Lease a connection, waiting in FIFO order if the pool is at capacity
    pub async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
        limits: PoolConfig,
    ) -> Result<ConnectionHandle<T>> {
        self.checkout(deadline, limits)
            .await
            .map_err(ClientError::from)
    }

    /// Same as [`NodePool::acquire`], but tells queue failures apart from
    /// handshake failures
    pub async fn checkout(
        self: &Arc<Self>,
        deadline: Instant,
        limits: PoolConfig,
    ) -> std::result::Result<ConnectionHandle<T>, AcquireError> {
        let started = Instant::now();
        let mut discard = Vec::new();

        let admission = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(AcquireError::Queue(self.closed_error()));
            }
            st.reap_expired(started, &limits, &mut discard);

            let immediate = if !st.waiters.is_empty() {
                None
            } else if let Some(idle) = st.idle.pop_back() {
                Some(Grant::Reuse(idle))
            } else if st.has_capacity(&limits) {
                Some(Grant::Open)
            } else {
                None
            };

            match immediate {
                Some(grant) => {
                    st.active += 1;
                    Admission::Ready(grant)
                }
                None if st.waiters.len() >= limits.max_waiters => {
                    Admission::Full(st.waiters.len())
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    let id = st.next_waiter_id;
                    st.next_waiter_id += 1;
                    st.waiters.push_back(Waiter {
                        id,
                        max_connections: limits.max_connections,
                        tx,
                    });
                    trace!(
                        node_id = %self.node_id,
                        waiter = id,
                        depth = st.waiters.len(),
                        "Queued for connection"
                    );
                    Admission::Queued(WaiterGuard {
                        pool: Arc::clone(self),
                        id,
                        rx: Some(rx),
                    })
                }
            }
        };
        drop(discard);

        let grant = match admission {
            Admission::Ready(grant) => grant,
            Admission::Full(waiters) => {
                debug!(node_id = %self.node_id, waiters, "Waiter queue full");
                return Err(AcquireError::Queue(ClientError::PoolExhausted {
                    node: self.node_id,
                    waiters,
                }));
            }
            Admission::Queued(guard) => self
                .wait(guard, started, deadline, &limits)
                .await
                .map_err(AcquireError::Queue)?,
        };

        PoolMetrics::record_acquire_wait(started.elapsed());
        let lease = Lease {
            pool: Arc::clone(self),
            limits,
            armed: true,
        };
        match grant {
            Grant::Reuse(idle) => Ok(ConnectionHandle {
                conn: idle.conn,
                node: self.node_id,
                created_at: idle.created_at,
                last_used: Instant::now(),
                lease,
            }),
            Grant::Open => self
                .connect(lease, started, deadline)
                .await
                .map_err(AcquireError::Handshake),
        }
    }

    async fn wait(
        &self,
        mut guard: WaiterGuard<T>,
        started: Instant,
        deadline: Instant,
        limits: &PoolConfig,
    ) -> Result<Grant<T::Connection>> {
        let fast_fail_at = started + limits.fast_fail_after;
        let wait_until = deadline.min(fast_fail_at);

        let Some(rx) = guard.rx.as_mut() else {
            return Err(self.closed_error());
        };
        match timeout_at(wait_until, rx).await {
            Ok(Ok(grant)) => {
                guard.rx = None;
                Ok(grant)
            }
            // Senders are only dropped when the pool closes
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) if deadline <= fast_fail_at => Err(ClientError::Timeout {
                node: self.node_id,
                waited: started.elapsed(),
            }),
            Err(_) => {
                let waiters = self.state.lock().waiters.len();
                debug!(
                    node_id = %self.node_id,
                    waiters,
                    "Fast-fail threshold reached while queued"
                );
                Err(ClientError::PoolExhausted {
                    node: self.node_id,
                    waiters,
                })
            }
        }
    }

    async fn connect(
        self: &Arc<Self>,
        lease: Lease<T>,
        started: Instant,
        deadline: Instant,
    ) -> Result<ConnectionHandle<T>> {
        let node = self.state.lock().node.clone();
        let connect_deadline = deadline.min(Instant::now() + lease.limits.connect_timeout);

        match timeout_at(
            connect_deadline,
            self.transport.connect(&node.info, node.tls.as_ref()),
        )
        .await
        {
            Ok(Ok(conn)) => {
                PoolMetrics::increment_connections_opened(self.node_id);
                trace!(node_id = %self.node_id, "Opened connection");
                let now = Instant::now();
                Ok(ConnectionHandle {
                    conn,
                    node: self.node_id,
                    created_at: now,
                    last_used: now,
                    lease,
                })
            }
            Ok(Err(err)) => {
                debug!(node_id = %self.node_id, error = %err, "Connection handshake failed");
                Err(ClientError::from_transport(self.node_id, err))
            }
            Err(_) => Err(ClientError::Timeout {
                node: self.node_id,
                waited: started.elapsed(),
            }),
        }
    }

    /// Hand a leased connection back to the pool
    pub fn release(&self, handle: ConnectionHandle<T>, outcome: ReleaseOutcome) {
        let ConnectionHandle {
            conn,
            created_at,
            mut lease,
            ..
        } = handle;
        debug_assert!(std::ptr::eq(Arc::as_ptr(&lease.pool), self));
        lease.armed = false;
        let limits = lease.limits;
        drop(lease);

        let now = Instant::now();
        let mut discard = Vec::new();
        {
            let mut st = self.state.lock();
            st.active = st.active.saturating_sub(1);

            let reason = if outcome == ReleaseOutcome::Broken {
                Some("broken")
            } else if st.closed {
                Some("closed")
            } else if st.quarantined {
                Some("quarantined")
            } else if now.saturating_duration_since(created_at) > limits.max_idle_age {
                Some("expired")
            } else if !st.has_capacity(&limits) {
                Some("over_capacity")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    PoolMetrics::increment_connections_closed(self.node_id, reason);
                    trace!(node_id = %self.node_id, reason, "Closing connection on release");
                    discard.push(conn);
                }
                None => st.idle.push_back(IdleConn {
                    conn,
                    created_at,
                    last_used: now,
                }),
            }
            st.dispatch();
        }
        drop(discard);
    }

    /// Free the slot of a lease or handshake that ended without a release
    fn free_slot(&self) {
        let mut st = self.state.lock();
        st.active = st.active.saturating_sub(1);
        st.dispatch();
    }

    /// Reap idle connections, trim surplus, serve waiters and top up to `min_idle`
    pub async fn maintain(self: &Arc<Self>, limits: PoolConfig) {
        let now = Instant::now();
        let mut discard = Vec::new();
        let reserved = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.reap_expired(now, &limits, &mut discard);
            while st.total() > limits.max_connections {
                match st.idle.pop_front() {
                    Some(idle) => discard.push(idle.conn),
                    None => break,
                }
            }
            st.dispatch();

            if st.quarantined || !st.waiters.is_empty() {
                0
            } else {
                let wanted = limits.min_idle.saturating_sub(st.idle.len());
                let room = limits.max_connections.saturating_sub(st.total());
                let n = wanted.min(room);
                st.active += n;
                n
            }
        };
        if !discard.is_empty() {
            for _ in &discard {
                PoolMetrics::increment_connections_closed(self.node_id, "idle");
            }
            debug!(node_id = %self.node_id, reaped = discard.len(), "Reaped idle connections");
        }
        drop(discard);

        if reserved == 0 {
            return;
        }
        let deadline = now + limits.connect_timeout;
        let opens = (0..reserved).map(|_| {
            let lease = Lease {
                pool: Arc::clone(self),
                limits,
                armed: true,
            };
            self.connect(lease, now, deadline)
        });
        for result in futures::future::join_all(opens).await {
            match result {
                Ok(handle) => self.release(handle, ReleaseOutcome::Reusable),
                Err(err) => {
                    debug!(
                        node_id = %self.node_id,
                        error = %err,
                        "Failed to top up idle connections"
                    );
                }
            }
        }
    }

    /// Mark the node quarantined; idle connections are closed on entry
    pub fn set_quarantined(&self, quarantined: bool) {
        let drained: Vec<_> = {
            let mut st = self.state.lock();
            if st.quarantined == quarantined {
                return;
            }
            st.quarantined = quarantined;
            if quarantined {
                st.idle.drain(..).map(|idle| idle.conn).collect()
            } else {
                Vec::new()
            }
        };
        if !drained.is_empty() {
            PoolMetrics::increment_connections_closed(self.node_id, "quarantined");
        }
    }

    /// Retire the pool: idle connections close, queued waiters fail and
    /// outstanding leases close when released
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut st = self.state.lock();
            st.closed = true;
            let idle: Vec<_> = st.idle.drain(..).map(|idle| idle.conn).collect();
            let waiters: Vec<_> = st.waiters.drain(..).collect();
            (idle, waiters)
        };
        debug!(
            node_id = %self.node_id,
            idle = idle.len(),
            waiters = waiters.len(),
            "Closed connection pool"
        );
    }

    fn closed_error(&self) -> ClientError {
        ClientError::Transient {
            node: self.node_id,
            reason: "connection pool closed".to_string(),
        }
    }
}

/// Queue slot of a waiting caller; removes itself when dropped
struct WaiterGuard<T: Transport> {
    pool: Arc<NodePool<T>>,
    id: u64,
    rx: Option<oneshot::Receiver<Grant<T::Connection>>>,
}

impl<T: Transport> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut st = self.pool.state.lock();
        if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
            st.waiters.remove(pos);
            return;
        }
        // Grants are sent under the state lock, so a raced grant is visible here
        rx.close();
        if let Ok(grant) = rx.try_recv() {
            st.active = st.active.saturating_sub(1);
            if let Grant::Reuse(idle) = grant {
                st.idle.push_back(idle);
            }
            st.dispatch();
        }
    }
}

/// Slot reservation backing one lease or handshake
struct Lease<T: Transport> {
    pool: Arc<NodePool<T>>,
    limits: PoolConfig,
    armed: bool,
}

impl<T: Transport> Drop for Lease<T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}

/// Exclusive lease on one connection
///
/// Dropping a handle without [`NodePool::release`] closes the connection and
/// frees its slot.
pub struct ConnectionHandle<T: Transport> {
    // Declared before `lease` so the connection closes before its slot frees
    conn: T::Connection,
    node: NodeId,
    created_at: Instant,
    last_used: Instant,
    lease: Lease<T>,
}

impl<T: Transport> ConnectionHandle<T> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn connection(&mut self) -> &mut T::Connection {
        &mut self.conn
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Pool this handle was leased from
    pub fn pool(&self) -> &Arc<NodePool<T>> {
        &self.lease.pool
    }
}

impl<T: Transport> fmt::Debug for ConnectionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("node", &self.node)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
