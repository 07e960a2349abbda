//! Cluster manager
//!
//! The [`ClusterManager`] owns every piece of client state and is the single
//! entry point for requests:
//!
//! ```text
//!  execute(key, op)
//!     │  capture ConfigSnapshot, compute deadline
//!     ▼
//!  FailoverController::run ──▶ attempt
//!                                 │ partition = partitioner(key)
//!                                 │ Router::route(view, partition)   ── stale? refresh once
//!                                 │ breaker admission
//!                                 │ NodePool::acquire
//!                                 │ Transport::execute
//!                                 ▼
//!                      settle breaker, release connection,
//!                      passive health signal
//! ```
//!
//! Two background tasks run after [`ClusterManager::start`]: the tend loop
//! (discovery refresh, pool maintenance, garbage collection of retired
//! nodes) and the probe loop (health probes). Both stop on
//! [`ClusterManager::shutdown`].

use crate::breaker::BreakerSnapshot;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ClientConfig, ConfigSnapshot, ConfigStore};
use crate::discovery::{PollingDiscovery, ViewSource};
use crate::error::{ClientError, ErrorClass, Result};
use crate::events::{ClientEvent, RefreshOutcome, SharedEventSink, TracingEventSink};
use crate::failover::FailoverController;
use crate::health::{HealthMonitor, HealthSnapshot, HealthState, ProbeOutcome, Transition};
use crate::node::{Node, NodeId, NodeStatus, TlsHandle};
use crate::observability::{DiscoveryMetrics, HealthMetrics, RoutingMetrics};
use crate::partitioner::{Murmur2Partitioner, Partitioner};
use crate::pool::{AcquireError, ConnectionHandle, NodePool, PoolStats, ReleaseOutcome};
use crate::routing::{NodeSignals, RouteDecision, Router};
use crate::transport::{Operation, Transport};
use crate::view::{ClusterView, ViewStore};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Seed addresses and TLS reference used to reach the cluster
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    /// `host:port` addresses queried by the first discovery round
    pub seeds: Vec<String>,
    /// Passed to every handshake and topology query
    pub tls: Option<TlsHandle>,
}

impl Bootstrap {
    pub fn new(seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsHandle) -> Self {
        self.tls = Some(tls);
        self
    }
}

// ============================================================================
// Introspection
// ============================================================================

/// Client-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_retries: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub view_generation: u64,
    pub config_version: u64,
    pub nodes: Vec<NodeStats>,
}

/// Per-node statistics
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node: NodeId,
    pub addr: String,
    /// Whether the node answered the last discovery round itself
    pub status: NodeStatus,
    pub health: Option<HealthSnapshot>,
    pub breakers: Vec<BreakerSnapshot>,
    pub pool: PoolStats,
}

/// Cluster health summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterHealth {
    pub generation: u64,
    pub node_count: usize,
    pub healthy_nodes: usize,
    pub suspect_nodes: usize,
    pub quarantined_nodes: usize,
    pub partition_count: u32,
    /// Partitions whose replicas are all quarantined or gone
    pub unavailable_partitions: usize,
}

impl ClusterHealth {
    pub fn is_healthy(&self) -> bool {
        self.generation > 0 && self.healthy_nodes > 0 && self.unavailable_partitions == 0
    }

    pub fn status(&self) -> &'static str {
        if !self.is_healthy() {
            "unhealthy"
        } else if self.suspect_nodes > 0 || self.quarantined_nodes > 0 {
            "degraded"
        } else {
            "healthy"
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ClusterManager`]
pub struct ClusterManagerBuilder<T: Transport> {
    config: ClientConfig,
    bootstrap: Bootstrap,
    transport: Arc<T>,
    events: Option<SharedEventSink>,
    clock: Option<SharedClock>,
    partitioner: Option<Arc<dyn Partitioner>>,
    source: Option<Arc<dyn ViewSource>>,
}

impl<T: Transport> ClusterManagerBuilder<T> {
    /// Event sink (defaults to [`TracingEventSink`])
    pub fn event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Time source for health and breaker backoff (defaults to [`SystemClock`])
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Key partitioner (defaults to [`Murmur2Partitioner`])
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    /// Topology source (defaults to [`PollingDiscovery`] over the transport)
    pub fn view_source(mut self, source: Arc<dyn ViewSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Result<ClusterManager<T>> {
        if self.bootstrap.seeds.is_empty() {
            return Err(ClientError::InvalidConfig(
                "bootstrap.seeds must not be empty".to_string(),
            ));
        }
        let config = Arc::new(ConfigStore::new(self.config)?);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink));
        let source = self.source.unwrap_or_else(|| {
            Arc::new(PollingDiscovery::new(
                Arc::clone(&self.transport),
                self.bootstrap.tls.clone(),
                Arc::clone(&config),
            ))
        });
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(ClusterManager {
            inner: Arc::new(Inner {
                transport: self.transport,
                bootstrap: self.bootstrap,
                config,
                views: ViewStore::new(),
                source,
                health: HealthMonitor::new(Arc::clone(&clock)),
                pools: DashMap::new(),
                retired: parking_lot::Mutex::new(Vec::new()),
                failover: FailoverController::new(clock, Arc::clone(&events)),
                router: Router::new(),
                partitioner: self
                    .partitioner
                    .unwrap_or_else(|| Arc::new(Murmur2Partitioner)),
                events,
                refresh_lock: tokio::sync::Mutex::new(()),
                refresh_requested: Notify::new(),
                shutdown_tx,
                shutting_down: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

// ============================================================================
// Cluster Manager
// ============================================================================

/// Client runtime for a partitioned key-value cluster
pub struct ClusterManager<T: Transport> {
    inner: Arc<Inner<T>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

struct Inner<T: Transport> {
    transport: Arc<T>,
    bootstrap: Bootstrap,
    config: Arc<ConfigStore>,
    views: ViewStore,
    source: Arc<dyn ViewSource>,
    health: HealthMonitor,
    pools: DashMap<NodeId, Arc<NodePool<T>>>,
    /// Pools of nodes that left the view, kept until their leases drain
    retired: parking_lot::Mutex<Vec<Arc<NodePool<T>>>>,
    failover: FailoverController,
    router: Router,
    partitioner: Arc<dyn Partitioner>,
    events: SharedEventSink,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_requested: Notify,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    counters: Counters,
}

impl<T: Transport> std::fmt::Debug for ClusterManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("generation", &self.inner.views.generation())
            .field("config_version", &self.inner.config.load().version)
            .field("seeds", &self.inner.bootstrap.seeds)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ClusterManager<T> {
    pub fn builder(
        config: ClientConfig,
        bootstrap: Bootstrap,
        transport: Arc<T>,
    ) -> ClusterManagerBuilder<T> {
        ClusterManagerBuilder {
            config,
            bootstrap,
            transport,
            events: None,
            clock: None,
            partitioner: None,
            source: None,
        }
    }

    /// Create a manager with default sink, clock, partitioner and discovery
    pub fn new(config: ClientConfig, bootstrap: Bootstrap, transport: Arc<T>) -> Result<Self> {
        Self::builder(config, bootstrap, transport).build()
    }

    /// Build the first view from the seeds and spawn the background loops
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ClientError::ShuttingDown);
        }
        if !self.tasks.lock().is_empty() {
            return Ok(());
        }

        let view = self.inner.refresh(None).await?;
        info!(
            generation = view.generation(),
            nodes = view.node_count(),
            partitions = view.partitions().len(),
            "Cluster manager started"
        );
        self.inner.maintain_pools().await;

        let tend = tokio::spawn(Inner::tend_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown_tx.subscribe(),
        ));
        let probe = tokio::spawn(Inner::probe_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().extend([tend, probe]);
        Ok(())
    }

    /// Route `op` by `key` and execute it with retries and failover
    pub async fn execute(&self, key: &[u8], op: Operation) -> Result<Bytes> {
        self.inner.execute(key, op).await
    }

    /// Refresh the cluster view now; returns the published generation
    pub async fn refresh_now(&self) -> Result<u64> {
        self.inner.refresh(None).await.map(|view| view.generation())
    }

    /// Run one health probe round now
    pub async fn probe_now(&self) {
        self.inner.probe_round().await;
    }

    /// Validate and apply a new configuration; returns its version
    ///
    /// Operations already in flight keep the snapshot they started with.
    pub async fn reconfigure(&self, config: ClientConfig) -> Result<u64> {
        let version = self.inner.config.swap(config)?;
        info!(version, "Applied new client configuration");
        self.inner.maintain_pools().await;
        Ok(version)
    }

    /// Restore the configuration that was active before the last change
    pub async fn rollback(&self) -> Result<u64> {
        let version = self.inner.config.rollback()?;
        warn!(version, "Rolled back client configuration");
        self.inner.maintain_pools().await;
        Ok(version)
    }

    /// Current cluster view
    pub fn view(&self) -> Arc<ClusterView> {
        self.inner.views.load()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.inner.config.load()
    }

    pub fn node_state(&self, node: NodeId) -> HealthState {
        self.inner.health.state(node)
    }

    pub fn pool_stats(&self, node: NodeId) -> Option<PoolStats> {
        self.inner.pools.get(&node).map(|p| p.stats())
    }

    pub fn stats(&self) -> ClientStats {
        let inner = &self.inner;
        let view = inner.views.load();
        let nodes = view
            .nodes()
            .map(|node| NodeStats {
                node: node.id(),
                addr: node.addr().to_string(),
                status: node.status,
                health: inner.health.snapshot(node.id()),
                breakers: inner.failover.breakers().snapshot(node.id()),
                pool: inner
                    .pools
                    .get(&node.id())
                    .map(|p| p.stats())
                    .unwrap_or_default(),
            })
            .collect();

        ClientStats {
            total_requests: inner.counters.requests.load(Ordering::Relaxed),
            total_failures: inner.counters.failures.load(Ordering::Relaxed),
            total_retries: inner.counters.retries.load(Ordering::Relaxed),
            refreshes: inner.counters.refreshes.load(Ordering::Relaxed),
            refresh_failures: inner.counters.refresh_failures.load(Ordering::Relaxed),
            view_generation: view.generation(),
            config_version: inner.config.load().version,
            nodes,
        }
    }

    pub fn health(&self) -> ClusterHealth {
        let inner = &self.inner;
        let view = inner.views.load();
        let (mut healthy, mut suspect, mut quarantined) = (0, 0, 0);
        for id in view.node_ids() {
            match inner.health.state(id) {
                HealthState::Healthy => healthy += 1,
                HealthState::Suspect => suspect += 1,
                HealthState::Quarantined => quarantined += 1,
            }
        }
        let unavailable_partitions = view
            .partitions()
            .iter()
            .filter(|(_, entry)| {
                !entry
                    .replicas
                    .iter()
                    .any(|id| view.contains(*id) && !inner.health.is_quarantined(*id))
            })
            .count();

        ClusterHealth {
            generation: view.generation(),
            node_count: view.node_count(),
            healthy_nodes: healthy,
            suspect_nodes: suspect,
            quarantined_nodes: quarantined,
            partition_count: view.partitions().partition_count(),
            unavailable_partitions,
        }
    }

    /// Stop background tasks and close every pool
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down cluster manager");
        let _ = self.inner.shutdown_tx.send(());

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        for pool in self.inner.pools.iter() {
            pool.close();
        }
        for pool in self.inner.retired.lock().iter() {
            pool.close();
        }
    }
}

impl<T: Transport> Drop for ClusterManager<T> {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send(());
    }
}

impl<T: Transport> Inner<T> {
    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn execute(&self, key: &[u8], op: Operation) -> Result<Bytes> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ClientError::ShuttingDown);
        }
        let config = self.config.load();
        let started = Instant::now();
        let deadline = started + op.timeout.unwrap_or(config.retry.request_timeout);

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        RoutingMetrics::increment_requests();

        let result = self
            .failover
            .run(&op, &config.retry, deadline, |attempt| {
                self.attempt(key, &op, &config, deadline, attempt)
            })
            .await;

        RoutingMetrics::record_latency(started.elapsed());
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn attempt(
        &self,
        key: &[u8],
        op: &Operation,
        config: &ConfigSnapshot,
        deadline: Instant,
        attempt: u32,
    ) -> Result<Bytes> {
        if attempt > 1 {
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
        }
        let (view, decision) = self.route(key, op, config).await?;
        let node = decision.node;

        let (Some(target), Some(pool)) = (
            view.node(node),
            self.pools.get(&node).map(|p| Arc::clone(p.value())),
        ) else {
            return Err(ClientError::Transient {
                node,
                reason: "node retired during dispatch".to_string(),
            });
        };

        let permit = self.failover.admit(node, op, &config.breaker)?;
        let started = Instant::now();
        let result = match pool.checkout(deadline, config.pool).await {
            Ok(handle) => self.dispatch(&pool, handle, target, op, started, deadline).await,
            // Waiting on our own queue says nothing about the node
            Err(AcquireError::Queue(err)) => {
                permit.neutral();
                if let ClientError::PoolExhausted { waiters, .. } = &err {
                    self.events.emit(ClientEvent::PoolExhausted {
                        node,
                        waiters: *waiters,
                    });
                }
                return Err(err);
            }
            Err(AcquireError::Handshake(err)) => Err(err),
        };
        self.failover.settle(permit, &result, &config.breaker);

        if let Err(err) = &result {
            if err.class() == ErrorClass::Transient {
                if let Some(t) = self.health.report_request_failure(node) {
                    self.on_transition(t);
                }
            }
        }
        result
    }

    async fn dispatch(
        &self,
        pool: &Arc<NodePool<T>>,
        mut handle: ConnectionHandle<T>,
        target: &Node,
        op: &Operation,
        started: Instant,
        deadline: Instant,
    ) -> Result<Bytes> {
        let node = target.id();

        let outcome = timeout_at(
            deadline,
            self.transport.execute(handle.connection(), &target.info, op),
        )
        .await;
        match outcome {
            Ok(Ok(bytes)) => {
                pool.release(handle, ReleaseOutcome::Reusable);
                Ok(bytes)
            }
            Ok(Err(err)) => {
                let outcome = if err.is_transient() {
                    ReleaseOutcome::Broken
                } else {
                    ReleaseOutcome::Reusable
                };
                pool.release(handle, outcome);
                Err(ClientError::from_transport(node, err))
            }
            Err(_) => {
                pool.release(handle, ReleaseOutcome::Broken);
                Err(ClientError::Timeout {
                    node,
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Route with one out-of-cycle refresh when the partition map is stale
    async fn route(
        &self,
        key: &[u8],
        op: &Operation,
        config: &ConfigSnapshot,
    ) -> Result<(Arc<ClusterView>, RouteDecision)> {
        let view = self.views.load();
        match self.route_in(&view, key, op, config) {
            Err(ClientError::StaleRouting { generation, .. }) => {
                debug!(generation, "Stale partition map, refreshing before routing again");
                if let Err(e) = self.refresh(Some(generation)).await {
                    debug!(error = %e, "Refresh after stale routing failed");
                }
                let view = self.views.load();
                let decision = self.route_in(&view, key, op, config)?;
                Ok((view, decision))
            }
            other => other.map(|decision| (view, decision)),
        }
    }

    fn route_in(
        &self,
        view: &ClusterView,
        key: &[u8],
        op: &Operation,
        config: &ConfigSnapshot,
    ) -> Result<RouteDecision> {
        let count = view.partitions().partition_count();
        let partition = if count == 0 {
            0
        } else {
            self.partitioner.partition(key, count)
        };

        let decision = self.router.route(view, partition, &config.routing, |id| NodeSignals {
            state: self.health.state(id),
            latency: self.health.latency(id),
            load: self.pools.get(&id).map(|p| p.stats().load()).unwrap_or(0),
            breaker_rejects: self.failover.rejects(id, &op.class, &config.breaker),
        })?;

        self.events.emit(ClientEvent::RoutingDecision {
            partition: decision.partition,
            node: decision.node,
            policy: config.routing.name(),
            degraded: decision.degraded,
        });
        Ok(decision)
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Refresh the view; skipped when a view newer than `observed` already exists
    async fn refresh(&self, observed: Option<u64>) -> Result<Arc<ClusterView>> {
        let _guard = self.refresh_lock.lock().await;
        let previous = self.views.load();
        if observed.is_some_and(|g| previous.generation() > g) {
            self.events.emit(ClientEvent::DiscoveryRefresh {
                generation: previous.generation(),
                nodes: previous.node_count(),
                partitions: previous.partitions().len(),
                outcome: RefreshOutcome::Coalesced,
            });
            return Ok(previous);
        }

        let known: Vec<Node> = previous.nodes().cloned().collect();
        let started = Instant::now();
        let result = self
            .source
            .refresh(&known, &self.bootstrap.seeds, &previous)
            .await;
        DiscoveryMetrics::record_refresh_duration(started.elapsed());

        match result {
            Ok(candidate) => {
                let view = self.views.publish(candidate);
                self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
                self.sync_nodes(&view);
                self.events.emit(ClientEvent::DiscoveryRefresh {
                    generation: view.generation(),
                    nodes: view.node_count(),
                    partitions: view.partitions().len(),
                    outcome: RefreshOutcome::Published,
                });
                Ok(view)
            }
            Err(err) => {
                self.counters.refresh_failures.fetch_add(1, Ordering::Relaxed);
                self.events.emit(ClientEvent::DiscoveryRefresh {
                    generation: previous.generation(),
                    nodes: previous.node_count(),
                    partitions: previous.partitions().len(),
                    outcome: RefreshOutcome::Failed(err.to_string()),
                });
                Err(err.into())
            }
        }
    }

    /// Create pools for new nodes and retire pools of departed ones
    fn sync_nodes(&self, view: &ClusterView) {
        for node in view.nodes() {
            self.health.track(node.id());
            if node.is_suspect() {
                if let Some(t) = self.health.report_unresponsive(node.id()) {
                    self.on_transition(t);
                }
            }
            match self.pools.get(&node.id()) {
                Some(pool) => pool.set_node(node.clone()),
                None => {
                    debug!(node_id = %node.id(), addr = %node.addr(), "Tracking new node");
                    let pool = NodePool::new(node.clone(), Arc::clone(&self.transport));
                    pool.set_quarantined(self.health.is_quarantined(node.id()));
                    self.pools.insert(node.id(), pool);
                }
            }
        }

        let departed: Vec<NodeId> = self
            .pools
            .iter()
            .map(|p| *p.key())
            .filter(|id| !view.contains(*id))
            .collect();
        for id in departed {
            if let Some((_, pool)) = self.pools.remove(&id) {
                info!(node_id = %id, "Node left the cluster view, retiring its pool");
                pool.close();
                self.retired.lock().push(pool);
            }
        }
    }

    /// Drop records of retired nodes once no lease references their pool
    fn collect_garbage(&self) {
        let view = self.views.load();
        let draining: BTreeSet<NodeId> = {
            let mut retired = self.retired.lock();
            retired.retain(|pool| !pool.is_unused());
            retired.iter().map(|pool| pool.node_id()).collect()
        };
        let live = |id: NodeId| view.contains(id) || draining.contains(&id);
        self.health.retain(live);
        self.failover.retain(live);
    }

    async fn maintain_pools(&self) {
        let limits = self.config.load().pool;
        let pools: Vec<_> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        futures::future::join_all(pools.iter().map(|pool| pool.maintain(limits))).await;
    }

    async fn tend_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let interval = self.config.load().discovery.tend_interval;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.refresh_requested.notified() => {}
            }
            if let Err(e) = self.refresh(None).await {
                debug!(error = %e, "Tend cycle refresh failed, keeping previous view");
            }
            self.maintain_pools().await;
            self.collect_garbage();
        }
        debug!("Tend loop stopped");
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    async fn probe_round(&self) {
        let config = self.config.load();
        let view = self.views.load();
        let probe_timeout = config.health.probe_timeout;

        let probes = view
            .nodes()
            .filter(|node| self.health.due_for_probe(node.id()))
            .map(|node| async move {
                let outcome = match timeout(probe_timeout, self.transport.probe(&node.info)).await
                {
                    Ok(Ok(latency)) => {
                        HealthMetrics::record_probe_latency(latency);
                        ProbeOutcome::Success(latency)
                    }
                    Ok(Err(_)) | Err(_) => {
                        HealthMetrics::increment_probe_failures(node.id());
                        ProbeOutcome::Failure
                    }
                };
                (node.id(), outcome)
            });

        for (node, outcome) in futures::future::join_all(probes).await {
            if let Some(t) = self.health.record_probe(node, outcome, &config.health) {
                self.on_transition(t);
            }
        }
    }

    async fn probe_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let interval = self.config.load().health.probe_interval;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.probe_round().await;
        }
        debug!("Probe loop stopped");
    }

    fn on_transition(&self, t: Transition) {
        self.events.emit(ClientEvent::NodeStateChanged {
            node: t.node,
            from: t.from,
            to: t.to,
        });
        let pool = self.pools.get(&t.node).map(|p| Arc::clone(p.value()));
        match t.to {
            HealthState::Quarantined => {
                if let Some(pool) = pool {
                    pool.set_quarantined(true);
                }
                self.refresh_requested.notify_one();
            }
            _ if t.from == HealthState::Quarantined => {
                if let Some(pool) = pool {
                    pool.set_quarantined(false);
                }
            }
            _ => {}
        }
    }
}
