/// Per-endpoint connection pooling
///
/// Each endpoint owns a bounded number of slots. A slot is held by an idle
/// connection, a checked-out connection, or a connection being opened. When
/// every slot is taken, callers queue FIFO; a released slot goes to the
/// longest waiter, together with the connection when one is checked in.
use crate::config::ClientOptions;
use crate::core::connection::{Connection, Transport};
use crate::core::{Endpoint, ServerRole};
use crate::error::{Error, NetworkError, NetworkErrorKind, Result};
use crate::topology::Topology;
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pool limits, normally derived from [`ClientOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub max_idle_time: Option<Duration>,
    /// Default wait used by callers that do not pass their own
    pub wait_queue_timeout: Duration,
    /// Waiters allowed per endpoint, as a multiple of `max_pool_size`
    pub wait_queue_multiple: usize,
    pub connect_timeout: Duration,
}

impl From<&ClientOptions> for PoolOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_idle_time: options.max_idle_time(),
            wait_queue_timeout: options.wait_queue_timeout(),
            wait_queue_multiple: options.wait_queue_multiple,
            connect_timeout: options.connect_timeout(),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&ClientOptions::default())
    }
}

/// Point-in-time counters for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    /// Idle, checked out and being opened
    pub total: usize,
    pub waiters: usize,
}

#[derive(Default)]
struct EndpointSlots {
    idle: VecDeque<Connection>,
    total: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
}

#[derive(Default)]
struct PoolState {
    closed: bool,
    endpoints: FnvHashMap<Endpoint, EndpointSlots>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

/// One counted slot. Dropping an armed guard gives the slot back.
struct SlotGuard {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    armed: bool,
}

impl SlotGuard {
    fn new(shared: Arc<Shared>, endpoint: Endpoint) -> Self {
        Self {
            shared,
            endpoint,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.shared.release(&self.endpoint, None);
        }
    }
}

/// What a waiter receives: a slot, with a connection when one was checked in.
/// A grant dropped unclaimed (its waiter gave up) returns both to the pool.
struct Grant {
    slot: SlotGuard,
    connection: Option<Connection>,
}

impl Drop for Grant {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.slot.disarm();
            self.slot.shared.release(&self.slot.endpoint, Some(connection));
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a slot (and optionally a connection) to the next live waiter, or
    /// park it. Returns a connection the caller should close.
    fn release(self: &Arc<Self>, endpoint: &Endpoint, connection: Option<Connection>) -> Option<Connection> {
        let mut state = self.lock();
        let closed = state.closed;
        let slots = state.endpoints.entry(endpoint.clone()).or_default();

        if closed {
            slots.total = slots.total.saturating_sub(1);
            return connection;
        }

        let mut connection = connection;
        while let Some(waiter) = slots.waiters.pop_front() {
            let grant = Grant {
                slot: SlotGuard::new(self.clone(), endpoint.clone()),
                connection: connection.take(),
            };
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(mut grant) => {
                    // Waiter gave up; take everything back without re-entering the lock
                    grant.slot.disarm();
                    connection = grant.connection.take();
                }
            }
        }

        match connection {
            Some(connection) => slots.idle.push_back(connection),
            None => slots.total = slots.total.saturating_sub(1),
        }
        None
    }
}

/// Bounded pool of connections keyed by endpoint
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

enum Next {
    Ready(Connection),
    Open(SlotGuard),
    Wait(oneshot::Receiver<Grant>),
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, options: PoolOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                options,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    pub fn stats(&self, endpoint: &Endpoint) -> PoolStats {
        let state = self.shared.lock();
        state
            .endpoints
            .get(endpoint)
            .map(|slots| PoolStats {
                idle: slots.idle.len(),
                total: slots.total,
                waiters: slots.waiters.len(),
            })
            .unwrap_or_default()
    }

    /// Check out a connection, waiting up to `wait` when the endpoint is at
    /// `max_pool_size`. A zero wait fails at once with [`Error::PoolExhausted`].
    pub async fn checkout(&self, endpoint: &Endpoint, wait: Duration) -> Result<Connection> {
        let mut expired = Vec::new();
        let next = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            let options = self.shared.options;
            let slots = state.endpoints.entry(endpoint.clone()).or_default();
            slots.waiters.retain(|waiter| !waiter.is_closed());

            let mut reusable = None;
            while let Some(connection) = slots.idle.pop_back() {
                if connection.is_idle_too_long(options.max_idle_time) {
                    slots.total = slots.total.saturating_sub(1);
                    expired.push(connection);
                } else {
                    reusable = Some(connection);
                    break;
                }
            }

            match reusable {
                Some(connection) => Next::Ready(connection),
                None if slots.total < options.max_pool_size => {
                    slots.total += 1;
                    Next::Open(SlotGuard::new(self.shared.clone(), endpoint.clone()))
                }
                None if wait.is_zero()
                    || slots.waiters.len() >= options.max_pool_size.saturating_mul(options.wait_queue_multiple) =>
                {
                    debug!("Pool for {} is exhausted ({} waiting)", endpoint, slots.waiters.len());
                    return Err(Error::PoolExhausted {
                        endpoint: endpoint.clone(),
                    });
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    slots.waiters.push_back(tx);
                    Next::Wait(rx)
                }
            }
        };

        for connection in expired {
            debug!("Closing idle connection {} to {}", connection.id(), endpoint);
            connection.close().await;
        }

        match next {
            Next::Ready(mut connection) => {
                connection.touch();
                Ok(connection)
            }
            Next::Open(slot) => self.open(endpoint, slot).await,
            Next::Wait(mut rx) => {
                let grant = match timeout(wait, &mut rx).await {
                    Ok(Ok(grant)) => grant,
                    Ok(Err(_)) => return Err(Error::PoolClosed),
                    Err(_) => {
                        rx.close();
                        match rx.try_recv() {
                            Ok(grant) => grant,
                            Err(_) => {
                                self.prune_waiters(endpoint);
                                debug!("Timed out waiting {:?} for a connection to {}", wait, endpoint);
                                return Err(Error::PoolTimeout {
                                    endpoint: endpoint.clone(),
                                    waited: wait,
                                });
                            }
                        }
                    }
                };
                self.claim(endpoint, grant).await
            }
        }
    }

    fn prune_waiters(&self, endpoint: &Endpoint) {
        let mut state = self.shared.lock();
        if let Some(slots) = state.endpoints.get_mut(endpoint) {
            slots.waiters.retain(|waiter| !waiter.is_closed());
        }
    }

    async fn claim(&self, endpoint: &Endpoint, mut grant: Grant) -> Result<Connection> {
        match grant.connection.take() {
            Some(mut connection) => {
                grant.slot.disarm();
                connection.touch();
                Ok(connection)
            }
            None => {
                let slot = SlotGuard::new(self.shared.clone(), endpoint.clone());
                grant.slot.disarm();
                self.open(endpoint, slot).await
            }
        }
    }

    /// Open a connection into a reserved slot
    async fn open(&self, endpoint: &Endpoint, mut slot: SlotGuard) -> Result<Connection> {
        let connect_timeout = self.shared.options.connect_timeout;
        match self.shared.transport.connect(endpoint, connect_timeout).await {
            Ok(channel) => {
                slot.disarm();
                let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                debug!("Opened connection {} to {}", id, endpoint);
                Ok(Connection::new(id, endpoint.clone(), channel))
            }
            Err(e) => {
                debug!("Failed to open connection to {}: {}", endpoint, e);
                drop(slot);
                Err(NetworkError::from_io(endpoint.clone(), NetworkErrorKind::Connect, e).into())
            }
        }
    }

    /// Return a healthy connection for reuse
    pub async fn checkin(&self, connection: Connection) {
        let endpoint = connection.endpoint().clone();
        if let Some(connection) = self.shared.release(&endpoint, Some(connection)) {
            connection.close().await;
        }
    }

    /// Discard a connection after an I/O or protocol failure
    pub async fn invalidate(&self, connection: Connection) {
        let endpoint = connection.endpoint().clone();
        debug!("Invalidating connection {} to {}", connection.id(), endpoint);
        connection.close().await;
        self.shared.release(&endpoint, None);
    }

    /// Close every idle connection to `endpoint`
    pub async fn clear(&self, endpoint: &Endpoint) {
        let idle: Vec<Connection> = {
            let mut state = self.shared.lock();
            match state.endpoints.get_mut(endpoint) {
                Some(slots) => {
                    slots.total = slots.total.saturating_sub(slots.idle.len());
                    slots.idle.drain(..).collect()
                }
                None => Vec::new(),
            }
        };
        if !idle.is_empty() {
            debug!("Clearing {} idle connection(s) to {}", idle.len(), endpoint);
        }
        for connection in idle {
            connection.close().await;
        }
    }

    /// Close idle connections past `max_idle_time` and open connections
    /// until each of `endpoints` holds `min_pool_size`
    pub async fn maintain(&self, endpoints: &[Endpoint]) {
        let options = self.shared.options;
        let mut expired = Vec::new();
        let mut reserved = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            for slots in state.endpoints.values_mut() {
                let before = slots.idle.len();
                let (keep, old): (Vec<Connection>, Vec<Connection>) = slots
                    .idle
                    .drain(..)
                    .partition(|c| !c.is_idle_too_long(options.max_idle_time));
                slots.idle = keep.into();
                slots.total = slots.total.saturating_sub(before - slots.idle.len());
                expired.extend(old);
            }
            for endpoint in endpoints {
                let slots = state.endpoints.entry(endpoint.clone()).or_default();
                while slots.total < options.min_pool_size {
                    slots.total += 1;
                    reserved.push(SlotGuard::new(self.shared.clone(), endpoint.clone()));
                }
            }
        }

        for connection in expired {
            debug!("Closing idle connection {} to {}", connection.id(), connection.endpoint());
            connection.close().await;
        }

        for slot in reserved {
            let endpoint = slot.endpoint.clone();
            match self.open(&endpoint, slot).await {
                Ok(connection) => self.checkin(connection).await,
                Err(e) => {
                    debug!("Could not fill pool for {}: {}", endpoint, e);
                }
            }
        }
    }

    /// Run [`maintain`](Self::maintain) every `interval` for the
    /// data-bearing endpoints of `topology`, clearing endpoints marked down
    pub fn spawn_maintenance(&self, interval: Duration, topology: Topology) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { shared };
                if pool.shared.lock().closed {
                    break;
                }

                let view = topology.snapshot();
                let mut live = Vec::new();
                for state in view.endpoints() {
                    match state.role {
                        ServerRole::Down => pool.clear(&state.endpoint).await,
                        role if role.is_data_bearing() => live.push(state.endpoint.clone()),
                        _ => {}
                    }
                }
                pool.maintain(&live).await;
            }
        })
    }

    /// Close every idle connection and fail every waiter with
    /// [`Error::PoolClosed`]. Connections checked in later are closed.
    pub async fn close_all(&self) {
        let mut idle = Vec::new();
        let mut waiters = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for slots in state.endpoints.values_mut() {
                slots.total = slots.total.saturating_sub(slots.idle.len());
                idle.extend(slots.idle.drain(..));
                waiters.extend(slots.waiters.drain(..));
            }
        }

        info!(
            "Closing connection pool: {} idle connection(s), {} waiter(s)",
            idle.len(),
            waiters.len()
        );
        drop(waiters);
        for connection in idle {
            connection.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let idle: usize = state.endpoints.values().map(|s| s.idle.len()).sum();
        if idle > 0 && !state.closed {
            warn!("Connection pool dropped with {} idle connection(s) open", idle);
        }
    }
}
