/// Versioned topology snapshots
///
/// [`Topology`] owns the current [`TopologyView`] behind a `watch` channel.
/// Every mutation builds a fresh view with `version + 1` and swaps it in, so
/// readers always hold a complete snapshot and never a partially updated one.
pub mod selector;

use crate::core::{Endpoint, EndpointState, ServerRole};
use crate::utils::ewma;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{watch, Notify};

pub use selector::ServerSelector;

/// Immutable snapshot of every known endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyView {
    version: u64,
    endpoints: BTreeMap<Endpoint, EndpointState>,
}

impl TopologyView {
    pub fn new<I: IntoIterator<Item = EndpointState>>(version: u64, states: I) -> Self {
        Self {
            version,
            endpoints: states
                .into_iter()
                .map(|state| (state.endpoint.clone(), state))
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&EndpointState> {
        self.endpoints.get(endpoint)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains_key(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointState> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn primary(&self) -> Option<&EndpointState> {
        self.endpoints().find(|s| s.role == ServerRole::Primary)
    }

    /// True when at least one endpoint has been classified
    pub fn has_known_servers(&self) -> bool {
        self.endpoints().any(|s| s.role.is_data_bearing())
    }
}

/// What a server reported in a successful heartbeat
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerDescription {
    pub role: Option<ServerRole>,
    pub tags: BTreeMap<String, String>,
    /// Members the server advertises (`hosts` and `passives`)
    pub hosts: Vec<Endpoint>,
    pub last_write_date: Option<SystemTime>,
}

/// The result of one heartbeat
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Success {
        round_trip_time: Duration,
        description: ServerDescription,
    },
    Failure {
        reason: String,
    },
}

/// A role change caused by an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleChange {
    pub from: ServerRole,
    pub to: ServerRole,
}

struct Shared {
    current: watch::Sender<Arc<TopologyView>>,
    check_requested: Notify,
}

/// Live topology shared by the monitor, the selector and the dispatcher
#[derive(Clone)]
pub struct Topology {
    shared: Arc<Shared>,
}

impl Topology {
    /// Start from a seed list; every seed begins as Unknown at version 0
    pub fn new<I: IntoIterator<Item = Endpoint>>(seeds: I) -> Self {
        let view = TopologyView::new(0, seeds.into_iter().map(EndpointState::new));
        let (current, _) = watch::channel(Arc::new(view));
        Self {
            shared: Arc::new(Shared {
                current,
                check_requested: Notify::new(),
            }),
        }
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<TopologyView> {
        self.shared.current.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyView>> {
        self.shared.current.subscribe()
    }

    /// Ask every monitor to run a heartbeat now, subject to its minimum spacing
    pub fn request_check(&self) {
        self.shared.check_requested.notify_waiters();
    }

    pub(crate) async fn check_requested(&self) {
        self.shared.check_requested.notified().await;
    }

    /// Build and publish the next view. `mutate` sees a private copy of the
    /// endpoint map; the result gets version `previous + 1`.
    fn publish<F, R>(&self, mutate: F) -> R
    where
        F: FnOnce(&mut BTreeMap<Endpoint, EndpointState>) -> R,
        R: Default,
    {
        let mut result = R::default();
        self.shared.current.send_modify(|view| {
            let mut endpoints = view.endpoints.clone();
            result = mutate(&mut endpoints);
            *view = Arc::new(TopologyView {
                version: view.version + 1,
                endpoints,
            });
        });
        result
    }

    /// Fold one heartbeat outcome into the endpoint's state and publish.
    ///
    /// Returns the role change, if any. Observations for endpoints no longer
    /// in the topology are dropped without publishing.
    pub fn apply_observation(
        &self,
        endpoint: &Endpoint,
        observation: Observation,
        failure_threshold: u32,
    ) -> Option<RoleChange> {
        if !self.snapshot().contains(endpoint) {
            return None;
        }

        self.publish(|endpoints| {
            let state = endpoints.get_mut(endpoint)?;
            let from = state.role;
            state.last_heartbeat_at = Some(Instant::now());

            match observation {
                Observation::Success {
                    round_trip_time,
                    description,
                } => {
                    state.consecutive_failures = 0;
                    state.role = description.role.unwrap_or(ServerRole::Unknown);
                    state.round_trip_time = Some(ewma(state.round_trip_time, round_trip_time));
                    state.tags = description.tags;
                    state.last_write_date = description.last_write_date;
                }
                Observation::Failure { .. } => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    if state.consecutive_failures >= failure_threshold {
                        state.role = ServerRole::Down;
                        state.round_trip_time = None;
                    }
                }
            }

            (from != state.role).then_some(RoleChange { from, to: state.role })
        })
    }

    /// Force an endpoint into the Down role
    pub fn mark_down(&self, endpoint: &Endpoint) {
        self.publish(|endpoints| {
            if let Some(state) = endpoints.get_mut(endpoint) {
                state.role = ServerRole::Down;
                state.round_trip_time = None;
            }
        });
    }

    /// Replace the state of one endpoint, adding it if unknown
    pub fn set_state(&self, state: EndpointState) {
        self.publish(|endpoints| {
            endpoints.insert(state.endpoint.clone(), state);
        });
    }

    /// Add endpoints discovered through a server's host list.
    ///
    /// Returns only the endpoints that were not known before; publishes only
    /// when there is at least one.
    pub fn add_endpoints<I: IntoIterator<Item = Endpoint>>(&self, candidates: I) -> Vec<Endpoint> {
        let snapshot = self.snapshot();
        let mut fresh: Vec<Endpoint> = candidates
            .into_iter()
            .filter(|e| !snapshot.contains(e))
            .collect();
        fresh.sort();
        fresh.dedup();
        if fresh.is_empty() {
            return fresh;
        }

        self.publish(|endpoints| {
            let mut added = Vec::with_capacity(fresh.len());
            for endpoint in fresh {
                if !endpoints.contains_key(&endpoint) {
                    endpoints.insert(endpoint.clone(), EndpointState::new(endpoint.clone()));
                    added.push(endpoint);
                }
            }
            added
        })
    }

    /// Drop an endpoint from the topology
    pub fn remove_endpoint(&self, endpoint: &Endpoint) -> bool {
        if !self.snapshot().contains(endpoint) {
            return false;
        }
        self.publish(|endpoints| endpoints.remove(endpoint).is_some())
    }
}
