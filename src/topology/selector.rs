/// Server selection against a read preference
///
/// Candidates are filtered by mode, then staleness, then tag sets, then cut
/// down to the latency window `[min_rtt, min_rtt + local_threshold]`. The
/// final pick among the survivors is delegated to a [`SelectionStrategy`].
use super::TopologyView;
use crate::core::{Endpoint, EndpointState, Preference, ReadPreferenceMode, ServerRole, TagSet};
use crate::error::{Error, Result};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Final pick among endpoints that survived every filter
pub trait SelectionStrategy: Send + Sync {
    /// Index of the chosen endpoint, or `None` for an empty window
    fn choose(&self, window: &[&EndpointState]) -> Option<usize>;
}

/// Uniform random choice, spreading load across the latency window
#[derive(Debug, Default)]
pub struct RandomChoice;

impl SelectionStrategy for RandomChoice {
    fn choose(&self, window: &[&EndpointState]) -> Option<usize> {
        if window.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..window.len()))
    }
}

/// Deterministic rotation through the window, useful for reproducible runs
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn choose(&self, window: &[&EndpointState]) -> Option<usize> {
        if window.is_empty() {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % window.len())
    }
}

/// Picks one eligible endpoint for a preference
pub struct ServerSelector {
    local_threshold: Duration,
    heartbeat_frequency: Duration,
    strategy: Box<dyn SelectionStrategy>,
}

impl ServerSelector {
    pub fn new(local_threshold: Duration, heartbeat_frequency: Duration) -> Self {
        Self::with_strategy(local_threshold, heartbeat_frequency, Box::new(RandomChoice))
    }

    pub fn with_strategy(
        local_threshold: Duration,
        heartbeat_frequency: Duration,
        strategy: Box<dyn SelectionStrategy>,
    ) -> Self {
        Self {
            local_threshold,
            heartbeat_frequency,
            strategy,
        }
    }

    /// Choose an endpoint or fail with [`Error::NoSuitableServer`]
    pub fn select(&self, view: &TopologyView, preference: &Preference) -> Result<Endpoint> {
        let window = self.latency_window(view, preference);
        self.strategy
            .choose(&window)
            .and_then(|i| window.get(i))
            .map(|state| state.endpoint.clone())
            .ok_or_else(|| Error::NoSuitableServer {
                preference: preference.to_string(),
                waited: Duration::ZERO,
            })
    }

    /// Every endpoint the preference allows, before the latency cut
    pub fn suitable<'a>(&self, view: &'a TopologyView, preference: &Preference) -> Vec<&'a EndpointState> {
        let primaries: Vec<&EndpointState> = view
            .endpoints()
            .filter(|s| s.role == ServerRole::Primary)
            .collect();
        let secondaries = || {
            let fresh = self.filter_stale(view, preference, view.endpoints().filter(|s| s.role == ServerRole::Secondary).collect());
            filter_tags(fresh, &preference.tag_sets)
        };

        match preference.mode {
            ReadPreferenceMode::Primary => primaries,
            ReadPreferenceMode::Secondary => secondaries(),
            ReadPreferenceMode::PrimaryPreferred => {
                if primaries.is_empty() {
                    secondaries()
                } else {
                    primaries
                }
            }
            ReadPreferenceMode::SecondaryPreferred => {
                let candidates = secondaries();
                if candidates.is_empty() {
                    primaries
                } else {
                    candidates
                }
            }
            ReadPreferenceMode::Nearest => {
                let data_bearing = view.endpoints().filter(|s| s.role.is_data_bearing()).collect();
                filter_tags(self.filter_stale(view, preference, data_bearing), &preference.tag_sets)
            }
        }
    }

    /// Suitable endpoints within `local_threshold` of the fastest one
    pub fn latency_window<'a>(&self, view: &'a TopologyView, preference: &Preference) -> Vec<&'a EndpointState> {
        let candidates = self.suitable(view, preference);
        let rtt = |s: &EndpointState| s.round_trip_time.unwrap_or_default();
        let Some(fastest) = candidates.iter().map(|s| rtt(s)).min() else {
            return candidates;
        };
        let limit = fastest + self.local_threshold;
        candidates.into_iter().filter(|s| rtt(s) <= limit).collect()
    }

    /// Drop secondaries whose estimated lag exceeds `max_staleness`.
    /// Primaries always pass; secondaries without write dates are kept.
    fn filter_stale<'a>(
        &self,
        view: &'a TopologyView,
        preference: &Preference,
        candidates: Vec<&'a EndpointState>,
    ) -> Vec<&'a EndpointState> {
        let Some(max_staleness) = preference.max_staleness_duration() else {
            return candidates;
        };

        let primary = view.primary();
        let freshest_secondary = view
            .endpoints()
            .filter(|s| s.role == ServerRole::Secondary)
            .filter_map(|s| s.last_write_date)
            .max();

        candidates
            .into_iter()
            .filter(|s| {
                if s.role != ServerRole::Secondary {
                    return true;
                }
                match self.staleness(s, primary, freshest_secondary) {
                    Some(staleness) => staleness <= max_staleness,
                    None => true,
                }
            })
            .collect()
    }

    fn staleness(
        &self,
        secondary: &EndpointState,
        primary: Option<&EndpointState>,
        freshest_secondary: Option<SystemTime>,
    ) -> Option<Duration> {
        let write = secondary.last_write_date?;
        let lag_ms = match primary {
            Some(primary) => {
                let update_gap = signed_ms_instant(secondary.last_heartbeat_at?, primary.last_heartbeat_at?);
                let write_gap = signed_ms_system(write, primary.last_write_date?);
                update_gap - write_gap
            }
            None => signed_ms_system(freshest_secondary?, write),
        };
        let total = lag_ms + self.heartbeat_frequency.as_millis() as i128;
        Some(Duration::from_millis(total.max(0) as u64))
    }
}

fn signed_ms_instant(a: Instant, b: Instant) -> i128 {
    if a >= b {
        a.duration_since(b).as_millis() as i128
    } else {
        -(b.duration_since(a).as_millis() as i128)
    }
}

fn signed_ms_system(a: SystemTime, b: SystemTime) -> i128 {
    match a.duration_since(b) {
        Ok(d) => d.as_millis() as i128,
        Err(e) => -(e.duration().as_millis() as i128),
    }
}

/// Apply tag sets in order; the first set matching any candidate wins.
/// No tag sets means no filtering.
fn filter_tags<'a>(candidates: Vec<&'a EndpointState>, tag_sets: &[TagSet]) -> Vec<&'a EndpointState> {
    if tag_sets.is_empty() {
        return candidates;
    }
    for tag_set in tag_sets {
        let matching: Vec<&EndpointState> = candidates
            .iter()
            .copied()
            .filter(|s| s.matches_tags(tag_set))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}
