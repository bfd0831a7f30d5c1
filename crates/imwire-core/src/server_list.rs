//! Server list and failover selection
//!
//! Holds the ordered endpoint candidates (insertion order is preference),
//! per-endpoint health, and the last connected/disconnected addresses.
//! Failed endpoints are skipped for a cool-down window; when every entry is
//! cooling down the one whose window ends soonest is picked.
//!
//! Time-dependent operations have `*_at` variants taking the current instant
//! so callers running on a virtual clock can drive them.

use core::time::Duration;
use hashbrown::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::types::{Endpoint, Timestamp};

// ----------------------------------------------------------------------------
// Endpoint Status
// ----------------------------------------------------------------------------

/// Health bookkeeping for one endpoint
#[derive(Debug, Clone, Default)]
pub struct EndpointStatus {
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Timestamp>,
}

impl EndpointStatus {
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.last_success = Some(Timestamp::now());
    }

    fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
    }

    /// End of the cool-down window, if the endpoint is cooling down at `now`
    fn cooling_until(&self, cooldown: Duration, now: Instant) -> Option<Instant> {
        let until = self.last_failure? + cooldown;
        (until > now).then_some(until)
    }
}

// ----------------------------------------------------------------------------
// Server List
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerList {
    endpoints: Vec<Endpoint>,
    status: HashMap<Endpoint, EndpointStatus>,
    failure_cooldown: Duration,
    last_connected: Option<Endpoint>,
    last_disconnected: Option<Endpoint>,
}

impl ServerList {
    pub fn new(endpoints: Vec<Endpoint>, failure_cooldown: Duration) -> Self {
        let mut list = Self {
            endpoints: Vec::new(),
            status: HashMap::new(),
            failure_cooldown,
            last_connected: None,
            last_disconnected: None,
        };
        list.set_endpoints(endpoints);
        list
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn status(&self, endpoint: &Endpoint) -> Option<&EndpointStatus> {
        self.status.get(endpoint)
    }

    /// Host of the last endpoint a connection was established to; empty until then
    pub fn last_connected_ip(&self) -> &str {
        self.last_connected.as_ref().map_or("", Endpoint::host)
    }

    /// Host of the last endpoint a connection was lost from; empty until then
    pub fn last_disconnected_ip(&self) -> &str {
        self.last_disconnected.as_ref().map_or("", Endpoint::host)
    }

    pub fn last_connected(&self) -> Option<&Endpoint> {
        self.last_connected.as_ref()
    }

    pub fn last_disconnected(&self) -> Option<&Endpoint> {
        self.last_disconnected.as_ref()
    }

    /// Pick the endpoint to try next
    pub fn next(&self) -> Option<Endpoint> {
        self.next_at(Instant::now())
    }

    pub fn next_at(&self, now: Instant) -> Option<Endpoint> {
        let mut soonest: Option<(&Endpoint, Instant)> = None;

        for endpoint in &self.endpoints {
            let cooling = self
                .status
                .get(endpoint)
                .and_then(|status| status.cooling_until(self.failure_cooldown, now));

            match cooling {
                None => return Some(endpoint.clone()),
                Some(until) => {
                    if soonest.map_or(true, |(_, best)| until < best) {
                        soonest = Some((endpoint, until));
                    }
                }
            }
        }

        soonest.map(|(endpoint, until)| {
            debug!(%endpoint, wait = ?until.saturating_duration_since(now), "every endpoint is cooling down");
            endpoint.clone()
        })
    }

    pub fn record_connected(&mut self, endpoint: &Endpoint) {
        self.status.entry(endpoint.clone()).or_default().record_success();
        self.last_connected = Some(endpoint.clone());
    }

    pub fn record_disconnected(&mut self, endpoint: &Endpoint) {
        self.last_disconnected = Some(endpoint.clone());
    }

    pub fn record_failure(&mut self, endpoint: &Endpoint) {
        self.record_failure_at(endpoint, Instant::now());
    }

    pub fn record_failure_at(&mut self, endpoint: &Endpoint, now: Instant) {
        self.status
            .entry(endpoint.clone())
            .or_default()
            .record_failure(now);
    }

    /// Replace the candidates; an empty update keeps the current list
    ///
    /// Returns whether the list changed.
    pub fn replace_list(&mut self, endpoints: Vec<Endpoint>) -> bool {
        if endpoints.is_empty() {
            debug!("ignoring empty server list update");
            return false;
        }
        info!(count = endpoints.len(), "server list replaced");
        self.set_endpoints(endpoints);
        true
    }

    fn set_endpoints(&mut self, endpoints: Vec<Endpoint>) {
        let mut unique: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(&endpoint) {
                unique.push(endpoint);
            }
        }
        self.status.retain(|endpoint, _| unique.contains(endpoint));
        self.endpoints = unique;
    }
}
