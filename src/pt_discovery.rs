// Discovery gate
//
// Blocks until every expected peer link is visible on the transport, in two
// phases: participant (node) visibility first, then endpoint matching. Each
// phase has its own max wait. The gate only reads the discovery signal.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use log::{debug, info, warn};
use serde::Serialize;

use crate::pt_interface::{DiscoveryPhase, DiscoveryQuery, EndpointId, NodeName, Role};

// ============================================================================
// Peer graph
// ============================================================================

/// One directed visibility requirement: `observer` must see `peer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerLink {
    Participant { observer: NodeName, peer: NodeName },
    Endpoint { observer: EndpointId, peer: EndpointId },
}

impl PeerLink {
    pub fn involves(&self, node: &str) -> bool {
        match self {
            PeerLink::Participant { observer, peer } => observer == node || peer == node,
            PeerLink::Endpoint { observer, peer } => observer.node == node || peer.node == node,
        }
    }

    /// Whether this missing participant link rules out an endpoint link
    /// between the same two nodes.
    pub fn blocks(&self, endpoint_link: &PeerLink) -> bool {
        match (self, endpoint_link) {
            (
                PeerLink::Participant { observer, peer },
                PeerLink::Endpoint {
                    observer: eo,
                    peer: ep,
                },
            ) => {
                (observer == &eo.node && peer == &ep.node) || (observer == &ep.node && peer == &eo.node)
            }
            _ => false,
        }
    }

    pub fn is_visible(&self, query: &dyn DiscoveryQuery) -> bool {
        match self {
            PeerLink::Participant { observer, peer } => query.participant_visible(observer, peer),
            PeerLink::Endpoint { observer, peer } => query.endpoint_matched(observer, peer),
        }
    }
}

impl fmt::Display for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerLink::Participant { observer, peer } => write!(f, "{} -> {}", observer, peer),
            PeerLink::Endpoint { observer, peer } => write!(f, "{} -> {}", observer, peer),
        }
    }
}

/// Expected visibility graph, derived from the registered participants and
/// immutable once discovery begins.
#[derive(Debug, Clone, Default)]
pub struct PeerGraph {
    participant_links: IndexSet<PeerLink>,
    endpoint_links: IndexSet<PeerLink>,
}

impl PeerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every client must see every server on its service and every publisher
    /// must see every subscriber on its topic, in both directions.
    pub fn from_endpoints<'a, I>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (&'a EndpointId, Role)>,
    {
        let endpoints: Vec<(&EndpointId, Role)> = endpoints.into_iter().collect();
        let mut graph = Self::new();

        for (a, role_a) in &endpoints {
            if !role_a.drives_traffic() {
                continue;
            }
            for (b, role_b) in &endpoints {
                if *role_b == role_a.counterpart() && a.channel == b.channel {
                    graph.add_pair(a, b);
                }
            }
        }

        graph
    }

    /// Require mutual visibility between two endpoints and their nodes.
    pub fn add_pair(&mut self, a: &EndpointId, b: &EndpointId) {
        if a.node != b.node {
            for (observer, peer) in [(a, b), (b, a)] {
                self.participant_links.insert(PeerLink::Participant {
                    observer: observer.node.clone(),
                    peer: peer.node.clone(),
                });
            }
        }
        for (observer, peer) in [(a, b), (b, a)] {
            self.endpoint_links.insert(PeerLink::Endpoint {
                observer: observer.clone(),
                peer: peer.clone(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participant_links.is_empty() && self.endpoint_links.is_empty()
    }

    pub fn links(&self, phase: DiscoveryPhase) -> impl Iterator<Item = &PeerLink> {
        match phase {
            DiscoveryPhase::Participant => self.participant_links.iter(),
            DiscoveryPhase::Endpoint => self.endpoint_links.iter(),
        }
    }

    /// Links of a phase that are not visible at this polling moment.
    pub fn missing(&self, phase: DiscoveryPhase, query: &dyn DiscoveryQuery) -> Vec<PeerLink> {
        self.links(phase)
            .filter(|link| !link.is_visible(query))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    Ready {
        participant_elapsed: Duration,
        endpoint_elapsed: Duration,
    },
    TimedOut {
        phase: DiscoveryPhase,
        elapsed: Duration,
        /// Links still invisible at the last poll
        missing: Vec<PeerLink>,
    },
}

impl DiscoveryOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, DiscoveryOutcome::Ready { .. })
    }

    pub fn missing(&self) -> &[PeerLink] {
        match self {
            DiscoveryOutcome::Ready { .. } => &[],
            DiscoveryOutcome::TimedOut { missing, .. } => missing,
        }
    }
}

/// Polling parameters of the gate. The defaults poll every 20 ms and give
/// each phase 30 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryGate {
    pub rate: Duration,
    pub participant_max_wait: Duration,
    pub endpoint_max_wait: Duration,
}

impl Default for DiscoveryGate {
    fn default() -> Self {
        Self {
            rate: Duration::from_millis(20),
            participant_max_wait: Duration::from_secs(30),
            endpoint_max_wait: Duration::from_secs(30),
        }
    }
}

impl DiscoveryGate {
    pub fn new(rate: Duration, participant_max_wait: Duration, endpoint_max_wait: Duration) -> Self {
        Self {
            rate,
            participant_max_wait,
            endpoint_max_wait,
        }
    }

    /// Participant phase first, then endpoint phase. When the participant
    /// phase times out, the endpoint phase still runs over the endpoint links
    /// whose nodes did see each other, so reachable pairs are matched before
    /// a degraded run starts. The outcome then names the participant phase
    /// and carries the missing links of both phases.
    pub fn await_discovery(&self, graph: &PeerGraph, query: &dyn DiscoveryQuery) -> DiscoveryOutcome {
        let started = Instant::now();

        let participant_links: Vec<&PeerLink> = graph.links(DiscoveryPhase::Participant).collect();
        let participant = self.wait_phase(
            DiscoveryPhase::Participant,
            &participant_links,
            self.participant_max_wait,
            query,
        );

        let unreachable: Vec<PeerLink> = match &participant {
            Ok(_) => Vec::new(),
            Err(missing) => missing.clone(),
        };
        let endpoint_links: Vec<&PeerLink> = graph
            .links(DiscoveryPhase::Endpoint)
            .filter(|link| !unreachable.iter().any(|m| m.blocks(link)))
            .collect();
        let endpoint = self.wait_phase(
            DiscoveryPhase::Endpoint,
            &endpoint_links,
            self.endpoint_max_wait,
            query,
        );

        match (participant, endpoint) {
            (Ok(participant_elapsed), Ok(endpoint_elapsed)) => DiscoveryOutcome::Ready {
                participant_elapsed,
                endpoint_elapsed,
            },
            (Ok(_), Err(missing)) => DiscoveryOutcome::TimedOut {
                phase: DiscoveryPhase::Endpoint,
                elapsed: started.elapsed(),
                missing,
            },
            (Err(mut missing), _) => {
                // endpoints behind an unreachable node can never match
                missing.extend(graph.missing(DiscoveryPhase::Endpoint, query));
                DiscoveryOutcome::TimedOut {
                    phase: DiscoveryPhase::Participant,
                    elapsed: started.elapsed(),
                    missing,
                }
            }
        }
    }

    /// Poll until every link is visible. Returns the time it took, or the
    /// links still invisible when `max_wait` ran out.
    fn wait_phase(
        &self,
        phase: DiscoveryPhase,
        links: &[&PeerLink],
        max_wait: Duration,
        query: &dyn DiscoveryQuery,
    ) -> Result<Duration, Vec<PeerLink>> {
        let started = Instant::now();
        let expected = links.len();

        loop {
            let missing: Vec<PeerLink> = links
                .iter()
                .filter(|link| !link.is_visible(query))
                .map(|link| (*link).clone())
                .collect();
            let elapsed = started.elapsed();

            if missing.is_empty() {
                info!(
                    "{} discovery complete: {} link(s) in {:?}",
                    phase, expected, elapsed
                );
                return Ok(elapsed);
            }

            if elapsed >= max_wait {
                warn!(
                    "{} discovery timed out after {:?}: {}/{} link(s) missing",
                    phase,
                    elapsed,
                    missing.len(),
                    expected
                );
                return Err(missing);
            }

            debug!("{} discovery: {}/{} link(s) missing", phase, missing.len(), expected);
            thread::sleep(self.rate.min(max_wait - elapsed));
        }
    }
}
