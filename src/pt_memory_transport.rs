// In-process transport for benchmarking the harness itself and for tests
//
// Implements both the send/receive primitives and the discovery signal of the
// messaging middleware. Discovery is simulated with fixed participant and
// endpoint delays counted from endpoint creation; nodes can be hidden to
// model peers that never show up. Best-effort deliveries may be dropped with
// a configurable, seeded probability.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pt_error::SendError;
use crate::pt_interface::{
    CorrelationId, Delivery, Destination, DiscoveryQuery, EndpointDesc, EndpointId, Message,
    MessageKind, NodeName, Reliability, Role, Transport,
};

/// Configuration for the in-memory transport
#[derive(Debug, Clone)]
pub struct MemoryTransportConfig {
    /// Time after a node's first endpoint appears until other nodes see it
    pub participant_discovery_delay: Duration,

    /// Additional time until an endpoint is matched by its counterparts
    pub endpoint_discovery_delay: Duration,

    /// Fixed delay before a queued message can be polled
    pub latency: Duration,

    /// Fraction of best-effort deliveries that are dropped
    pub loss_fraction: f64,

    /// Random seed (None = generate random)
    pub seed: Option<[u8; 32]>,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            participant_discovery_delay: Duration::from_millis(50),
            endpoint_discovery_delay: Duration::from_millis(50),
            latency: Duration::ZERO,
            loss_fraction: 0.0,
            seed: None,
        }
    }
}

impl MemoryTransportConfig {
    /// Get or generate seed
    pub fn resolve_seed(&self) -> [u8; 32] {
        self.seed.unwrap_or_else(|| {
            let mut temp_rng = StdRng::from_entropy();
            let mut seed = [0u8; 32];
            use rand::RngCore;
            temp_rng.fill_bytes(&mut seed);
            seed
        })
    }
}

struct Queued {
    available_at: Instant,
    source: EndpointId,
    message: Message,
}

struct EndpointEntry {
    desc: EndpointDesc,
    created_at: Instant,
    queue: VecDeque<Queued>,
}

struct State {
    nodes: HashMap<NodeName, Instant>,
    endpoints: IndexMap<EndpointId, EndpointEntry>,
    hidden: HashSet<NodeName>,
    rng: StdRng,
    next_correlation: CorrelationId,
    round_robin: HashMap<String, usize>,
    closed: bool,
    dropped: u64,
}

pub struct MemoryTransport {
    config: MemoryTransportConfig,
    seed: [u8; 32],
    state: Mutex<State>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryTransportConfig::default())
    }
}

impl MemoryTransport {
    pub fn new(config: MemoryTransportConfig) -> Self {
        let seed = config.resolve_seed();

        Self {
            config,
            seed,
            state: Mutex::new(State {
                nodes: HashMap::new(),
                endpoints: IndexMap::new(),
                hidden: HashSet::new(),
                rng: StdRng::from_seed(seed),
                next_correlation: 1,
                round_robin: HashMap::new(),
                closed: false,
                dropped: 0,
            }),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    /// Make a node permanently invisible to discovery.
    pub fn hide_node(&self, node: &str) {
        self.lock().hidden.insert(node.to_string());
    }

    /// Reject every subsequent send.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Deliveries waiting for an endpoint, available or not.
    pub fn queued(&self, endpoint: &EndpointId) -> usize {
        self.lock()
            .endpoints
            .get(endpoint)
            .map(|e| e.queue.len())
            .unwrap_or(0)
    }

    /// Deliveries dropped by loss or history overflow.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    // the state is plain data, a poisoned lock is still consistent
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn node_visible(&self, state: &State, node: &str, now: Instant) -> bool {
        if state.hidden.contains(node) {
            return false;
        }
        state
            .nodes
            .get(node)
            .map(|&since| now >= since + self.config.participant_discovery_delay)
            .unwrap_or(false)
    }

    fn matched(&self, state: &State, a: &EndpointId, b: &EndpointId, now: Instant) -> bool {
        let (ea, eb) = match (state.endpoints.get(a), state.endpoints.get(b)) {
            (Some(ea), Some(eb)) => (ea, eb),
            _ => return false,
        };

        if ea.desc.role.counterpart() != eb.desc.role || a.channel != b.channel {
            return false;
        }
        if !self.node_visible(state, &a.node, now) || !self.node_visible(state, &b.node, now) {
            return false;
        }

        let compatible = match ea.desc.role {
            Role::Publisher => eb.desc.qos.compatible_with(&ea.desc.qos),
            Role::Subscriber => ea.desc.qos.compatible_with(&eb.desc.qos),
            // requests and responses flow both ways
            Role::Client | Role::Server => {
                ea.desc.qos.compatible_with(&eb.desc.qos) && eb.desc.qos.compatible_with(&ea.desc.qos)
            }
        };

        let newest = ea.created_at.max(eb.created_at);
        compatible
            && now
                >= newest
                    + self.config.participant_discovery_delay
                    + self.config.endpoint_discovery_delay
    }

    fn enqueue(&self, state: &mut State, from: &EndpointId, to: &EndpointId, message: Message, now: Instant) {
        let best_effort = {
            let sender = state.endpoints.get(from).map(|e| e.desc.qos.reliability);
            let receiver = state.endpoints.get(to).map(|e| e.desc.qos.reliability);
            sender == Some(Reliability::BestEffort) || receiver == Some(Reliability::BestEffort)
        };

        if best_effort
            && self.config.loss_fraction > 0.0
            && state.rng.gen_bool(self.config.loss_fraction.min(1.0))
        {
            state.dropped += 1;
            return;
        }

        let State {
            endpoints, dropped, ..
        } = state;
        if let Some(entry) = endpoints.get_mut(to) {
            entry.queue.push_back(Queued {
                available_at: now + self.config.latency,
                source: from.clone(),
                message,
            });

            if let Some(limit) = entry.desc.qos.queue_limit() {
                while entry.queue.len() > limit {
                    entry.queue.pop_front();
                    *dropped += 1;
                    debug!("{}: history full, dropped oldest", to);
                }
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn create_endpoint(&self, endpoint: EndpointDesc) {
        let now = Instant::now();
        let mut state = self.lock();

        state.nodes.entry(endpoint.id.node.clone()).or_insert(now);
        debug!("endpoint created: {} ({})", endpoint.id, endpoint.role);
        state.endpoints.insert(
            endpoint.id.clone(),
            EndpointEntry {
                desc: endpoint,
                created_at: now,
                queue: VecDeque::new(),
            },
        );
    }

    fn send(
        &self,
        from: &EndpointId,
        destination: &Destination,
        mut message: Message,
    ) -> Result<CorrelationId, SendError> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.closed {
            return Err(SendError::TransportClosed);
        }
        if !state.endpoints.contains_key(from) {
            return Err(SendError::UnknownEndpoint(from.clone()));
        }

        match destination {
            Destination::Service(service) => {
                let servers: Vec<EndpointId> = state
                    .endpoints
                    .iter()
                    .filter(|(id, e)| {
                        e.desc.role == Role::Server && self.matched(&state, from, id, now)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();

                if servers.is_empty() {
                    return Err(SendError::NoMatchedPeer {
                        channel: service.clone(),
                    });
                }

                let next = state.round_robin.entry(service.clone()).or_insert(0);
                let target = servers[*next % servers.len()].clone();
                *next = next.wrapping_add(1);

                if message.kind == MessageKind::Request {
                    message.correlation = state.next_correlation;
                    state.next_correlation += 1;
                }
                let correlation = message.correlation;
                self.enqueue(&mut state, from, &target, message, now);
                Ok(correlation)
            }
            Destination::Topic(_) => {
                let subscribers: Vec<EndpointId> = state
                    .endpoints
                    .iter()
                    .filter(|(id, e)| {
                        e.desc.role == Role::Subscriber && self.matched(&state, from, id, now)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();

                // publishing without readers is not an error
                let correlation = message.correlation;
                for subscriber in subscribers {
                    self.enqueue(&mut state, from, &subscriber, message.clone(), now);
                }
                Ok(correlation)
            }
            Destination::Endpoint(target) => {
                if !self.matched(&state, from, target, now) {
                    return Err(SendError::NoMatchedPeer {
                        channel: target.to_string(),
                    });
                }
                let correlation = message.correlation;
                self.enqueue(&mut state, from, target, message, now);
                Ok(correlation)
            }
        }
    }

    fn poll(&self, endpoint: &EndpointId) -> Option<Delivery> {
        let now = Instant::now();
        let mut state = self.lock();
        let entry = state.endpoints.get_mut(endpoint)?;

        if entry.queue.front()?.available_at > now {
            return None;
        }
        let queued = entry.queue.pop_front()?;

        Some(Delivery {
            source: queued.source,
            message: queued.message,
            received_at: Instant::now(),
        })
    }
}

impl DiscoveryQuery for MemoryTransport {
    fn participant_visible(&self, observer: &str, peer: &str) -> bool {
        let now = Instant::now();
        let state = self.lock();
        self.node_visible(&state, observer, now) && self.node_visible(&state, peer, now)
    }

    fn endpoint_matched(&self, observer: &EndpointId, peer: &EndpointId) -> bool {
        let now = Instant::now();
        let state = self.lock();
        self.matched(&state, observer, peer, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt_interface::{QosProfile, Role};
    use std::thread;

    fn desc(node: &str, channel: &str, role: Role, qos: QosProfile) -> EndpointDesc {
        EndpointDesc {
            id: EndpointId::new(node, channel),
            role,
            qos,
        }
    }

    fn message(kind: MessageKind, sequence: u64) -> Message {
        Message {
            kind,
            sequence,
            correlation: 0,
            sent_at: Instant::now(),
            payload_size: 10,
        }
    }

    fn instant_config() -> MemoryTransportConfig {
        MemoryTransportConfig {
            participant_discovery_delay: Duration::ZERO,
            endpoint_discovery_delay: Duration::ZERO,
            seed: Some([7u8; 32]),
            ..MemoryTransportConfig::default()
        }
    }

    #[test]
    fn test_discovery_delays() {
        let transport = MemoryTransport::new(MemoryTransportConfig {
            participant_discovery_delay: Duration::from_millis(20),
            endpoint_discovery_delay: Duration::from_millis(20),
            ..MemoryTransportConfig::default()
        });
        let client = desc("client_node_0", "/service_0", Role::Client, QosProfile::default());
        let server = desc("server_node_0", "/service_0", Role::Server, QosProfile::default());
        transport.create_endpoint(client.clone());
        transport.create_endpoint(server.clone());

        assert!(!transport.participant_visible("client_node_0", "server_node_0"));
        thread::sleep(Duration::from_millis(25));
        assert!(transport.participant_visible("client_node_0", "server_node_0"));
        assert!(!transport.endpoint_matched(&client.id, &server.id));
        thread::sleep(Duration::from_millis(25));
        assert!(transport.endpoint_matched(&client.id, &server.id));
        assert!(transport.endpoint_matched(&server.id, &client.id));
    }

    #[test]
    fn test_hidden_node_never_visible() {
        let transport = MemoryTransport::new(instant_config());
        transport.create_endpoint(desc("a", "/t", Role::Publisher, QosProfile::default()));
        transport.create_endpoint(desc("b", "/t", Role::Subscriber, QosProfile::default()));
        transport.hide_node("b");

        assert!(!transport.participant_visible("a", "b"));
        assert!(!transport.endpoint_matched(&EndpointId::new("a", "/t"), &EndpointId::new("b", "/t")));
    }

    #[test]
    fn test_reliable_reader_rejects_best_effort_writer() {
        let transport = MemoryTransport::new(instant_config());
        let best_effort = QosProfile {
            reliability: Reliability::BestEffort,
            ..QosProfile::default()
        };
        let writer = desc("p", "/t", Role::Publisher, best_effort);
        let reader = desc("s", "/t", Role::Subscriber, QosProfile::default());
        transport.create_endpoint(writer.clone());
        transport.create_endpoint(reader.clone());

        assert!(!transport.endpoint_matched(&writer.id, &reader.id));
    }

    #[test]
    fn test_request_gets_correlation_and_round_robin() {
        let transport = MemoryTransport::new(instant_config());
        let client = desc("c", "/service_0", Role::Client, QosProfile::default());
        transport.create_endpoint(client.clone());
        transport.create_endpoint(desc("s0", "/service_0", Role::Server, QosProfile::default()));
        transport.create_endpoint(desc("s1", "/service_0", Role::Server, QosProfile::default()));

        let service = Destination::Service("/service_0".to_string());
        let first = transport.send(&client.id, &service, message(MessageKind::Request, 0)).unwrap();
        let second = transport.send(&client.id, &service, message(MessageKind::Request, 1)).unwrap();

        assert_ne!(first, second);
        assert_eq!(transport.queued(&EndpointId::new("s0", "/service_0")), 1);
        assert_eq!(transport.queued(&EndpointId::new("s1", "/service_0")), 1);

        let delivery = transport.poll(&EndpointId::new("s0", "/service_0")).unwrap();
        assert_eq!(delivery.source, client.id);
        assert_eq!(delivery.message.correlation, first);
    }

    #[test]
    fn test_unmatched_service_fails() {
        let transport = MemoryTransport::new(instant_config());
        let client = desc("c", "/service_0", Role::Client, QosProfile::default());
        transport.create_endpoint(client.clone());

        let result = transport.send(
            &client.id,
            &Destination::Service("/service_0".to_string()),
            message(MessageKind::Request, 0),
        );
        assert_eq!(
            result,
            Err(SendError::NoMatchedPeer {
                channel: "/service_0".to_string()
            })
        );

        transport.close();
        let closed = transport.send(
            &client.id,
            &Destination::Service("/service_0".to_string()),
            message(MessageKind::Request, 1),
        );
        assert_eq!(closed, Err(SendError::TransportClosed));
    }

    #[test]
    fn test_keep_last_drops_oldest() {
        let transport = MemoryTransport::new(instant_config());
        let shallow = QosProfile {
            depth: 3,
            ..QosProfile::default()
        };
        let publisher = desc("p", "/t", Role::Publisher, shallow);
        let subscriber = desc("s", "/t", Role::Subscriber, shallow);
        transport.create_endpoint(publisher.clone());
        transport.create_endpoint(subscriber.clone());

        for sequence in 0..5 {
            transport
                .send(&publisher.id, &Destination::Topic("/t".to_string()), message(MessageKind::Publication, sequence))
                .unwrap();
        }

        assert_eq!(transport.queued(&subscriber.id), 3);
        assert_eq!(transport.dropped(), 2);
        assert_eq!(transport.poll(&subscriber.id).unwrap().message.sequence, 2);
    }

    #[test]
    fn test_best_effort_loss() {
        let transport = MemoryTransport::new(MemoryTransportConfig {
            loss_fraction: 0.5,
            ..instant_config()
        });
        let best_effort = QosProfile {
            reliability: Reliability::BestEffort,
            history: crate::pt_interface::HistoryPolicy::KeepAll,
            ..QosProfile::default()
        };
        let publisher = desc("p", "/t", Role::Publisher, best_effort);
        let subscriber = desc("s", "/t", Role::Subscriber, best_effort);
        transport.create_endpoint(publisher.clone());
        transport.create_endpoint(subscriber.clone());

        for sequence in 0..1000 {
            transport
                .send(&publisher.id, &Destination::Topic("/t".to_string()), message(MessageKind::Publication, sequence))
                .unwrap();
        }

        let delivered = transport.queued(&subscriber.id);
        assert_eq!(delivered as u64 + transport.dropped(), 1000);
        assert!((350..650).contains(&delivered), "delivered: {}", delivered);
    }

    #[test]
    fn test_latency_holds_back_delivery() {
        let transport = MemoryTransport::new(MemoryTransportConfig {
            latency: Duration::from_millis(20),
            ..instant_config()
        });
        let publisher = desc("p", "/t", Role::Publisher, QosProfile::default());
        let subscriber = desc("s", "/t", Role::Subscriber, QosProfile::default());
        transport.create_endpoint(publisher.clone());
        transport.create_endpoint(subscriber.clone());

        transport
            .send(&publisher.id, &Destination::Topic("/t".to_string()), message(MessageKind::Publication, 0))
            .unwrap();

        assert!(transport.poll(&subscriber.id).is_none());
        thread::sleep(Duration::from_millis(25));
        let delivery = transport.poll(&subscriber.id).unwrap();
        assert!(delivery.latency() >= Duration::from_millis(20));
    }
}
