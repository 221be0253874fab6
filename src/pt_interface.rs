use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::pt_error::SendError;

// all ids handed out by the transport share one numeric type
pub type CorrelationId = u64;
pub type SequenceId = u64;

/// Node names are plain strings; several endpoints may live on one node.
pub type NodeName = String;

// ============================================================================
// Endpoints and roles
// ============================================================================

/// A single endpoint on the transport: the node hosting it plus the
/// (namespaced) service or topic name it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId {
    pub node: NodeName,
    pub channel: String,
}

impl EndpointId {
    pub fn new(node: impl Into<NodeName>, channel: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
    Publisher,
    Subscriber,
}

impl Role {
    /// Clients and publishers originate traffic; servers and subscribers react to it.
    pub fn drives_traffic(&self) -> bool {
        matches!(self, Role::Client | Role::Publisher)
    }

    /// The role an endpoint must have to match with this one.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
            Role::Publisher => Role::Subscriber,
            Role::Subscriber => Role::Publisher,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// QoS profile
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Reliable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Keep at most `depth` undelivered samples per reader, dropping the oldest
    KeepLast,
    KeepAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Volatile,
    TransientLocal,
}

/// Delivery guarantees attached to an endpoint when it is created.
///
/// Built once from the experiment configuration and passed by value into
/// every participant; it is never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub history: HistoryPolicy,
    pub depth: usize,
    pub durability: Durability,
    /// When true, channel names are used verbatim instead of being prefixed
    /// with the experiment namespace.
    pub avoid_namespace_conventions: bool,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            reliability: Reliability::Reliable,
            history: HistoryPolicy::KeepLast,
            depth: 10,
            durability: Durability::Volatile,
            avoid_namespace_conventions: false,
        }
    }
}

impl QosProfile {
    /// A reader requesting reliable delivery never matches a best-effort writer.
    pub fn compatible_with(&self, writer: &QosProfile) -> bool {
        !(self.reliability == Reliability::Reliable && writer.reliability == Reliability::BestEffort)
    }

    /// Maximum queued deliveries per reader, `None` when unbounded.
    pub fn queue_limit(&self) -> Option<usize> {
        match self.history {
            HistoryPolicy::KeepLast => Some(self.depth.max(1)),
            HistoryPolicy::KeepAll => None,
        }
    }

    /// Resolve a bare channel name against the experiment namespace.
    pub fn resolve_channel(&self, namespace: &str, name: &str) -> String {
        let ns = namespace.trim_matches('/');
        if self.avoid_namespace_conventions || ns.is_empty() {
            format!("/{}", name.trim_start_matches('/'))
        } else {
            format!("/{}/{}", ns, name.trim_start_matches('/'))
        }
    }
}

// ============================================================================
// Payload classes
// ============================================================================

/// Fixed-size payload presets, selected by their `msg_type` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PayloadClass {
    B10,
    B100,
    B250,
    Kb1,
    Kb10,
    Kb100,
    Kb250,
    Mb1,
    Mb4,
    Mb8,
}

impl PayloadClass {
    pub const ALL: [PayloadClass; 10] = [
        PayloadClass::B10,
        PayloadClass::B100,
        PayloadClass::B250,
        PayloadClass::Kb1,
        PayloadClass::Kb10,
        PayloadClass::Kb100,
        PayloadClass::Kb250,
        PayloadClass::Mb1,
        PayloadClass::Mb4,
        PayloadClass::Mb8,
    ];

    pub fn size_bytes(&self) -> usize {
        match self {
            PayloadClass::B10 => 10,
            PayloadClass::B100 => 100,
            PayloadClass::B250 => 250,
            PayloadClass::Kb1 => 1024,
            PayloadClass::Kb10 => 10 * 1024,
            PayloadClass::Kb100 => 100 * 1024,
            PayloadClass::Kb250 => 250 * 1024,
            PayloadClass::Mb1 => 1024 * 1024,
            PayloadClass::Mb4 => 4 * 1024 * 1024,
            PayloadClass::Mb8 => 8 * 1024 * 1024,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PayloadClass::B10 => "10b",
            PayloadClass::B100 => "100b",
            PayloadClass::B250 => "250b",
            PayloadClass::Kb1 => "1kb",
            PayloadClass::Kb10 => "10kb",
            PayloadClass::Kb100 => "100kb",
            PayloadClass::Kb250 => "250kb",
            PayloadClass::Mb1 => "1mb",
            PayloadClass::Mb4 => "4mb",
            PayloadClass::Mb8 => "8mb",
        }
    }
}

impl Default for PayloadClass {
    fn default() -> Self {
        PayloadClass::B10
    }
}

impl fmt::Display for PayloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PayloadClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PayloadClass::ALL
            .iter()
            .copied()
            .find(|class| class.name() == wanted)
            .ok_or_else(|| format!("unknown msg_type '{}'", s))
    }
}

impl TryFrom<String> for PayloadClass {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PayloadClass> for String {
    fn from(value: PayloadClass) -> Self {
        value.name().to_string()
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Publication,
}

/// What travels over the transport. Only the payload size is carried, the
/// encoding itself belongs to the middleware.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    /// Per-sender sequence number
    pub sequence: SequenceId,
    /// Assigned by the transport for requests, echoed back on responses
    pub correlation: CorrelationId,
    /// Monotonic timestamp taken by the sender right before `send`
    pub sent_at: Instant,
    pub payload_size: usize,
}

/// A message handed to an endpoint by `Transport::poll`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: EndpointId,
    pub message: Message,
    pub received_at: Instant,
}

impl Delivery {
    pub fn latency(&self) -> Duration {
        self.received_at.saturating_duration_since(self.message.sent_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Any server currently matched on the service
    Service(String),
    /// Every matched subscriber on the topic
    Topic(String),
    /// A specific endpoint, used for responses
    Endpoint(EndpointId),
}

#[derive(Debug, Clone)]
pub struct EndpointDesc {
    pub id: EndpointId,
    pub role: Role,
    pub qos: QosProfile,
}

// ============================================================================
// External collaborator interfaces
// ============================================================================

/// Send/receive primitives of the messaging middleware.
///
/// The session object is shared read-only across execution contexts, so every
/// method takes `&self`.
pub trait Transport: Send + Sync {
    fn create_endpoint(&self, endpoint: EndpointDesc);

    /// Requests get a fresh correlation id which is returned; for responses and
    /// publications the message's own correlation id is returned unchanged.
    fn send(
        &self,
        from: &EndpointId,
        destination: &Destination,
        message: Message,
    ) -> Result<CorrelationId, SendError>;

    fn poll(&self, endpoint: &EndpointId) -> Option<Delivery>;
}

/// Liveness/visibility signal exposed by the middleware's own discovery.
pub trait DiscoveryQuery: Send + Sync {
    /// Coarse phase: can `observer` see the node `peer` at all?
    fn participant_visible(&self, observer: &str, peer: &str) -> bool;

    /// Fine phase: has `observer` matched the endpoint `peer`?
    fn endpoint_matched(&self, observer: &EndpointId, peer: &EndpointId) -> bool;
}

// ============================================================================
// Experiment events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPhase {
    Participant,
    Endpoint,
}

impl fmt::Display for DiscoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryPhase::Participant => f.write_str("participant"),
            DiscoveryPhase::Endpoint => f.write_str("endpoint"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DiscoveryPhaseCompleted {
        phase: DiscoveryPhase,
        elapsed: Duration,
    },
    DiscoveryTimedOut {
        phase: DiscoveryPhase,
        missing: usize,
    },
    ExperimentStarted {
        participants: usize,
        degraded: bool,
    },
    ExperimentStopping {
        elapsed: Duration,
    },
    ExperimentReported {
        participants: usize,
    },
}

/// Receives orchestration events, timestamped relative to system creation.
pub trait EventSink {
    fn log(&mut self, elapsed: Duration, event: Event);
}

pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn log(&mut self, _elapsed: Duration, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_class_parsing() {
        assert_eq!("10b".parse::<PayloadClass>(), Ok(PayloadClass::B10));
        assert_eq!("1KB".parse::<PayloadClass>(), Ok(PayloadClass::Kb1));
        assert_eq!(PayloadClass::Mb4.size_bytes(), 4 * 1024 * 1024);
        assert!("3kb".parse::<PayloadClass>().is_err());
    }

    #[test]
    fn test_channel_resolution() {
        let qos = QosProfile::default();
        assert_eq!(qos.resolve_channel("", "service_0"), "/service_0");
        assert_eq!(qos.resolve_channel("/bench/", "topic_1"), "/bench/topic_1");

        let verbatim = QosProfile {
            avoid_namespace_conventions: true,
            ..QosProfile::default()
        };
        assert_eq!(verbatim.resolve_channel("bench", "topic_1"), "/topic_1");
    }

    #[test]
    fn test_reliability_compatibility() {
        let reliable = QosProfile::default();
        let best_effort = QosProfile {
            reliability: Reliability::BestEffort,
            ..QosProfile::default()
        };

        assert!(reliable.compatible_with(&reliable));
        assert!(best_effort.compatible_with(&reliable));
        assert!(!reliable.compatible_with(&best_effort));
    }

    #[test]
    fn test_role_counterparts() {
        assert_eq!(Role::Client.counterpart(), Role::Server);
        assert_eq!(Role::Subscriber.counterpart(), Role::Publisher);
        assert!(Role::Publisher.drives_traffic());
        assert!(!Role::Server.drives_traffic());
    }
}
