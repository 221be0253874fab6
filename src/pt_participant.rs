// Benchmark participants: one client, server, publisher or subscriber endpoint
//
// A participant is owned by exactly one execution context while the experiment
// runs, which makes it the single writer of its latency recorder.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::{debug, warn};

use crate::pt_interface::{
    CorrelationId, Delivery, Destination, EndpointDesc, EndpointId, Message, MessageKind,
    PayloadClass, QosProfile, Role, SequenceId, Transport,
};
use crate::pt_latency::{LatenessThresholds, LatencyRecorder, Sample};
use crate::pt_scheduler::Schedulable;

/// Participants are identified by the endpoint they own.
pub type ParticipantId = EndpointId;

pub struct Participant {
    desc: EndpointDesc,
    payload: PayloadClass,
    /// Target invocation frequency in Hz, `<= 0` means event-driven only
    frequency: f64,
    recorder: LatencyRecorder,
    next_sequence: SequenceId,

    /// Client: requests in flight, by transport correlation id
    pending: HashMap<CorrelationId, (SequenceId, Instant)>,

    /// Subscriber: last sequence seen from each publisher
    last_seen: HashMap<EndpointId, SequenceId>,
}

impl Participant {
    pub fn new(
        id: EndpointId,
        role: Role,
        qos: QosProfile,
        payload: PayloadClass,
        frequency: f64,
    ) -> Self {
        let period = period_of(frequency);

        Self {
            desc: EndpointDesc { id, role, qos },
            payload,
            frequency,
            recorder: LatencyRecorder::new(LatenessThresholds::for_period(period)),
            next_sequence: 0,
            pending: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.desc.id
    }

    pub fn role(&self) -> Role {
        self.desc.role
    }

    pub fn payload(&self) -> PayloadClass {
        self.payload
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn recorder(&self) -> &LatencyRecorder {
        &self.recorder
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Register this participant's endpoint with the transport.
    pub fn attach(&self, transport: &dyn Transport) {
        transport.create_endpoint(self.desc.clone());
    }

    /// Close the books once no more events will be processed: every request
    /// still waiting for a response is counted as lost.
    pub fn finalize(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                "{}: {} request(s) unanswered at teardown",
                self.desc.id,
                self.pending.len()
            );
            self.recorder.record_lost(self.pending.len() as u64);
            self.pending.clear();
        }
    }

    fn next_message(&mut self, kind: MessageKind, correlation: CorrelationId) -> Message {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Message {
            kind,
            sequence,
            correlation,
            sent_at: Instant::now(),
            payload_size: self.payload.size_bytes(),
        }
    }

    fn send_request(&mut self, transport: &dyn Transport) {
        let destination = Destination::Service(self.desc.id.channel.clone());
        let message = self.next_message(MessageKind::Request, 0);
        let (sequence, sent_at) = (message.sequence, message.sent_at);

        self.recorder.record_sent();
        match transport.send(&self.desc.id, &destination, message) {
            Ok(correlation) => {
                self.pending.insert(correlation, (sequence, sent_at));
            }
            Err(e) => {
                warn!("{}: request {} failed: {}", self.desc.id, sequence, e);
                self.recorder.record_send_failure();
            }
        }
    }

    fn publish(&mut self, transport: &dyn Transport) {
        let destination = Destination::Topic(self.desc.id.channel.clone());
        let message = self.next_message(MessageKind::Publication, 0);
        let sequence = message.sequence;

        self.recorder.record_sent();
        if let Err(e) = transport.send(&self.desc.id, &destination, message) {
            warn!("{}: publish {} failed: {}", self.desc.id, sequence, e);
            self.recorder.record_send_failure();
        }
    }

    fn handle(&mut self, delivery: Delivery, transport: &dyn Transport) {
        match (self.desc.role, delivery.message.kind) {
            (Role::Server, MessageKind::Request) => self.serve(delivery, transport),
            (Role::Client, MessageKind::Response) => self.complete_request(delivery),
            (Role::Subscriber, MessageKind::Publication) => self.receive_publication(delivery),
            (role, kind) => {
                debug!(
                    "{}: {} ignoring unexpected {:?} from {}",
                    self.desc.id, role, kind, delivery.source
                );
            }
        }
    }

    fn serve(&mut self, request: Delivery, transport: &dyn Transport) {
        let message = &request.message;
        self.recorder
            .record(Sample::new(message.sent_at, request.received_at, message.sequence));

        let response = self.next_message(MessageKind::Response, message.correlation);
        let sequence = response.sequence;

        self.recorder.record_sent();
        if let Err(e) = transport.send(
            &self.desc.id,
            &Destination::Endpoint(request.source.clone()),
            response,
        ) {
            warn!("{}: response {} failed: {}", self.desc.id, sequence, e);
            self.recorder.record_send_failure();
        }
    }

    fn complete_request(&mut self, response: Delivery) {
        match self.pending.remove(&response.message.correlation) {
            Some((sequence, sent_at)) => {
                self.recorder
                    .record(Sample::new(sent_at, response.received_at, sequence));
            }
            None => debug!(
                "{}: response for unknown request {}",
                self.desc.id, response.message.correlation
            ),
        }
    }

    fn receive_publication(&mut self, delivery: Delivery) {
        let sequence = delivery.message.sequence;

        // the first message from a publisher sets the baseline
        if let Some(&last) = self.last_seen.get(&delivery.source) {
            if sequence > last + 1 {
                self.recorder.record_lost(sequence - last - 1);
            }
        }
        let last = self.last_seen.entry(delivery.source.clone()).or_insert(sequence);
        *last = (*last).max(sequence);

        self.recorder.record(Sample::new(
            delivery.message.sent_at,
            delivery.received_at,
            sequence,
        ));
    }
}

impl Schedulable for Participant {
    fn period(&self) -> Option<Duration> {
        period_of(self.frequency)
    }

    fn event_driven(&self) -> bool {
        self.desc.role.drives_traffic() || self.period().is_none()
    }

    fn dispatch_one(&mut self, transport: &dyn Transport) -> bool {
        match transport.poll(&self.desc.id) {
            Some(delivery) => {
                self.handle(delivery, transport);
                true
            }
            None => false,
        }
    }

    fn tick(&mut self, transport: &dyn Transport) {
        match self.desc.role {
            Role::Client => self.send_request(transport),
            Role::Publisher => self.publish(transport),
            // polled roles drain what arrived since the last tick
            Role::Server | Role::Subscriber => while self.dispatch_one(transport) {},
        }
    }
}

/// Timer period for a frequency in Hz. `None` for zero, negative or
/// non-finite frequencies and for periods too long to represent.
pub fn period_of(frequency: f64) -> Option<Duration> {
    if frequency.is_finite() && frequency > 0.0 {
        Duration::try_from_secs_f64(1.0 / frequency).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt_memory_transport::{MemoryTransport, MemoryTransportConfig};

    fn instant_transport() -> MemoryTransport {
        MemoryTransport::new(MemoryTransportConfig {
            participant_discovery_delay: Duration::ZERO,
            endpoint_discovery_delay: Duration::ZERO,
            ..MemoryTransportConfig::default()
        })
    }

    fn participant(node: &str, channel: &str, role: Role, frequency: f64) -> Participant {
        Participant::new(
            EndpointId::new(node, channel),
            role,
            QosProfile::default(),
            PayloadClass::B100,
            frequency,
        )
    }

    #[test]
    fn test_period_of() {
        assert_eq!(period_of(10.0), Some(Duration::from_millis(100)));
        assert_eq!(period_of(0.0), None);
        assert_eq!(period_of(-1.0), None);
        assert_eq!(period_of(f64::NAN), None);
        assert_eq!(period_of(1e-20), None);
        assert_eq!(period_of(1e-3), Some(Duration::from_secs(1000)));
    }

    #[test]
    fn test_request_response_exchange() {
        let transport = instant_transport();
        let mut client = participant("client_node_0", "/service_0", Role::Client, 10.0);
        let mut server = participant("server_node_0", "/service_0", Role::Server, -1.0);
        client.attach(&transport);
        server.attach(&transport);

        client.tick(&transport);
        client.tick(&transport);
        assert_eq!(client.in_flight(), 2);

        assert!(server.dispatch_one(&transport));
        assert!(server.dispatch_one(&transport));
        assert!(!server.dispatch_one(&transport));

        while client.dispatch_one(&transport) {}

        let client_stats = client.recorder().compute_stats();
        let server_stats = server.recorder().compute_stats();
        assert_eq!(client_stats.sent_count, 2);
        assert_eq!(client_stats.received_count, 2);
        assert_eq!(client_stats.count, 2);
        assert_eq!(server_stats.received_count, 2);
        assert_eq!(server_stats.sent_count, 2);
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_unmatched_request_is_a_counted_failure() {
        let transport = instant_transport();
        let mut client = participant("client_node_0", "/service_9", Role::Client, 10.0);
        client.attach(&transport);

        client.tick(&transport);

        let stats = client.recorder().compute_stats();
        assert_eq!(stats.sent_count, 1);
        assert_eq!(stats.send_failures, 1);
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_unanswered_requests_are_lost_at_finalize() {
        let transport = instant_transport();
        let mut client = participant("client_node_0", "/service_0", Role::Client, 10.0);
        let server = participant("server_node_0", "/service_0", Role::Server, -1.0);
        client.attach(&transport);
        server.attach(&transport);

        client.tick(&transport);
        client.tick(&transport);
        client.finalize();

        let stats = client.recorder().compute_stats();
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.received_count, 0);
    }

    #[test]
    fn test_subscriber_detects_sequence_gaps() {
        let mut subscriber = participant("sub_node_0", "/topic_0", Role::Subscriber, -1.0);
        let source = EndpointId::new("pub_node_0", "/topic_0");
        let now = Instant::now();

        for sequence in [3u64, 4, 7, 8] {
            subscriber.receive_publication(Delivery {
                source: source.clone(),
                message: Message {
                    kind: MessageKind::Publication,
                    sequence,
                    correlation: 0,
                    sent_at: now,
                    payload_size: 100,
                },
                received_at: now + Duration::from_micros(50),
            });
        }

        let stats = subscriber.recorder().compute_stats();
        assert_eq!(stats.received_count, 4);
        assert_eq!(stats.lost, 2);
    }

    #[test]
    fn test_polled_server_drains_on_tick() {
        let transport = instant_transport();
        let mut client = participant("client_node_0", "/service_0", Role::Client, 10.0);
        let mut server = participant("server_node_0", "/service_0", Role::Server, 5.0);
        client.attach(&transport);
        server.attach(&transport);

        assert!(!server.event_driven());
        assert!(client.event_driven());

        for _ in 0..3 {
            client.tick(&transport);
        }
        server.tick(&transport);

        assert_eq!(server.recorder().compute_stats().received_count, 3);
    }
}
