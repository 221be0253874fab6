// Experiment orchestrator
//
// Owns the participants, gates the run on discovery, drives the scheduler for
// the measured window and produces the report. Lifecycle:
//
//   Created -> Configuring -> DiscoveryWait -> Running -> Stopping -> Reported
//                                   \-> Aborted
//
// A system runs at most once.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::pt_discovery::{DiscoveryGate, DiscoveryOutcome, PeerGraph};
use crate::pt_error::ExperimentError;
use crate::pt_interface::{DiscoveryPhase, DiscoveryQuery, Event, EventSink, NoOpSink, Transport};
use crate::pt_latency::LatencyStats;
use crate::pt_participant::{Participant, ParticipantId};
use crate::pt_report::{self, DiscoveryStatus, ExperimentReport};
use crate::pt_scheduler::{sleep_until, ExecutionScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Created,
    Configuring,
    DiscoveryWait,
    Running,
    Stopping,
    Reported,
    Aborted,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Created => "created",
            SystemState::Configuring => "configuring",
            SystemState::DiscoveryWait => "waiting for discovery",
            SystemState::Running => "running",
            SystemState::Stopping => "stopping",
            SystemState::Reported => "reported",
            SystemState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a discovery phase exceeds its max wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Fail the experiment with `ExperimentError::DiscoveryTimeout`
    #[default]
    Abort,
    /// Run anyway and flag the report as discovery-incomplete
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemOptions {
    /// Execution contexts, 0 = one per participant
    pub executors: usize,
    /// Draining window between stop and teardown
    pub grace_period: Duration,
    pub discovery: DiscoveryGate,
    pub on_discovery_timeout: TimeoutPolicy,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            executors: 0,
            grace_period: Duration::from_secs(1),
            discovery: DiscoveryGate::default(),
            on_discovery_timeout: TimeoutPolicy::Abort,
        }
    }
}

pub struct System<T: Transport + DiscoveryQuery + 'static> {
    transport: Arc<T>,
    options: SystemOptions,
    state: SystemState,
    participants: Vec<Participant>,
    created_at: Instant,
    event_sink: Box<dyn EventSink>,
    report: Option<ExperimentReport>,
}

impl<T: Transport + DiscoveryQuery + 'static> System<T> {
    pub fn new(transport: Arc<T>, options: SystemOptions) -> Self {
        Self {
            transport,
            options,
            state: SystemState::Created,
            participants: Vec::new(),
            created_at: Instant::now(),
            event_sink: Box::new(NoOpSink),
            report: None,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    /// Participants in registration order. Empty while the experiment runs,
    /// since the execution contexts own them.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn report(&self) -> Option<&ExperimentReport> {
        self.report.as_ref()
    }

    pub fn enable_events_logger(&mut self, sink: Box<dyn EventSink>) {
        self.event_sink = sink;
    }

    /// Register a participant and create its endpoint on the transport.
    pub fn add_participant(&mut self, participant: Participant) -> Result<(), ExperimentError> {
        match self.state {
            SystemState::Created | SystemState::Configuring => {}
            state => {
                return Err(ExperimentError::InvalidState {
                    state: state.as_str(),
                    operation: "add participants",
                })
            }
        }

        participant.attach(self.transport.as_ref());
        self.participants.push(participant);
        self.state = SystemState::Configuring;
        Ok(())
    }

    pub fn add_participants<I>(&mut self, participants: I) -> Result<(), ExperimentError>
    where
        I: IntoIterator<Item = Participant>,
    {
        for participant in participants {
            self.add_participant(participant)?;
        }
        Ok(())
    }

    /// Wait for discovery, run the measured window of `duration`, drain for
    /// the grace period and build the report.
    pub fn spin(&mut self, duration: Duration) -> Result<&ExperimentReport, ExperimentError> {
        match self.state {
            SystemState::Created | SystemState::Configuring => {}
            state => {
                return Err(ExperimentError::InvalidState {
                    state: state.as_str(),
                    operation: "spin",
                })
            }
        }

        // ====================================================================
        // Discovery
        // ====================================================================

        self.state = SystemState::DiscoveryWait;
        let graph = PeerGraph::from_endpoints(self.participants.iter().map(|p| (p.id(), p.role())));
        let outcome = self
            .options
            .discovery
            .await_discovery(&graph, self.transport.as_ref());

        let degraded = match &outcome {
            DiscoveryOutcome::Ready {
                participant_elapsed,
                endpoint_elapsed,
            } => {
                self.log_event(Event::DiscoveryPhaseCompleted {
                    phase: DiscoveryPhase::Participant,
                    elapsed: *participant_elapsed,
                });
                self.log_event(Event::DiscoveryPhaseCompleted {
                    phase: DiscoveryPhase::Endpoint,
                    elapsed: *endpoint_elapsed,
                });
                false
            }
            DiscoveryOutcome::TimedOut { phase, missing, .. } => {
                self.log_event(Event::DiscoveryTimedOut {
                    phase: *phase,
                    missing: missing.len(),
                });

                match self.options.on_discovery_timeout {
                    TimeoutPolicy::Abort => {
                        self.state = SystemState::Aborted;
                        return Err(ExperimentError::DiscoveryTimeout {
                            phase: *phase,
                            missing: missing.clone(),
                        });
                    }
                    TimeoutPolicy::Continue => {
                        warn!(
                            "continuing with incomplete discovery, {} link(s) missing",
                            missing.len()
                        );
                        true
                    }
                }
            }
        };

        // ====================================================================
        // Measured window
        // ====================================================================

        self.state = SystemState::Running;
        let total = self.participants.len();
        self.log_event(Event::ExperimentStarted {
            participants: total,
            degraded,
        });
        info!(
            "running {} participant(s) for {:?} on {} context(s)",
            total,
            duration,
            ExecutionScheduler::new(self.options.executors).partition(total).len()
        );

        let transport: Arc<dyn Transport> = self.transport.clone();
        let scheduler = ExecutionScheduler::new(self.options.executors);
        let handle = scheduler.start(std::mem::take(&mut self.participants), transport);

        sleep_until(handle.started_at() + duration);

        self.state = SystemState::Stopping;
        handle.stop_ticking();
        self.log_event(Event::ExperimentStopping {
            elapsed: handle.started_at().elapsed(),
        });

        thread::sleep(self.options.grace_period);
        let mut participants = handle.shutdown();

        if participants.len() != total {
            error!(
                "{} of {} participant(s) lost to a failed execution context",
                total - participants.len(),
                total
            );
        }

        // ====================================================================
        // Report
        // ====================================================================

        for participant in &mut participants {
            participant.finalize();
        }

        let report = ExperimentReport::build(&participants, duration, DiscoveryStatus::from(&outcome));
        self.participants = participants;
        self.state = SystemState::Reported;
        self.log_event(Event::ExperimentReported {
            participants: self.participants.len(),
        });

        Ok(&*self.report.insert(report))
    }

    pub fn per_node_stats(&self) -> Vec<(ParticipantId, LatencyStats)> {
        pt_report::per_node_stats(&self.participants)
    }

    pub fn total_stats(&self) -> LatencyStats {
        pt_report::total_stats(&self.participants)
    }

    pub fn save_latency_all_stats(&self, path: &Path) -> Result<(), ExperimentError> {
        self.reported("save stats")?.write_to(path)
    }

    pub fn save_latency_total_stats(&self, path: &Path) -> Result<(), ExperimentError> {
        let report = self.reported("save stats")?;
        let reporting = |source: std::io::Error| ExperimentError::Reporting {
            path: path.to_path_buf(),
            source,
        };

        let mut file = std::fs::File::create(path).map_err(reporting)?;
        report.write_totals(&mut file).map_err(reporting)
    }

    pub fn print_latency_all_stats(&self) -> Result<(), ExperimentError> {
        self.reported("print stats")?.print_summary();
        Ok(())
    }

    pub fn print_latency_total_stats(&self) -> Result<(), ExperimentError> {
        let report = self.reported("print stats")?;
        if let Err(e) = report.write_totals(&mut std::io::stdout()) {
            warn!("failed to print totals: {}", e);
        }
        Ok(())
    }

    fn reported(&self, operation: &'static str) -> Result<&ExperimentReport, ExperimentError> {
        self.report.as_ref().ok_or(ExperimentError::InvalidState {
            state: self.state.as_str(),
            operation,
        })
    }

    fn log_event(&mut self, event: Event) {
        self.event_sink.log(self.created_at.elapsed(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt_events::CollectorEventSink;
    use crate::pt_interface::{EndpointId, PayloadClass, QosProfile, Role};
    use crate::pt_memory_transport::{MemoryTransport, MemoryTransportConfig};
    use crate::pt_report::ReportFlag;

    fn fast_transport() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(MemoryTransportConfig {
            participant_discovery_delay: Duration::from_millis(5),
            endpoint_discovery_delay: Duration::from_millis(5),
            ..MemoryTransportConfig::default()
        }))
    }

    fn fast_options(policy: TimeoutPolicy) -> SystemOptions {
        SystemOptions {
            executors: 0,
            grace_period: Duration::from_millis(100),
            discovery: DiscoveryGate::new(
                Duration::from_millis(2),
                Duration::from_millis(200),
                Duration::from_millis(200),
            ),
            on_discovery_timeout: policy,
        }
    }

    fn participant(node: &str, channel: &str, role: Role, frequency: f64) -> Participant {
        Participant::new(
            EndpointId::new(node, channel),
            role,
            QosProfile::default(),
            PayloadClass::B10,
            frequency,
        )
    }

    fn client_and_servers(system: &mut System<MemoryTransport>) {
        system
            .add_participants([
                participant("client_node_0", "/service_0", Role::Client, 50.0),
                participant("client_node_0", "/service_1", Role::Client, 50.0),
                participant("server_node_0", "/service_0", Role::Server, -1.0),
                participant("server_node_1", "/service_1", Role::Server, -1.0),
            ])
            .unwrap();
    }

    #[test]
    fn test_full_run_reports_every_participant() {
        let mut system = System::new(fast_transport(), fast_options(TimeoutPolicy::Abort));
        let events = CollectorEventSink::new();
        system.enable_events_logger(Box::new(events.clone()));
        client_and_servers(&mut system);
        assert_eq!(system.state(), SystemState::Configuring);

        let report = system.spin(Duration::from_millis(400)).unwrap().clone();
        assert_eq!(system.state(), SystemState::Reported);
        assert_eq!(report.nodes.len(), 4);
        assert!(report.is_clean());

        // every request either answered or still counted at teardown
        let clients: Vec<_> = report.by_role(Role::Client).collect();
        assert_eq!(clients.len(), 2);
        for client in clients {
            let stats = &client.stats;
            assert!(stats.count >= 15, "too few samples: {}", stats.count);
            assert_eq!(stats.sent_count, stats.received_count + stats.lost + stats.send_failures);
        }

        assert_eq!(
            events.names(),
            vec![
                "discovery_phase_completed",
                "discovery_phase_completed",
                "experiment_started",
                "experiment_stopping",
                "experiment_reported",
            ]
        );
        let records = events.events();
        assert!(records.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
        assert_eq!(
            records[2].event,
            Event::ExperimentStarted {
                participants: 4,
                degraded: false,
            }
        );
        assert_eq!(system.per_node_stats().len(), 4);
        assert_eq!(system.total_stats(), report.total);
    }

    #[test]
    fn test_hidden_node_aborts() {
        let transport = fast_transport();
        transport.hide_node("server_node_1");
        let mut system = System::new(transport, fast_options(TimeoutPolicy::Abort));
        client_and_servers(&mut system);

        match system.spin(Duration::from_millis(100)) {
            Err(ExperimentError::DiscoveryTimeout { phase, missing }) => {
                assert_eq!(phase, DiscoveryPhase::Participant);
                assert!(!missing.is_empty());
                assert!(missing.iter().all(|l| l.involves("server_node_1")));
            }
            other => panic!("expected discovery timeout, got {:?}", other.map(|_| ())),
        }
        assert_eq!(system.state(), SystemState::Aborted);
        assert!(system.report().is_none());
    }

    #[test]
    fn test_hidden_node_continue_keeps_reachable_pair_whole() {
        // endpoints match well after the node phase has given up
        let transport = Arc::new(MemoryTransport::new(MemoryTransportConfig {
            participant_discovery_delay: Duration::from_millis(5),
            endpoint_discovery_delay: Duration::from_millis(300),
            ..MemoryTransportConfig::default()
        }));
        transport.hide_node("server_node_1");
        let options = SystemOptions {
            discovery: DiscoveryGate::new(
                Duration::from_millis(5),
                Duration::from_millis(100),
                Duration::from_secs(2),
            ),
            ..fast_options(TimeoutPolicy::Continue)
        };
        let mut system = System::new(transport, options);
        client_and_servers(&mut system);

        let report = system.spin(Duration::from_millis(400)).unwrap();
        assert!(report.flags.contains(&ReportFlag::DiscoveryIncomplete));
        assert!(!report.discovery.complete);
        assert_eq!(report.discovery.timed_out_phase, Some(DiscoveryPhase::Participant));
        assert!(report
            .discovery
            .missing
            .iter()
            .any(|l| l.contains("server_node_1:/service_1")));

        let reachable = report
            .nodes
            .iter()
            .find(|n| n.endpoint == "/service_0" && n.role == Role::Client)
            .unwrap();
        assert!(reachable.stats.count >= 15);
        assert_eq!(reachable.stats.send_failures, 0);
        assert_eq!(reachable.stats.sent_count, reachable.stats.received_count);

        let unreachable = report
            .nodes
            .iter()
            .find(|n| n.endpoint == "/service_1" && n.role == Role::Client)
            .unwrap();
        assert_eq!(unreachable.stats.send_failures, unreachable.stats.sent_count);
    }

    #[test]
    fn test_shared_context_loses_nothing() {
        let options = SystemOptions {
            executors: 1,
            ..fast_options(TimeoutPolicy::Abort)
        };
        let mut system = System::new(fast_transport(), options);
        client_and_servers(&mut system);

        let report = system.spin(Duration::from_millis(400)).unwrap();
        assert!(report.is_clean());

        let mut requests = 0;
        for client in report.by_role(Role::Client) {
            assert!(client.stats.count >= 15);
            assert_eq!(client.stats.sent_count, client.stats.received_count);
            assert_eq!(client.stats.lost, 0);
            requests += client.stats.sent_count;
        }
        let served: u64 = report.by_role(Role::Server).map(|s| s.stats.received_count).sum();
        assert_eq!(served, requests);
    }

    #[test]
    fn test_cannot_spin_or_add_after_report() {
        let mut system = System::new(fast_transport(), fast_options(TimeoutPolicy::Abort));
        client_and_servers(&mut system);
        system.spin(Duration::from_millis(50)).unwrap();

        assert!(matches!(
            system.spin(Duration::from_millis(50)),
            Err(ExperimentError::InvalidState { operation: "spin", .. })
        ));
        assert!(matches!(
            system.add_participant(participant("late_node", "/service_0", Role::Client, 10.0)),
            Err(ExperimentError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_saving_before_report_is_invalid() {
        let system = System::new(fast_transport(), SystemOptions::default());
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            system.save_latency_all_stats(&dir.path().join("all.txt")),
            Err(ExperimentError::InvalidState { .. })
        ));
        assert!(matches!(
            system.print_latency_total_stats(),
            Err(ExperimentError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_save_stats_files() {
        let mut system = System::new(fast_transport(), fast_options(TimeoutPolicy::Abort));
        client_and_servers(&mut system);
        system.spin(Duration::from_millis(100)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let all = dir.path().join("all.txt");
        let totals = dir.path().join("total.txt");
        system.save_latency_all_stats(&all).unwrap();
        system.save_latency_total_stats(&totals).unwrap();

        let all_text = std::fs::read_to_string(&all).unwrap();
        let total_text = std::fs::read_to_string(&totals).unwrap();
        assert!(all_text.contains("client_node_0"));
        assert!(total_text.lines().nth(1).unwrap().starts_with("total"));
        assert!(!total_text.contains("client_node_0"));
    }
}
