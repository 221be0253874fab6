// Experiment entry points: turn an `ExperimentConfig` into participants on a
// transport, run it and persist the report.
//
// Naming follows a fixed scheme so reports are comparable across runs:
//
// | role       | node            | endpoint channel          |
// |------------|-----------------|---------------------------|
// | client     | `client_node_i` | one per `service_j`       |
// | server     | `server_node_j` | `service_j`               |
// | publisher  | `pub_node_k`    | `topic_k`                 |
// | subscriber | `sub_node_m`    | one per `topic_k`         |

use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::pt_config::ExperimentConfig;
use crate::pt_error::ExperimentError;
use crate::pt_interface::{DiscoveryQuery, EndpointId, EventSink, Role, Transport};
use crate::pt_participant::Participant;
use crate::pt_report::ExperimentReport;
use crate::pt_system::System;

pub fn service_name(index: usize) -> String {
    format!("service_{}", index)
}

pub fn topic_name(index: usize) -> String {
    format!("topic_{}", index)
}

/// Every participant an experiment needs, in registration order: clients,
/// servers, publishers, subscribers.
pub fn build_participants(config: &ExperimentConfig) -> Vec<Participant> {
    let frequencies = config.role_frequencies();
    let channel = |name: String| config.qos.resolve_channel(&config.namespace, &name);
    let make = |node: String, endpoint: String, role: Role| {
        Participant::new(
            EndpointId::new(node, endpoint),
            role,
            config.qos,
            config.msg_type,
            frequencies.for_role(role),
        )
    };

    let mut participants = Vec::with_capacity(config.total_participants());

    for i in 0..config.n_clients {
        for j in 0..config.n_services {
            participants.push(make(format!("client_node_{}", i), channel(service_name(j)), Role::Client));
        }
    }
    for j in 0..config.n_services {
        participants.push(make(format!("server_node_{}", j), channel(service_name(j)), Role::Server));
    }
    for k in 0..config.n_publishers {
        participants.push(make(format!("pub_node_{}", k), channel(topic_name(k)), Role::Publisher));
    }
    for m in 0..config.n_subscribers {
        for k in 0..config.n_publishers {
            participants.push(make(format!("sub_node_{}", m), channel(topic_name(k)), Role::Subscriber));
        }
    }

    participants
}

/// A configured, not yet necessarily run, experiment.
pub struct ExperimentHandle<T: Transport + DiscoveryQuery + 'static> {
    config: ExperimentConfig,
    system: System<T>,
}

impl<T: Transport + DiscoveryQuery + 'static> ExperimentHandle<T> {
    pub fn enable_events_logger(&mut self, sink: Box<dyn EventSink>) {
        self.system.enable_events_logger(sink);
    }

    pub fn report(&self) -> Option<&ExperimentReport> {
        self.system.report()
    }
}

/// Validate `config` and register its participants on `transport`.
pub fn configure<T>(config: ExperimentConfig, transport: Arc<T>) -> Result<ExperimentHandle<T>, ExperimentError>
where
    T: Transport + DiscoveryQuery + 'static,
{
    config.validate()?;

    let mut system = System::new(transport, config.system_options());
    system.add_participants(build_participants(&config))?;

    info!(
        "configured {} participant(s): {} client(s), {} service(s), {} publisher(s), {} subscriber(s), payload {}",
        system.participants().len(),
        config.n_clients,
        config.n_services,
        config.n_publishers,
        config.n_subscribers,
        config.msg_type
    );

    Ok(ExperimentHandle { config, system })
}

/// Run the experiment to completion. Fails with `DiscoveryTimeout` under the
/// abort policy; a handle runs at most once.
pub fn run<T>(handle: &mut ExperimentHandle<T>) -> Result<&ExperimentReport, ExperimentError>
where
    T: Transport + DiscoveryQuery + 'static,
{
    let duration = handle.config.duration();
    handle.system.spin(duration)
}

pub fn write_report<T>(handle: &ExperimentHandle<T>, path: &Path) -> Result<(), ExperimentError>
where
    T: Transport + DiscoveryQuery + 'static,
{
    match handle.report() {
        Some(report) => report.write_to(path),
        None => Err(ExperimentError::InvalidState {
            state: handle.system.state().as_str(),
            operation: "write a report",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pt_config::DiscoveryConfig;
    use crate::pt_interface::DiscoveryPhase;
    use crate::pt_memory_transport::{MemoryTransport, MemoryTransportConfig};
    use crate::pt_system::TimeoutPolicy;

    fn transport() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(MemoryTransportConfig {
            participant_discovery_delay: Duration::from_millis(10),
            endpoint_discovery_delay: Duration::from_millis(10),
            ..MemoryTransportConfig::default()
        }))
    }

    fn short_discovery(on_timeout: TimeoutPolicy) -> DiscoveryConfig {
        DiscoveryConfig {
            rate_ms: 5,
            participant_max_wait_ms: 300,
            endpoint_max_wait_ms: 300,
            on_timeout,
        }
    }

    #[test]
    fn test_participant_naming() {
        let config = ExperimentConfig {
            n_clients: 2,
            n_services: 2,
            n_publishers: 1,
            n_subscribers: 2,
            namespace: "bench".to_string(),
            ..ExperimentConfig::default()
        };
        let participants = build_participants(&config);
        assert_eq!(participants.len(), config.total_participants());
        assert_eq!(participants.len(), 4 + 2 + 1 + 2);

        let ids: Vec<String> = participants.iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids[0], "client_node_0:/bench/service_0");
        assert_eq!(ids[1], "client_node_0:/bench/service_1");
        assert_eq!(ids[4], "server_node_0:/bench/service_0");
        assert_eq!(ids[6], "pub_node_0:/bench/topic_0");
        assert_eq!(ids[8], "sub_node_1:/bench/topic_0");

        assert_eq!(participants[0].frequency(), 10.0);
        assert_eq!(participants[4].frequency(), -1.0);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_discovery() {
        let config = ExperimentConfig {
            n_services: 0,
            ..ExperimentConfig::default()
        };
        assert!(matches!(
            configure(config, transport()),
            Err(ExperimentError::Configuration { .. })
        ));
    }

    #[test]
    fn test_one_client_two_services() {
        let config = ExperimentConfig {
            n_clients: 1,
            n_services: 2,
            frequency: 10.0,
            experiment_duration: 5,
            discovery: short_discovery(TimeoutPolicy::Abort),
            ..ExperimentConfig::default()
        };
        let mut handle = configure(config, transport()).unwrap();
        let report = run(&mut handle).unwrap();

        assert!(report.is_clean());
        let clients: Vec<_> = report.by_role(Role::Client).collect();
        let servers: Vec<_> = report.by_role(Role::Server).collect();
        assert_eq!(clients.len(), 2);
        assert_eq!(servers.len(), 2);

        for client in &clients {
            assert!(
                (45..=51).contains(&client.stats.count),
                "{} recorded {} samples",
                client.endpoint,
                client.stats.count
            );
            assert_eq!(client.stats.sent_count, client.stats.received_count);
            assert_eq!(client.stats.lost, 0);
        }

        let requests_sent: u64 = clients.iter().map(|c| c.stats.sent_count).sum();
        let requests_served: u64 = servers.iter().map(|s| s.stats.received_count).sum();
        assert_eq!(requests_sent, requests_served);
    }

    #[test]
    fn test_pub_sub_counts_every_publication() {
        let config = ExperimentConfig {
            n_clients: 0,
            n_services: 0,
            n_publishers: 1,
            n_subscribers: 2,
            frequency: 50.0,
            experiment_duration: 1,
            grace_period_ms: 200,
            discovery: short_discovery(TimeoutPolicy::Abort),
            ..ExperimentConfig::default()
        };
        let mut handle = configure(config, transport()).unwrap();
        let report = run(&mut handle).unwrap();

        let published = report.by_role(Role::Publisher).map(|p| p.stats.sent_count).sum::<u64>();
        assert!(published >= 45);
        for subscriber in report.by_role(Role::Subscriber) {
            assert_eq!(subscriber.stats.received_count, published);
            assert_eq!(subscriber.stats.lost, 0);
        }
    }

    #[test]
    fn test_hidden_server_times_out() {
        let transport = transport();
        transport.hide_node("server_node_1");
        let config = ExperimentConfig {
            n_clients: 1,
            n_services: 2,
            discovery: short_discovery(TimeoutPolicy::Abort),
            ..ExperimentConfig::default()
        };
        let mut handle = configure(config, transport).unwrap();

        match run(&mut handle) {
            Err(ExperimentError::DiscoveryTimeout { phase, missing }) => {
                assert_eq!(phase, DiscoveryPhase::Participant);
                assert!(missing.iter().all(|l| l.involves("server_node_1")));
            }
            other => panic!("expected discovery timeout, got {:?}", other.map(|_| ())),
        }

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            write_report(&handle, &dir.path().join("report.txt")),
            Err(ExperimentError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_continue_policy_keeps_reachable_pairs() {
        let transport = transport();
        transport.hide_node("server_node_1");
        let config = ExperimentConfig {
            n_clients: 1,
            n_services: 2,
            frequency: 20.0,
            experiment_duration: 1,
            grace_period_ms: 200,
            discovery: short_discovery(TimeoutPolicy::Continue),
            ..ExperimentConfig::default()
        };
        let mut handle = configure(config, transport).unwrap();
        let report = run(&mut handle).unwrap().clone();

        assert!(!report.is_clean());
        let reachable = report
            .nodes
            .iter()
            .find(|n| n.role == Role::Client && n.endpoint == "/service_0")
            .unwrap();
        assert!(reachable.stats.count >= 15);
        assert_eq!(reachable.stats.sent_count, reachable.stats.received_count);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.yaml");
        write_report(&handle, &path).unwrap();
        let yaml = std::fs::read_to_string(&path).unwrap();
        assert!(yaml.contains("discovery-incomplete"));
    }
}
