// Experiment configuration
//
// Loaded from YAML experiment files or built in code. Every field has a
// default matching the stock client/service benchmark.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pt_discovery::DiscoveryGate;
use crate::pt_error::ExperimentError;
use crate::pt_interface::{HistoryPolicy, PayloadClass, QosProfile, Role};
use crate::pt_participant::period_of;
use crate::pt_system::{SystemOptions, TimeoutPolicy};

// ============================================================================
// Main Configuration
// ============================================================================

/// Immutable snapshot of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub n_clients: usize,
    pub n_services: usize,
    pub n_publishers: usize,
    pub n_subscribers: usize,

    /// Payload preset name, e.g. "10b" or "1mb"
    pub msg_type: PayloadClass,

    /// 0 = one execution context per participant, n = n shared contexts
    pub executors: usize,

    /// Base frequency in Hz, distributed over roles by `role_frequencies`
    pub frequency: f64,

    /// Seconds of measured traffic, counted from the end of discovery
    pub experiment_duration: u64,

    /// Prefix for every service and topic name
    pub namespace: String,

    pub qos: QosProfile,

    /// Per-role overrides of the derived frequencies
    pub frequencies: FrequencyOverrides,

    /// Time in-flight exchanges get to complete after stop
    pub grace_period_ms: u64,

    pub discovery: DiscoveryConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            n_clients: 2,
            n_services: 1,
            n_publishers: 0,
            n_subscribers: 0,
            msg_type: PayloadClass::B10,
            executors: 0,
            frequency: 10.0,
            experiment_duration: 5,
            namespace: String::new(),
            qos: QosProfile::default(),
            frequencies: FrequencyOverrides::default(),
            grace_period_ms: 1000,
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Discovery gate parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub rate_ms: u64,
    pub participant_max_wait_ms: u64,
    pub endpoint_max_wait_ms: u64,
    pub on_timeout: TimeoutPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rate_ms: 20,
            participant_max_wait_ms: 30_000,
            endpoint_max_wait_ms: 30_000,
            on_timeout: TimeoutPolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyOverrides {
    pub client: Option<f64>,
    pub server: Option<f64>,
    pub publisher: Option<f64>,
    pub subscriber: Option<f64>,
}

/// Resolved frequency per role in Hz; `<= 0` means event-driven.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoleFrequencies {
    pub client: f64,
    pub server: f64,
    pub publisher: f64,
    pub subscriber: f64,
}

impl RoleFrequencies {
    pub fn for_role(&self, role: Role) -> f64 {
        match role {
            Role::Client => self.client,
            Role::Server => self.server,
            Role::Publisher => self.publisher,
            Role::Subscriber => self.subscriber,
        }
    }
}

impl ExperimentConfig {
    pub fn total_participants(&self) -> usize {
        // clients hold one endpoint per service, subscribers one per topic
        self.n_clients * self.n_services
            + self.n_services
            + self.n_publishers
            + self.n_subscribers * self.n_publishers
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.experiment_duration)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Clients and publishers tick at `frequency`. Servers only react to
    /// requests, unless there are no clients, in which case the frequency
    /// applies to them. Subscribers only react.
    pub fn role_frequencies(&self) -> RoleFrequencies {
        let server_default = if self.n_clients == 0 { self.frequency } else { -1.0 };

        RoleFrequencies {
            client: self.frequencies.client.unwrap_or(self.frequency),
            server: self.frequencies.server.unwrap_or(server_default),
            publisher: self.frequencies.publisher.unwrap_or(self.frequency),
            subscriber: self.frequencies.subscriber.unwrap_or(-1.0),
        }
    }

    pub fn discovery_gate(&self) -> DiscoveryGate {
        DiscoveryGate::new(
            Duration::from_millis(self.discovery.rate_ms),
            Duration::from_millis(self.discovery.participant_max_wait_ms),
            Duration::from_millis(self.discovery.endpoint_max_wait_ms),
        )
    }

    pub fn system_options(&self) -> SystemOptions {
        SystemOptions {
            executors: self.executors,
            grace_period: self.grace_period(),
            discovery: self.discovery_gate(),
            on_discovery_timeout: self.discovery.on_timeout,
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, ExperimentError> {
        serde_yaml::from_str(text).map_err(|e| ExperimentError::configuration(e.to_string()))
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.n_clients + self.n_services + self.n_publishers + self.n_subscribers == 0 {
            return Err(ExperimentError::configuration("no participants configured"));
        }
        if self.n_clients > 0 && self.n_services == 0 {
            return Err(ExperimentError::configuration(format!(
                "{} client(s) but no service to send requests to",
                self.n_clients
            )));
        }
        if self.n_subscribers > 0 && self.n_publishers == 0 {
            return Err(ExperimentError::configuration(format!(
                "{} subscriber(s) but no publisher",
                self.n_subscribers
            )));
        }
        if self.experiment_duration == 0 {
            return Err(ExperimentError::configuration("experiment duration must be at least 1s"));
        }

        let frequencies = self.role_frequencies();
        for role in [Role::Client, Role::Server, Role::Publisher, Role::Subscriber] {
            let frequency = frequencies.for_role(role);
            if !frequency.is_finite() {
                return Err(ExperimentError::configuration(format!(
                    "{} frequency is not a finite number",
                    role
                )));
            }
            if frequency > 0.0 && period_of(frequency).is_none() {
                return Err(ExperimentError::configuration(format!(
                    "{} frequency {} Hz is too low to schedule",
                    role, frequency
                )));
            }
        }

        if self.qos.history == HistoryPolicy::KeepLast && self.qos.depth == 0 {
            return Err(ExperimentError::configuration("keep-last history needs a depth of at least 1"));
        }
        if self.discovery.rate_ms == 0 {
            return Err(ExperimentError::configuration("discovery polling rate must be at least 1ms"));
        }
        if let Some(c) = self
            .namespace
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '/'))
        {
            return Err(ExperimentError::configuration(format!(
                "invalid character '{}' in namespace '{}'",
                c, self.namespace
            )));
        }

        Ok(())
    }
}
