//! # ptRust - Middleware Latency Benchmarking
//!
//! A harness for measuring latency and throughput of request/response and
//! publish/subscribe traffic over a messaging middleware. An experiment spins
//! up N clients, M servers, P publishers and S subscribers, waits until they
//! have all discovered each other, drives them at configured frequencies for a
//! fixed duration and reports per-participant and system-wide statistics.
//!
//! ## Core Components
//!
//! - **DiscoveryGate**: blocks until the expected peer graph is fully matched
//! - **ExecutionScheduler**: runs participants on one or more execution contexts
//! - **LatencyRecorder**: per-participant samples and statistics
//! - **System**: the orchestrator state machine
//! - **ExperimentReport**: per-node and total statistics, text and YAML output
//!
//! ## Usage with a Middleware
//!
//! The library is middleware-agnostic. You need to:
//! 1. Implement `Transport` and `DiscoveryQuery` for your middleware
//! 2. Build an `ExperimentConfig` (or load one from YAML)
//! 3. Call `configure`, then `run`, then `write_report`
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pt_rust::{configure, run, write_report, ExperimentConfig};
//! use pt_rust::pt_memory_transport::MemoryTransport;
//!
//! let config = ExperimentConfig {
//!     n_clients: 1,
//!     n_services: 2,
//!     ..ExperimentConfig::default()
//! };
//!
//! let mut handle = configure(config, Arc::new(MemoryTransport::default())).unwrap();
//! let report = run(&mut handle).unwrap();
//! report.print_summary();
//! write_report(&handle, Path::new("latency_all.txt")).unwrap();
//! ```
//!
//! ## Testing without a Middleware
//!
//! `pt_memory_transport::MemoryTransport` is an in-process transport with
//! configurable discovery delays, latency and best-effort loss. The
//! `experiment_runner` binary in `runner/` runs YAML experiment files on it.

// Core benchmarking modules
pub mod pt_interface;
pub mod pt_error;
pub mod pt_latency;
pub mod pt_participant;
pub mod pt_discovery;
pub mod pt_scheduler;
pub mod pt_system;
pub mod pt_report;

// Configuration and glue
pub mod pt_config;
pub mod pt_experiment;
pub mod pt_events;

// Transports
pub mod pt_memory_transport;

// Re-export commonly used types
pub use pt_config::{ExperimentConfig, RoleFrequencies};
pub use pt_discovery::{DiscoveryGate, DiscoveryOutcome, PeerGraph, PeerLink};
pub use pt_error::{ExperimentError, SendError};
pub use pt_experiment::{configure, run, write_report, ExperimentHandle};
pub use pt_interface::{
    Delivery, Destination, DiscoveryPhase, DiscoveryQuery, EndpointDesc, EndpointId, Event,
    EventSink, Message, MessageKind, NoOpSink, PayloadClass, QosProfile, Role, Transport,
};
pub use pt_latency::{LatencyRecorder, LatencyStats, Sample};
pub use pt_participant::{Participant, ParticipantId};
pub use pt_report::{per_node_stats, total_stats, ExperimentReport, ReportFlag};
pub use pt_scheduler::{ExecutionScheduler, Schedulable, SchedulerHandle};
pub use pt_system::{System, SystemOptions, SystemState, TimeoutPolicy};
