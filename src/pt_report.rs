// Report generation: per-participant and system-wide latency statistics.
//
// Everything here is a side-effect-free projection of the participants'
// recorders. Totals are recomputed from the union of all raw samples, never
// by averaging per-participant means. Writing the projection somewhere is the
// caller's job (`ExperimentReport::write_to`).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::pt_discovery::DiscoveryOutcome;
use crate::pt_error::ExperimentError;
use crate::pt_interface::{DiscoveryPhase, Role};
use crate::pt_latency::{LatencyRecorder, LatencyStats};
use crate::pt_participant::{Participant, ParticipantId};

/// Statistics for every participant, in registration order.
pub fn per_node_stats(participants: &[Participant]) -> Vec<(ParticipantId, LatencyStats)> {
    participants
        .iter()
        .map(|p| (p.id().clone(), p.recorder().compute_stats()))
        .collect()
}

/// Statistics over all participants' samples merged as if from one recorder.
pub fn total_stats(participants: &[Participant]) -> LatencyStats {
    LatencyRecorder::merged_stats(participants.iter().map(|p| p.recorder()))
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportFlag {
    Clean,
    DiscoveryIncomplete,
    SendFailures,
}

impl ReportFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFlag::Clean => "clean",
            ReportFlag::DiscoveryIncomplete => "discovery-incomplete",
            ReportFlag::SendFailures => "send-failures",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryStatus {
    pub complete: bool,
    pub timed_out_phase: Option<DiscoveryPhase>,
    /// Human-readable links that never became visible
    pub missing: Vec<String>,
}

impl From<&DiscoveryOutcome> for DiscoveryStatus {
    fn from(outcome: &DiscoveryOutcome) -> Self {
        match outcome {
            DiscoveryOutcome::Ready { .. } => DiscoveryStatus {
                complete: true,
                timed_out_phase: None,
                missing: Vec::new(),
            },
            DiscoveryOutcome::TimedOut { phase, missing, .. } => DiscoveryStatus {
                complete: false,
                timed_out_phase: Some(*phase),
                missing: missing.iter().map(|l| l.to_string()).collect(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub endpoint: String,
    pub role: Role,
    pub payload_bytes: usize,
    pub frequency_hz: f64,
    pub stats: LatencyStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentReport {
    pub duration_s: f64,
    pub discovery: DiscoveryStatus,
    pub nodes: Vec<NodeReport>,
    pub total: LatencyStats,
    pub flags: Vec<ReportFlag>,
}

impl ExperimentReport {
    pub fn build(participants: &[Participant], duration: Duration, discovery: DiscoveryStatus) -> Self {
        let nodes: Vec<NodeReport> = per_node_stats(participants)
            .into_iter()
            .zip(participants)
            .map(|((id, stats), p)| NodeReport {
                node: id.node,
                endpoint: id.channel,
                role: p.role(),
                payload_bytes: p.payload().size_bytes(),
                frequency_hz: p.frequency(),
                stats,
            })
            .collect();

        let total = total_stats(participants);

        let mut flags = Vec::new();
        if !discovery.complete {
            flags.push(ReportFlag::DiscoveryIncomplete);
        }
        if total.send_failures > 0 {
            flags.push(ReportFlag::SendFailures);
        }
        if flags.is_empty() {
            flags.push(ReportFlag::Clean);
        }

        Self {
            duration_s: duration.as_secs_f64(),
            discovery,
            nodes,
            total,
            flags,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.flags == [ReportFlag::Clean]
    }

    /// Stats rows for one role, in report order.
    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn write_table<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.write_header(writer)?;
        for node in &self.nodes {
            write_row(
                writer,
                &node.node,
                node.role.as_str(),
                &node.endpoint,
                node.payload_bytes,
                &node.stats,
                node.frequency_hz,
                self.duration_s,
            )?;
        }
        self.write_total_row(writer)?;
        self.write_flags(writer)
    }

    /// Header, totals row and flags only.
    pub fn write_totals<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.write_header(writer)?;
        self.write_total_row(writer)?;
        self.write_flags(writer)
    }

    fn write_header<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(
            writer,
            "{:<20} {:<10} {:<24} {:>8} {:>8} {:>11} {:>7} {:>11} {:>7} {:>9} {:>10} {:>10} {:>10} {:>10} {:>8} {:>11}",
            "node",
            "role",
            "endpoint",
            "size[b]",
            "sent[#]",
            "received[#]",
            "late[#]",
            "too_late[#]",
            "lost[#]",
            "failed[#]",
            "mean[us]",
            "sd[us]",
            "min[us]",
            "max[us]",
            "freq[hz]",
            "duration[s]"
        )
    }

    fn write_total_row<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let payload = self.nodes.first().map(|n| n.payload_bytes).unwrap_or(0);
        write_row(writer, "total", "-", "-", payload, &self.total, 0.0, self.duration_s)
    }

    fn write_flags<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let flags: Vec<&str> = self.flags.iter().map(|f| f.as_str()).collect();
        writeln!(writer, "flags: {}", flags.join(","))?;
        for link in &self.discovery.missing {
            writeln!(writer, "missing: {}", link)?;
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Persist the report: YAML for `.yaml`/`.yml` destinations, the column
    /// table otherwise.
    pub fn write_to(&self, path: &Path) -> Result<(), ExperimentError> {
        let reporting = |source: io::Error| ExperimentError::Reporting {
            path: path.to_path_buf(),
            source,
        };

        let structured = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );

        let file = File::create(path).map_err(reporting)?;
        let mut writer = BufWriter::new(file);

        if structured {
            let yaml = self
                .to_yaml()
                .map_err(|e| reporting(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            writer.write_all(yaml.as_bytes()).map_err(reporting)?;
        } else {
            self.write_table(&mut writer).map_err(reporting)?;
        }

        writer.flush().map_err(reporting)
    }

    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Experiment Results                              ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration:");
        println!("  Duration: {:.1}s", self.duration_s);
        println!("  Participants: {}", self.nodes.len());
        for role in [Role::Client, Role::Server, Role::Publisher, Role::Subscriber] {
            let count = self.by_role(role).count();
            if count > 0 {
                println!("    {}s: {}", role, count);
            }
        }
        println!();

        println!("Discovery:");
        if self.discovery.complete {
            println!("  complete");
        } else {
            let phase = self
                .discovery
                .timed_out_phase
                .map(|p| p.to_string())
                .unwrap_or_default();
            println!("  INCOMPLETE ({} phase timed out)", phase);
            for link in &self.discovery.missing {
                println!("    never matched: {}", link);
            }
        }
        println!();

        let mut stdout = io::stdout();
        if let Err(e) = self.write_table(&mut stdout) {
            eprintln!("Error writing report: {}", e);
        }
        println!();
    }
}

#[allow(clippy::too_many_arguments)]
fn write_row<W: Write>(
    writer: &mut W,
    node: &str,
    role: &str,
    endpoint: &str,
    payload_bytes: usize,
    stats: &LatencyStats,
    frequency_hz: f64,
    duration_s: f64,
) -> io::Result<()> {
    let micros = |v: Option<f64>| v.map(|v| format!("{:.0}", v)).unwrap_or_else(|| "-".to_string());

    writeln!(
        writer,
        "{:<20} {:<10} {:<24} {:>8} {:>8} {:>11} {:>7} {:>11} {:>7} {:>9} {:>10} {:>10} {:>10} {:>10} {:>8} {:>11}",
        node,
        role,
        endpoint,
        payload_bytes,
        stats.sent_count,
        stats.received_count,
        stats.late,
        stats.too_late,
        stats.lost,
        stats.send_failures,
        micros(stats.mean_us()),
        micros(stats.stddev_us()),
        micros(stats.min_us()),
        micros(stats.max_us()),
        if frequency_hz > 0.0 {
            format!("{}", frequency_hz)
        } else {
            "-".to_string()
        },
        format!("{:.1}", duration_s)
    )
}
