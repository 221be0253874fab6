use std::path::Path;
use std::sync::Arc;

use log::{error, info};
use simple_logger::SimpleLogger;

use pt_rust::pt_events::ConsoleEventSink;
use pt_rust::pt_experiment::build_participants;
use pt_rust::pt_memory_transport::MemoryTransport;
use pt_rust::{ExperimentConfig, System};

fn main() {
    SimpleLogger::new().init().unwrap();

    info!("starting");

    // 2 clients, 1 service, 10b payloads at 10 Hz for 5 s
    let config = ExperimentConfig::default();
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    let transport = Arc::new(MemoryTransport::default());
    let mut system = System::new(transport, config.system_options());
    system.enable_events_logger(Box::new(ConsoleEventSink::new(true)));

    if let Err(e) = system.add_participants(build_participants(&config)) {
        error!("{}", e);
        std::process::exit(1);
    }

    info!(
        "{} client(s), {} service(s), {}, {} Hz for {}s",
        config.n_clients, config.n_services, config.msg_type, config.frequency, config.experiment_duration
    );

    if let Err(e) = system.spin(config.duration()) {
        error!("experiment failed: {}", e);
        std::process::exit(1);
    }

    system.print_latency_all_stats().unwrap_or_else(|e| error!("{}", e));
    system.print_latency_total_stats().unwrap_or_else(|e| error!("{}", e));
    system
        .save_latency_all_stats(Path::new("latency_all.txt"))
        .unwrap_or_else(|e| error!("{}", e));
    system
        .save_latency_total_stats(Path::new("latency_total.txt"))
        .unwrap_or_else(|e| error!("{}", e));

    info!("done");
}
