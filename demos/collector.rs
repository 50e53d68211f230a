//! This example runs the forking TCP collector with a Prometheus exporter in every worker.
//!
//! The collector binds `COLLECTOR_ADDR` (default `0.0.0.0:9000`) and forks `COLLECTOR_WORKERS`
//! workers (default one per core). Each worker replays the records agents ship into its own
//! Prometheus exporter, served on `METRICS_PORT + worker index` (default base port 9100).
//! Crashed workers are restarted until the restart budget runs out.

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_tcp_collector::{MetricsSink, TcpCollector};
use std::env;

fn main() {
    env_logger::init();

    let address = env::var("COLLECTOR_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".into());
    let workers = env::var("COLLECTOR_WORKERS")
        .ok()
        .and_then(|workers| workers.parse().ok())
        .unwrap_or(0);
    let metrics_port: u16 = env::var("METRICS_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(9100);

    let collector = TcpCollector::default().address(&address).workers(workers);
    println!(
        "Collector listening on {address} with {} workers. Press Ctrl+C to exit.",
        collector.worker_count()
    );

    // Each worker is its own process, so each installs its own exporter.
    let result = collector.serve(|id| {
        let port = metrics_port + u16::try_from(id).unwrap_or(0);
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .expect("Failed to install Prometheus recorder");
        log::info!("worker {id} exposes metrics on port {port}");
        MetricsSink
    });

    if let Err(e) = result {
        eprintln!("Collector stopped: {e}");
        std::process::exit(1);
    }
}
