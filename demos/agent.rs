//! This example runs an agent that ships the host load average to a collector.
//!
//! The `SnapshotRecorder` is installed as the global recorder, so anything recorded through the
//! `metrics` macros is buffered and shipped every few seconds. Records go to the first host in
//! `COLLECTOR_HOSTS` (default `127.0.0.1:9000`, separate fallbacks with `;`) that accepts them.

use metrics::{describe_gauge, gauge};
use metrics_tcp_collector::{Agent, MetricsError, Record, SnapshotRecorder, Transport, default_host};
use std::{
    env, fs,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

fn record_load_average() {
    let Ok(loadavg) = fs::read_to_string("/proc/loadavg") else {
        return;
    };
    let windows = ["1m", "5m", "15m"];
    for (window, value) in windows.iter().zip(loadavg.split_whitespace()) {
        if let Ok(value) = value.parse::<f64>() {
            gauge!("load_average", "window" => *window).set(value);
        }
    }
}

fn main() {
    env_logger::init();

    let hosts = env::var("COLLECTOR_HOSTS").unwrap_or_else(|_| "127.0.0.1:9000".into());
    let transport = match hosts.parse() {
        Ok(hosts) => Transport::new(hosts).io_timeout(Some(Duration::from_secs(5))),
        Err(e) => {
            eprintln!("Invalid COLLECTOR_HOSTS: {e}");
            return;
        }
    };

    let recorder = match SnapshotRecorder::new(default_host()).install() {
        Ok(recorder) => recorder,
        Err(e) => {
            eprintln!("Failed to set up snapshot recorder: {e}");
            return;
        }
    };
    describe_gauge!("load_average", "system load average");

    let collect = move || -> Result<Record, MetricsError> {
        record_load_average();
        Ok(recorder.take_record())
    };
    let agent = Agent::new(collect, transport)
        .start()
        .expect("Failed to start agent");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Handle Ctrl+C to exit gracefully.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    println!("Agent is shipping to {hosts}. Press Ctrl+C to exit.");

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
    }

    agent.stop();
    println!("Shutting down agent.");
}
