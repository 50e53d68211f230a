//! This example ships metrics from a Tokio application with the async transport.
//!
//! Every three seconds the buffered metrics are drained and sent to the first host in
//! `COLLECTOR_HOSTS` (default `127.0.0.1:9000`) that accepts them.

#[cfg(not(feature = "tokio"))]
fn main() {
    eprintln!("This example is not available when the Tokio feature is disabled.");
}

#[cfg(feature = "tokio")]
#[tokio::main]
async fn main() {
    use metrics_tcp_collector::{AsyncTransport, SnapshotRecorder, default_host};
    use std::time::Duration;

    env_logger::init();

    let hosts = std::env::var("COLLECTOR_HOSTS").unwrap_or_else(|_| "127.0.0.1:9000".into());
    let mut transport = AsyncTransport::new(hosts.parse().expect("Invalid COLLECTOR_HOSTS"))
        .io_timeout(Some(Duration::from_secs(5)));
    let recorder = SnapshotRecorder::new(default_host())
        .install()
        .expect("Failed to set up snapshot recorder");

    println!("Agent is shipping to {hosts}. Press Ctrl+C to exit.");

    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    let mut cycle = 0.0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cycle += 1.0;
                metrics::counter!("agent_cycles").increment(1);
                metrics::gauge!("agent_last_cycle").set(cycle);

                let record = recorder.take_record();
                if let Err(e) = transport.send_record(&record).await {
                    eprintln!("Failed to ship record: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Shutting down agent.");
}
