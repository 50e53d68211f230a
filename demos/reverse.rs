//! This example runs a single reactor, without forking, that answers every frame with its payload
//! reversed.
//!
//! Try it with `printf '0000000005hello' | nc 127.0.0.1 9000`, which prints `0000000005olleh`.

use metrics_tcp_collector::TcpCollector;
use std::{convert::Infallible, env, thread};

fn reverse(request: &[u8]) -> Result<Vec<u8>, Infallible> {
    Ok(request.iter().rev().copied().collect())
}

fn main() {
    env_logger::init();

    let address = env::var("COLLECTOR_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".into());
    let mut reactor = TcpCollector::default()
        .address(&address)
        .reactor(reverse)
        .expect("Failed to bind reverse server");

    let handle = reactor.handle();
    ctrlc::set_handler(move || {
        if let Err(e) = handle.shutdown() {
            eprintln!("Failed to stop reactor: {e}");
        }
    })
    .expect("Error setting Ctrl-C handler");

    println!("Reverse server is running on {address}. Press Ctrl+C to exit.");
    let server = thread::spawn(move || reactor.run());

    match server.join() {
        Ok(Ok(())) => println!("Shutting down reverse server."),
        Ok(Err(e)) => eprintln!("Reverse server failed: {e}"),
        Err(_) => eprintln!("Reverse server panicked"),
    }
}
