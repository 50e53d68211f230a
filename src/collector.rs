mod connection;
mod handlers;
mod reactor;
mod supervisor;
mod sweeper;

pub use connection::State;
pub use handlers::{HandlerError, MetricsSink, RequestHandler};
pub use reactor::{Reactor, ReactorConfig, ReactorHandle};
pub use supervisor::{Exit, Forked, OsProcesses, ProcessControl, Supervisor};

use crate::error::MetricsError;
use std::{net::TcpListener, num::NonZeroUsize, thread, time::Duration};

/// Server side of the pipeline: a listening endpoint served by forked workers.
#[derive(Debug, Clone)]
pub struct TcpCollector {
    address: String,
    workers: usize,
    max_restarts: usize,
    reactor: ReactorConfig,
}

impl Default for TcpCollector {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:9000".into(),
            workers: 0,
            max_restarts: supervisor::DEFAULT_MAX_RESTARTS,
            reactor: ReactorConfig::default(),
        }
    }
}

impl TcpCollector {
    /// Sets the `host:port` to listen on.
    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    /// Sets the number of worker processes; `0` means one per logical core.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets how many crashed workers may be respawned in total.
    #[must_use]
    pub const fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.reactor.read_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.reactor.sweep_interval = interval;
        self
    }

    /// Sets the largest request payload a worker accepts.
    #[must_use]
    pub const fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.reactor.max_frame_len = max_frame_len;
        self
    }

    /// Number of workers [`TcpCollector::serve`] will fork.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }

    /// Builds a reactor in the current process, without forking.
    ///
    /// # Example
    /// ```no_run
    /// use metrics_tcp_collector::{MetricsSink, TcpCollector};
    /// let mut reactor = TcpCollector::default()
    ///     .address("127.0.0.1:9000")
    ///     .reactor(MetricsSink)
    ///     .unwrap();
    /// reactor.run().unwrap();
    /// ```
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub fn reactor<H: RequestHandler>(&self, handler: H) -> Result<Reactor<H>, MetricsError> {
        let listener = TcpListener::bind(&self.address)?;
        Reactor::new(listener, handler, self.reactor)
    }

    /// Binds the address, forks the workers and runs one reactor per worker.
    ///
    /// `make_handler` is called in each worker process with its index. This
    /// returns in every process: in a worker once its reactor stops, in the
    /// parent once all workers exited cleanly. Call it before starting any
    /// thread, since the process forks.
    ///
    /// # Errors
    /// Returns an error if binding or forking fails, if a worker's reactor
    /// fails, or if crashed workers exhaust the restart budget.
    pub fn serve<H, F>(self, make_handler: F) -> Result<(), MetricsError>
    where
        H: RequestHandler,
        F: FnOnce(usize) -> H,
    {
        let listener = TcpListener::bind(&self.address)?;
        let workers = self.worker_count();
        log::info!("collector listening on {} with {workers} workers", self.address);

        match Supervisor::new(OsProcesses, self.max_restarts).run(workers)? {
            Some(id) => {
                log::info!("worker {id} running");
                let mut reactor = Reactor::new(listener, make_handler(id), self.reactor)?;
                reactor.run()
            }
            None => {
                log::info!("all workers exited");
                Ok(())
            }
        }
    }
}
