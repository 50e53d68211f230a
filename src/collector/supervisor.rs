use crate::error::MetricsError;
use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{WaitStatus, wait},
    },
    unistd::{ForkResult, Pid, fork},
};
use std::collections::HashMap;

pub const DEFAULT_MAX_RESTARTS: usize = 100;

/// Which side of a fork the caller ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent(Pid),
    Child,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Clean,
    Failed(i32),
    Signaled(Signal),
}

/// The process operations the supervisor needs.
pub trait ProcessControl {
    /// # Errors
    /// Returns an error if the process cannot be forked.
    fn fork(&mut self) -> Result<Forked, MetricsError>;

    /// Blocks until any child ends; `None` once there are no children left.
    ///
    /// # Errors
    /// Returns an error if waiting fails for a reason other than an interrupt.
    fn wait(&mut self) -> Result<Option<(Pid, Exit)>, MetricsError>;
}

impl<P: ProcessControl + ?Sized> ProcessControl for &mut P {
    fn fork(&mut self) -> Result<Forked, MetricsError> {
        (**self).fork()
    }

    fn wait(&mut self) -> Result<Option<(Pid, Exit)>, MetricsError> {
        (**self).wait()
    }
}

/// Real `fork(2)` / `wait(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcesses;

impl ProcessControl for OsProcesses {
    fn fork(&mut self) -> Result<Forked, MetricsError> {
        // SAFETY: the supervisor forks before it starts any thread, and the
        // child goes on to build a fresh reactor of its own.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(Forked::Parent(child)),
            ForkResult::Child => Ok(Forked::Child),
        }
    }

    fn wait(&mut self) -> Result<Option<(Pid, Exit)>, MetricsError> {
        loop {
            match wait() {
                Ok(WaitStatus::Exited(pid, 0)) => return Ok(Some((pid, Exit::Clean))),
                Ok(WaitStatus::Exited(pid, code)) => return Ok(Some((pid, Exit::Failed(code)))),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    return Ok(Some((pid, Exit::Signaled(signal))));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Forks the worker processes and respawns the ones that crash.
///
/// Restarts are counted across all workers; once the count passes the budget
/// the supervisor gives up with [`MetricsError::RestartBudgetExceeded`].
#[derive(Debug)]
pub struct Supervisor<P> {
    control: P,
    max_restarts: usize,
    restarts: usize,
    children: HashMap<Pid, usize>,
}

impl<P: ProcessControl> Supervisor<P> {
    pub fn new(control: P, max_restarts: usize) -> Self {
        Self {
            control,
            max_restarts,
            restarts: 0,
            children: HashMap::new(),
        }
    }

    /// Starts `num_workers` workers and supervises them.
    ///
    /// Returns `Some(index)` in a worker process, which should go on to run its
    /// reactor, and `None` in the parent once every worker exited cleanly.
    ///
    /// # Errors
    /// Returns an error if forking or waiting fails, or the restart budget runs out.
    pub fn run(mut self, num_workers: usize) -> Result<Option<usize>, MetricsError> {
        for id in 0..num_workers.max(1) {
            if let Some(id) = self.start_child(id)? {
                return Ok(Some(id));
            }
        }

        while !self.children.is_empty() {
            let Some((pid, exit)) = self.control.wait()? else {
                break;
            };
            let Some(id) = self.children.remove(&pid) else {
                continue;
            };
            match exit {
                Exit::Clean => {
                    log::info!("worker {id} (pid {pid}) exited");
                    continue;
                }
                Exit::Failed(code) => {
                    log::warn!("worker {id} (pid {pid}) exited with status {code}");
                }
                Exit::Signaled(signal) => {
                    log::warn!("worker {id} (pid {pid}) killed by {signal:?}");
                }
            }

            self.restarts += 1;
            if self.restarts > self.max_restarts {
                log::error!("worker restart budget of {} exhausted", self.max_restarts);
                return Err(MetricsError::RestartBudgetExceeded {
                    restarts: self.max_restarts,
                });
            }
            if let Some(id) = self.start_child(id)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn start_child(&mut self, id: usize) -> Result<Option<usize>, MetricsError> {
        match self.control.fork()? {
            Forked::Child => Ok(Some(id)),
            Forked::Parent(pid) => {
                log::info!("started worker {id} as pid {pid}");
                self.children.insert(pid, id);
                Ok(None)
            }
        }
    }
}
