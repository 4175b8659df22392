//! Sandbox worker: the single writer for one lease.
//!
//! External code never touches a running lease directly; it sends typed
//! signals into the worker's inbox and blocks on the per-signal response
//! channel. The worker drives the state machine
//! {preparing, running, stopping, stopped} and guarantees that the
//! driver's release runs exactly once on every exit path.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::hypervisor::agent::GuestCommandResult;

use super::driver::{DriverError, SandboxDriver};
use super::lease::{Lease, LeaseSnapshot, SandboxCommand};

/// Inbox capacity. Senders block once this many signals are queued.
const SIGNAL_BUFFER: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("sandbox worker is gone")]
    Closed,
}

impl WorkerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }

    pub fn is_guest_timeout(&self) -> bool {
        matches!(self, WorkerError::Driver(e) if e.is_guest_timeout())
    }
}

/// The only way external code mutates a running worker.
pub enum Signal {
    ExecuteCommand {
        command: SandboxCommand,
        reply: oneshot::Sender<Result<GuestCommandResult, WorkerError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender half handed to the analysis worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Signal>,
}

impl WorkerHandle {
    /// Submit a command and block on its response.
    pub async fn execute(
        &self,
        command: SandboxCommand,
    ) -> Result<GuestCommandResult, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Signal::ExecuteCommand { command, reply })
            .await
            .map_err(|_| WorkerError::Closed)?;
        rx.await.map_err(|_| WorkerError::Cancelled)?
    }

    /// Request stop and wait for the acknowledgement, which arrives after
    /// release has completed.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Signal::Stop { reply })
            .await
            .map_err(|_| WorkerError::Closed)?;
        // A worker torn down between send and reply still released.
        let _ = rx.await;
        Ok(())
    }
}

enum LoopOutcome {
    /// Stop signal received; acknowledge after release.
    Stopped(oneshot::Sender<()>),
    /// `run`'s context was cancelled; treated like stop.
    Cancelled,
    /// All handles dropped; nothing left to wait for.
    Orphaned,
}

pub struct SandboxWorker {
    driver: Arc<SandboxDriver>,
    lease: Lease,
    inbox: mpsc::Receiver<Signal>,
    start_notifier: Option<oneshot::Sender<LeaseSnapshot>>,
}

impl SandboxWorker {
    pub fn new(driver: Arc<SandboxDriver>, lease: Lease) -> (Self, WorkerHandle) {
        let (tx, inbox) = mpsc::channel(SIGNAL_BUFFER);
        (
            Self {
                driver,
                lease,
                inbox,
                start_notifier: None,
            },
            WorkerHandle { tx },
        )
    }

    /// Observe the transition into "running". The sender fires with a
    /// metadata snapshot; if the worker dies first the receiver sees a
    /// closed channel.
    pub fn start_notifier(&mut self) -> oneshot::Receiver<LeaseSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.start_notifier = Some(tx);
        rx
    }

    /// Drive the lease to completion. Returns exactly once; release is
    /// always attempted (forced) before returning, and the inbox is
    /// closed so pending senders observe termination.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let exec_cancel = cancel.child_token();
        let outcome = self.lifecycle(&cancel, &exec_cancel).await;

        // stopping: cancel outstanding executes, then release.
        exec_cancel.cancel();
        self.inbox.close();

        if let Err(e) = self.driver.release(&mut self.lease, true).await {
            tracing::warn!(lease = %self.lease.id, error = %e, "forced release reported failure");
        }

        // Anything still queued gets a terminal answer.
        while let Ok(signal) = self.inbox.try_recv() {
            match signal {
                Signal::ExecuteCommand { reply, .. } => {
                    let _ = reply.send(Err(WorkerError::Cancelled));
                }
                Signal::Stop { reply } => {
                    let _ = reply.send(());
                }
            }
        }

        match outcome {
            Ok(LoopOutcome::Stopped(ack)) => {
                let _ = ack.send(());
                Ok(())
            }
            Ok(LoopOutcome::Cancelled) | Ok(LoopOutcome::Orphaned) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn lifecycle(
        &mut self,
        cancel: &CancellationToken,
        exec_cancel: &CancellationToken,
    ) -> Result<LoopOutcome, WorkerError> {
        // preparing
        tokio::select! {
            res = self.driver.start(&mut self.lease) => res?,
            _ = cancel.cancelled() => return Ok(LoopOutcome::Cancelled),
        }

        // running
        if let Some(notifier) = self.start_notifier.take() {
            let _ = notifier.send(self.lease.snapshot());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(LoopOutcome::Cancelled),
                signal = self.inbox.recv() => match signal {
                    Some(Signal::ExecuteCommand { command, reply }) => {
                        self.spawn_execute(command, reply, exec_cancel.clone());
                    }
                    Some(Signal::Stop { reply }) => return Ok(LoopOutcome::Stopped(reply)),
                    None => return Ok(LoopOutcome::Orphaned),
                },
            }
        }
    }

    /// Executions run concurrently; the guest agent serializes them per
    /// VM. Responses may complete out of submission order.
    fn spawn_execute(
        &self,
        command: SandboxCommand,
        reply: oneshot::Sender<Result<GuestCommandResult, WorkerError>>,
        cancel: CancellationToken,
    ) {
        let driver = self.driver.clone();
        let domain = self.lease.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = driver.execute(&domain, &command) => {
                    let _ = reply.send(result.map_err(WorkerError::from));
                }
                _ = cancel.cancelled() => {
                    let _ = reply.send(Err(WorkerError::Cancelled));
                }
            }
        });
    }
}
