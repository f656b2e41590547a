// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-task driver for a [`LeaseManager`].
//!
//! Every entry point of the lease layer (API commands, timer fires and
//! incoming protocol messages) is serialized onto one task, so no callback
//! ever observes a torn ticket update and no locking is needed around the
//! state machines. Use [`Session::handle`] to obtain a cloneable
//! [`SessionHandle`] for issuing commands and ending the session.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::lease::{
    ClearMode, CompletionHandler, Error, ErrorKind, LeaseManager, TicketConfig, TicketHandle,
    TicketStatus, TicketStore,
};
use crate::paxos::{PaxosEngine, Round};
use crate::timer::Clock;

/// Longest the driver sleeps when no timer is armed; commands wake it
/// earlier.
const IDLE_POLL: Duration = Duration::from_secs(3600);

enum Command {
    AddTicket {
        config: TicketConfig,
        reply: oneshot::Sender<Result<TicketHandle, Error>>,
    },
    RemoveTicket {
        handle: TicketHandle,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Acquire {
        handle: TicketHandle,
        clear: ClearMode,
        renew: bool,
        on_done: Option<CompletionHandler>,
        reply: oneshot::Sender<Result<Round, Error>>,
    },
    Release {
        handle: TicketHandle,
        on_done: Option<CompletionHandler>,
        reply: oneshot::Sender<Result<Round, Error>>,
    },
    StatusRecovery {
        handle: TicketHandle,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Status {
        handle: TicketHandle,
        reply: oneshot::Sender<Result<TicketStatus, Error>>,
    },
    Receive {
        buf: Vec<u8>,
    },
}

/// Runs a [`LeaseManager`] on one task.
pub struct Session<E, S, C>
where
    E: PaxosEngine,
    S: TicketStore,
    C: Clock,
{
    manager: LeaseManager<E, S, C>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    exit: CancellationToken,
}

impl<E, S, C> Session<E, S, C>
where
    E: PaxosEngine,
    S: TicketStore,
    C: Clock,
{
    /// Wrap a manager for execution.
    #[must_use]
    pub fn new(manager: LeaseManager<E, S, C>) -> Self {
        let (command_tx, commands) = mpsc::unbounded_channel();
        Session {
            manager,
            commands,
            command_tx,
            exit: CancellationToken::new(),
        }
    }

    /// Return a new [`SessionHandle`] for issuing commands and ending the
    /// session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.command_tx.clone(),
            exit: self.exit.clone(),
        }
    }

    /// Run until the session is exited or every handle is dropped. Returns
    /// the manager so the embedding application can inspect or tear down
    /// tickets.
    pub async fn run(self) -> LeaseManager<E, S, C> {
        let Session {
            mut manager,
            mut commands,
            command_tx,
            exit,
        } = self;
        // No further handles can be created once the session runs, so the
        // channel closes when the last outstanding handle is dropped.
        drop(command_tx);
        log::info!("lease session started");
        loop {
            let delay = manager.until_next_deadline().unwrap_or(IDLE_POLL);
            tokio::select! {
                biased;
                () = exit.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => dispatch(&mut manager, command),
                    None => break,
                },
                () = tokio::time::sleep(delay) => manager.tick(),
            }
        }
        log::info!("lease session terminated");
        manager
    }
}

fn dispatch<E, S, C>(manager: &mut LeaseManager<E, S, C>, command: Command)
where
    E: PaxosEngine,
    S: TicketStore,
    C: Clock,
{
    match command {
        Command::AddTicket { config, reply } => {
            let _res = reply.send(manager.add_ticket(config));
        }
        Command::RemoveTicket { handle, reply } => {
            let _res = reply.send(manager.remove_ticket(handle));
        }
        Command::Acquire {
            handle,
            clear,
            renew,
            on_done,
            reply,
        } => {
            let _res = reply.send(manager.acquire(handle, clear, renew, on_done));
        }
        Command::Release {
            handle,
            on_done,
            reply,
        } => {
            let _res = reply.send(manager.release(handle, on_done));
        }
        Command::StatusRecovery { handle, reply } => {
            let _res = reply.send(manager.status_recovery(handle));
        }
        Command::Status { handle, reply } => {
            let _res = reply.send(manager.status(handle));
        }
        Command::Receive { buf } => {
            if let Err(error) = manager.on_receive(&buf) {
                log::error!("failed to dispatch an incoming message: {error}");
            }
        }
    }
}

/// Handle for issuing commands to a running [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    exit: CancellationToken,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::from(ErrorKind::SessionClosed))?;
        reply
            .await
            .map_err(|_| Error::from(ErrorKind::SessionClosed))?
    }

    /// Register a ticket. See [`LeaseManager::add_ticket`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited, or any error of the underlying call.
    pub async fn add_ticket(&self, config: TicketConfig) -> Result<TicketHandle, Error> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::AddTicket { config, reply: tx }, rx).await
    }

    /// Drop a ticket. See [`LeaseManager::remove_ticket`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited, or any error of the underlying call.
    pub async fn remove_ticket(&self, handle: TicketHandle) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::RemoveTicket { handle, reply: tx }, rx)
            .await
    }

    /// Initiate a grant proposal. See [`LeaseManager::acquire`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited, or any error of the underlying call.
    pub async fn acquire(
        &self,
        handle: TicketHandle,
        clear: ClearMode,
        renew: bool,
        on_done: Option<CompletionHandler>,
    ) -> Result<Round, Error> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Acquire {
                handle,
                clear,
                renew,
                on_done,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Drive a release proposal. See [`LeaseManager::release`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited, or any error of the underlying call.
    pub async fn release(
        &self,
        handle: TicketHandle,
        on_done: Option<CompletionHandler>,
    ) -> Result<Round, Error> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Release {
                handle,
                on_done,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Reconstruct ticket state after a restart. See
    /// [`LeaseManager::status_recovery`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited, or any error of the underlying call.
    pub async fn status_recovery(&self, handle: TicketHandle) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::StatusRecovery { handle, reply: tx }, rx)
            .await
    }

    /// Observable state of a ticket. See [`LeaseManager::status`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited, or any error of the underlying call.
    pub async fn status(&self, handle: TicketHandle) -> Result<TicketStatus, Error> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Status { handle, reply: tx }, rx).await
    }

    /// Hand an incoming protocol message to the session; delivery failures
    /// are logged by the driver.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`SessionClosed`](ErrorKind::SessionClosed)
    /// if the session has exited.
    pub fn inject(&self, buf: Vec<u8>) -> Result<(), Error> {
        self.commands
            .send(Command::Receive { buf })
            .map_err(|_| Error::from(ErrorKind::SessionClosed))
    }

    /// End the session; the running [`Session::run`] call returns.
    pub fn exit(&self) {
        self.exit.cancel();
    }
}
