//! Command/response correlation
//!
//! The protocol has no request ids: a response belongs to whatever command
//! is pending. Only one command may therefore be in flight per device,
//! which the issue lock enforces. The dispatch path and the issuing path
//! both touch the pending command only under the state lock.

use crate::error::{CommandError, TransportError};
use crate::protocol::{status, Command};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How long to wait for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseTimeout {
    #[default]
    Default,
    /// Lightweight config reads and writes
    Short,
    /// Production test commands
    Long,
    /// Flash erase and write
    Flash,
    Custom(Duration),
}

impl From<Duration> for ResponseTimeout {
    /// A zero duration selects the default timeout
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            ResponseTimeout::Default
        } else {
            ResponseTimeout::Custom(d)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

/// The single outstanding command
#[derive(Debug, Default)]
pub struct PendingCommand {
    pub command: Option<Command>,
    pub status: CommandStatus,
    /// Status code of the response frame
    pub response_code: u8,
    pub response: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChannelState {
    pending: PendingCommand,
    recovery_scheduled: bool,
}

/// Serializes command issue and hands responses back to the issuer
#[derive(Debug, Default)]
pub struct CommandChannel {
    issue_lock: Mutex<()>,
    reset_lock: Mutex<()>,
    state: Mutex<ChannelState>,
    signal: Condvar,
}

impl CommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue `command` and wait for its response
    ///
    /// `send` puts the command on the wire; it runs after the command is
    /// marked busy so a fast response cannot be missed. Another thread
    /// must be reading and dispatching frames meanwhile.
    pub fn issue<F>(&self, command: Command, timeout: Duration, send: F) -> Result<Vec<u8>, CommandError>
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        let _issue = lock(&self.issue_lock);
        self.begin(command, send)?;

        let state = lock(&self.state);
        let (mut state, _) = self
            .signal
            .wait_timeout_while(state, timeout, |s| s.pending.status == CommandStatus::Busy)
            .unwrap_or_else(PoisonError::into_inner);
        settle(command, std::mem::take(&mut state.pending))
    }

    /// Issue `command` and drive the reads for its response on this thread
    ///
    /// `poll` reads and dispatches one frame; it runs until the command
    /// settles or `timeout` passes.
    pub fn issue_polling<F, P>(
        &self,
        command: Command,
        timeout: Duration,
        send: F,
        mut poll: P,
    ) -> Result<Vec<u8>, CommandError>
    where
        F: FnOnce() -> Result<(), TransportError>,
        P: FnMut(),
    {
        let _issue = lock(&self.issue_lock);
        self.begin(command, send)?;

        let deadline = Instant::now() + timeout;
        while self.is_busy() && Instant::now() < deadline {
            poll();
        }
        settle(command, std::mem::take(&mut lock(&self.state).pending))
    }

    fn begin<F>(&self, command: Command, send: F) -> Result<(), CommandError>
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        lock(&self.state).pending = PendingCommand {
            command: Some(command),
            status: CommandStatus::Busy,
            ..Default::default()
        };

        if let Err(source) = send() {
            lock(&self.state).pending = PendingCommand::default();
            return Err(CommandError::Send { command, source });
        }
        Ok(())
    }

    /// Hand a response frame to the pending command
    ///
    /// Returns false if no command was waiting.
    pub fn deliver_response(&self, code: u8, payload: Vec<u8>) -> bool {
        let mut state = lock(&self.state);
        if state.pending.status != CommandStatus::Busy {
            log::warn!("tcm: not expecting a response (code 0x{:02x})", code);
            return false;
        }
        state.pending.response_code = code;
        state.pending.response = payload;
        state.pending.status = CommandStatus::Idle;
        self.signal.notify_all();
        true
    }

    /// Fail the pending command after a framing or bus error
    pub fn abort_pending(&self) -> Option<Command> {
        let mut state = lock(&self.state);
        if state.pending.status != CommandStatus::Busy {
            return None;
        }
        state.pending.status = CommandStatus::Error;
        self.signal.notify_all();
        state.pending.command
    }

    /// Settle the pending command after an identify report
    ///
    /// Reset and mode-switch commands complete here. Any other busy command
    /// was interrupted by an unexpected device reset and fails.
    pub fn resolve_on_identify(&self, identify_payload: &[u8]) -> Option<(Command, CommandStatus)> {
        let mut state = lock(&self.state);
        if state.pending.status != CommandStatus::Busy {
            return None;
        }
        let command = state.pending.command?;
        if command.completes_on_identify() {
            state.pending.status = CommandStatus::Idle;
            state.pending.response_code = status::OK;
            state.pending.response = identify_payload.to_vec();
        } else {
            log::error!("tcm: device has been reset while {} was pending", command);
            state.pending.status = CommandStatus::Error;
        }
        self.signal.notify_all();
        Some((command, state.pending.status))
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).pending.status == CommandStatus::Busy
    }

    pub fn pending_command(&self) -> Option<Command> {
        let state = lock(&self.state);
        match state.pending.status {
            CommandStatus::Busy => state.pending.command,
            _ => None,
        }
    }

    /// Serialize resets and firmware mode switches
    pub fn lock_reset(&self) -> MutexGuard<'_, ()> {
        lock(&self.reset_lock)
    }

    /// True while some thread holds the reset lock
    pub fn reset_in_progress(&self) -> bool {
        matches!(self.reset_lock.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// Claim the recovery slot; false if recovery is already scheduled
    pub fn try_schedule_recovery(&self) -> bool {
        let mut state = lock(&self.state);
        if state.recovery_scheduled {
            return false;
        }
        state.recovery_scheduled = true;
        true
    }

    pub fn recovery_finished(&self) {
        lock(&self.state).recovery_scheduled = false;
    }

    pub fn recovery_scheduled(&self) -> bool {
        lock(&self.state).recovery_scheduled
    }
}

fn settle(command: Command, pending: PendingCommand) -> Result<Vec<u8>, CommandError> {
    match pending.status {
        CommandStatus::Busy => {
            log::error!("tcm: timed out waiting for response to {}", command);
            Err(CommandError::Timeout { command })
        }
        CommandStatus::Error => {
            log::error!("tcm: {} aborted", command);
            Err(CommandError::Aborted { command })
        }
        CommandStatus::Idle if pending.response_code == status::ERROR => {
            let code = pending.response.first().copied();
            log::error!("tcm: {} failed, error code {:?}", command, code);
            Err(CommandError::DeviceError { command, code })
        }
        CommandStatus::Idle => Ok(pending.response),
    }
}
