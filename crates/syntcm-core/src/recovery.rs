//! Background recovery after unexpected identify reports
//!
//! The dispatch path must never issue commands itself: it runs on the
//! thread that delivers responses. Recovery work is queued to a single
//! worker thread instead. The pending-command state carries the
//! "recovery scheduled" flag, so a burst of identify reports queues one
//! request.

use crate::command::CommandChannel;
use crate::error::Result;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work the recovery thread can be asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryRequest {
    /// The device came up outside application firmware
    RunApplicationFirmware,
    /// The application firmware reset on its own
    Reidentify,
}

/// Handle to the recovery thread
///
/// The thread runs until every sender for its queue is dropped.
pub struct RecoveryWorker {
    handle: JoinHandle<()>,
}

impl RecoveryWorker {
    /// Start the worker; requests sent on the returned sender are handed
    /// to `handler` one at a time
    pub fn spawn<F>(
        channel: Arc<CommandChannel>,
        handler: F,
    ) -> std::io::Result<(Sender<RecoveryRequest>, Self)>
    where
        F: FnMut(RecoveryRequest) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("tcm-recovery".to_string())
            .spawn(move || run(rx, channel, handler))?;
        Ok((tx, Self { handle }))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit; only returns once the queue is closed
    pub fn join(self) {
        if self.handle.join().is_err() {
            log::error!("tcm: recovery thread panicked");
        }
    }
}

fn run<F>(rx: Receiver<RecoveryRequest>, channel: Arc<CommandChannel>, mut handler: F)
where
    F: FnMut(RecoveryRequest) -> Result<()>,
{
    for request in rx {
        log::info!("tcm: running recovery: {:?}", request);
        if let Err(e) = handler(request) {
            log::error!("tcm: recovery {:?} failed: {}", request, e);
        }
        channel.recovery_finished();
    }
    log::debug!("tcm: recovery queue closed");
}
