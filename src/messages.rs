//! Commands accepted by the [`FrameSaver`](crate::saver_actor::FrameSaver) actor.
//!
//! Every command that expects an answer carries a `oneshot::Sender`; the
//! helper constructors return the matching receiver:
//!
//! ```rust
//! use framestream::messages::SaverCommand;
//!
//! let (cmd, rx) = SaverCommand::save_stop();
//! // cmd_tx.send(cmd)?;
//! // let state = rx.await?;
//! # drop((cmd, rx));
//! ```
//!
//! [`SaverCommand::Submit`] has no response. Frame delivery must never wait
//! on the saver, so the capture path only enqueues and moves on. A batch that
//! would push the inbox over the RAM budget travels as [`SaverCommand::Shed`]
//! instead, carrying only its accounting metadata.

use stream_core::{BatchHeader, FrameBatch, StreamResult};
use tokio::sync::oneshot;

use crate::session::{PretriggerOptions, SaveOptions, SaveState, SaveStatus};

/// Commands for the frame saver actor.
#[derive(Debug)]
pub enum SaverCommand {
    /// New frames from the capture source.
    Submit {
        /// The batch
        batch: FrameBatch,
    },

    /// A batch released by the sender because the RAM budget was exhausted.
    Shed {
        /// Accounting metadata of the released batch
        header: BatchHeader,
    },

    /// Start a save session, finishing any running one first.
    ///
    /// # Response
    ///
    /// - `Ok(())`: session is `Saving`
    /// - `Err`: invalid path or options, or the target files could not be
    ///   prepared; the previous state is kept when the path is invalid
    SaveStart {
        /// Session options
        options: Box<SaveOptions>,
        /// Response channel
        response: oneshot::Sender<StreamResult<()>>,
    },

    /// Stop admitting frames and drain the queue.
    ///
    /// # Response
    ///
    /// State right after the request (`Stopping`, or `Stopped` if idle).
    SaveStop {
        /// Response channel
        response: oneshot::Sender<SaveState>,
    },

    /// Create, resize or remove the pretrigger ring.
    SetupPretrigger {
        /// Ring options
        options: PretriggerOptions,
        /// Response channel
        response: oneshot::Sender<StreamResult<()>>,
    },

    /// Empty the pretrigger ring.
    ClearPretrigger {
        /// Response channel
        response: oneshot::Sender<()>,
    },

    /// Change the queue RAM ceiling.
    SetupQueueRam {
        /// New ceiling in bytes
        max_bytes: u64,
        /// Response channel
        response: oneshot::Sender<()>,
    },

    /// Add an entry to the session event log.
    ///
    /// # Response
    ///
    /// `Ok(true)` if written, `Ok(false)` if no session is active.
    WriteEventLog {
        /// Message text
        message: String,
        /// Response channel
        response: oneshot::Sender<StreamResult<bool>>,
    },

    /// Current observable state.
    GetStatus {
        /// Response channel
        response: oneshot::Sender<SaveStatus>,
    },

    /// Drain and finalize any session, then exit the actor loop.
    Shutdown {
        /// Response channel (acknowledges shutdown)
        response: oneshot::Sender<()>,
    },
}

impl SaverCommand {
    /// Frames from the capture source.
    pub fn submit(batch: FrameBatch) -> Self {
        SaverCommand::Submit { batch }
    }

    /// A batch dropped before it reached the saver.
    pub fn shed(header: BatchHeader) -> Self {
        SaverCommand::Shed { header }
    }

    /// Create a SaveStart command with response channel.
    pub fn save_start(options: SaveOptions) -> (Self, oneshot::Receiver<StreamResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            SaverCommand::SaveStart {
                options: Box::new(options),
                response: tx,
            },
            rx,
        )
    }

    /// Create a SaveStop command with response channel.
    pub fn save_stop() -> (Self, oneshot::Receiver<SaveState>) {
        let (tx, rx) = oneshot::channel();
        (SaverCommand::SaveStop { response: tx }, rx)
    }

    /// Create a SetupPretrigger command with response channel.
    pub fn setup_pretrigger(
        options: PretriggerOptions,
    ) -> (Self, oneshot::Receiver<StreamResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            SaverCommand::SetupPretrigger {
                options,
                response: tx,
            },
            rx,
        )
    }

    /// Create a ClearPretrigger command with response channel.
    pub fn clear_pretrigger() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (SaverCommand::ClearPretrigger { response: tx }, rx)
    }

    /// Create a SetupQueueRam command with response channel.
    pub fn setup_queue_ram(max_bytes: u64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            SaverCommand::SetupQueueRam {
                max_bytes,
                response: tx,
            },
            rx,
        )
    }

    /// Create a WriteEventLog command with response channel.
    pub fn write_event_log(
        message: impl Into<String>,
    ) -> (Self, oneshot::Receiver<StreamResult<bool>>) {
        let (tx, rx) = oneshot::channel();
        (
            SaverCommand::WriteEventLog {
                message: message.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Create a GetStatus command with response channel.
    pub fn get_status() -> (Self, oneshot::Receiver<SaveStatus>) {
        let (tx, rx) = oneshot::channel();
        (SaverCommand::GetStatus { response: tx }, rx)
    }

    /// Create a Shutdown command with response channel.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (SaverCommand::Shutdown { response: tx }, rx)
    }
}
