//! The frame saver actor.
//!
//! One Tokio task owns the [`SessionController`]. It is driven by two event
//! sources: commands from [`FrameSaverHandle`]s (frame batches included) and a
//! fixed-period flush tick. Disk writes of a tick run on the blocking pool, so
//! the actor keeps admitting batches while a chunk is being written; at most
//! one flush job is in flight at a time, which keeps chunks in FIFO order.
//!
//! ```text
//! capture thread --submit--> [unbounded mpsc] --> FrameSaver task
//!                                                    |  tick
//!                                                    v
//!                                             spawn_blocking(FlushJob::run)
//! ```
//!
//! The command channel is unbounded and a sender never blocks. Frame bytes
//! waiting in the channel are charged to a budget shared with the handles:
//! in-transit bytes plus the queue RAM last published by the actor stay within
//! the queue RAM ceiling. A batch that does not fit is released by
//! [`FrameSaverHandle::submit`] right away and only its metadata is sent, so
//! the session still counts it as dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framestream::{config::SaverConfig, registry::ResourceRegistry};
//! use framestream::saver_actor::FrameSaver;
//! use framestream::session::SaveOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (saver, task) = FrameSaver::spawn(&SaverConfig::default(), Arc::new(ResourceRegistry::new()));
//! saver.save_start(SaveOptions::new("/data/run01.cam")).await?;
//! // saver.submit(batch)?; ...
//! saver.save_stop().await?;
//! saver.shutdown().await?;
//! task.await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_core::{FrameBatch, StreamError, StreamResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::SaverConfig;
use crate::messages::SaverCommand;
use crate::registry::ResourceRegistry;
use crate::session::{
    FlushOutcome, PretriggerOptions, SaveOptions, SaveState, SaveStatus, SessionController,
};

/// Frame bytes between [`FrameSaverHandle::submit`] and the actor.
#[derive(Debug)]
struct InboxBudget {
    in_transit: AtomicU64,
    queued: AtomicU64,
    max: AtomicU64,
}

impl InboxBudget {
    fn new(max: u64) -> Self {
        Self {
            in_transit: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            max: AtomicU64::new(max),
        }
    }

    /// Charge `nbytes` unless that would cross the ceiling.
    fn try_charge(&self, nbytes: u64) -> bool {
        let queued = self.queued.load(Ordering::Acquire);
        let max = self.max.load(Ordering::Acquire);
        self.in_transit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(nbytes)?;
                (next.checked_add(queued)? <= max).then_some(next)
            })
            .is_ok()
    }

    fn release(&self, nbytes: u64) {
        self.in_transit.fetch_sub(nbytes, Ordering::AcqRel);
    }
}

/// Actor owning the save session.
pub struct FrameSaver {
    controller: SessionController,
    flush_period: Duration,
    in_flight: Option<JoinHandle<FlushOutcome>>,
    status_tx: watch::Sender<SaveStatus>,
    budget: Arc<InboxBudget>,
}

async fn join_in_flight(
    job: &mut Option<JoinHandle<FlushOutcome>>,
) -> Result<FlushOutcome, JoinError> {
    match job {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl FrameSaver {
    /// Create the actor and the receiving end of its status channel.
    pub fn new(
        config: &SaverConfig,
        registry: Arc<ResourceRegistry>,
    ) -> (Self, watch::Receiver<SaveStatus>) {
        let controller = SessionController::new(config, registry);
        let (status_tx, status_rx) = watch::channel(controller.status());
        (
            Self {
                controller,
                flush_period: config.saver.flush_period,
                in_flight: None,
                status_tx,
                budget: Arc::new(InboxBudget::new(config.saver.max_queue_ram)),
            },
            status_rx,
        )
    }

    /// Spawn the actor on the current runtime.
    pub fn spawn(
        config: &SaverConfig,
        registry: Arc<ResourceRegistry>,
    ) -> (FrameSaverHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (actor, status) = Self::new(config, registry);
        let budget = Arc::clone(&actor.budget);
        let task = tokio::spawn(actor.run(rx));
        (FrameSaverHandle { tx, status, budget }, task)
    }

    /// Event loop. Returns after `Shutdown` or when every handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<SaverCommand>) {
        info!(flush_period = ?self.flush_period, "Frame saver started");
        let mut ticker = tokio::time::interval(self.flush_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle(command).await {
                                break;
                            }
                        }
                        None => {
                            info!("Command channel closed, shutting down frame saver");
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                _ = ticker.tick() => self.tick(),

                result = join_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.complete(result);
                }
            }
            self.publish();
        }

        self.publish();
        info!("Frame saver stopped");
    }

    async fn handle(&mut self, command: SaverCommand) -> bool {
        match command {
            SaverCommand::Submit { batch } => {
                let nbytes = batch.nbytes();
                self.controller.submit(batch);
                // Publish the queue charge before freeing the transit charge.
                self.sync_budget();
                self.budget.release(nbytes);
            }

            SaverCommand::Shed { header } => {
                self.controller.shed(header);
            }

            SaverCommand::SaveStart { options, response } => {
                let result = self.start(*options).await;
                self.publish();
                let _ = response.send(result);
            }

            SaverCommand::SaveStop { response } => {
                self.controller.save_stop();
                self.controller.maybe_finalize();
                self.publish();
                let _ = response.send(self.controller.state());
            }

            SaverCommand::SetupPretrigger { options, response } => {
                let result = self.controller.setup_pretrigger(options);
                self.publish();
                let _ = response.send(result);
            }

            SaverCommand::ClearPretrigger { response } => {
                self.controller.clear_pretrigger();
                self.publish();
                let _ = response.send(());
            }

            SaverCommand::SetupQueueRam {
                max_bytes,
                response,
            } => {
                self.controller.setup_queue_ram(max_bytes);
                self.budget.max.store(max_bytes, Ordering::Release);
                self.publish();
                let _ = response.send(());
            }

            SaverCommand::WriteEventLog { message, response } => {
                let _ = response.send(self.controller.write_event_log(&message));
            }

            SaverCommand::GetStatus { response } => {
                let _ = response.send(self.controller.status());
            }

            SaverCommand::Shutdown { response } => {
                info!("Shutdown command received");
                self.shutdown().await;
                self.publish();
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    async fn start(&mut self, options: SaveOptions) -> StreamResult<()> {
        // A bad path must not disturb the running session.
        self.controller.validate_start(&options)?;
        self.settle().await;
        self.drain().await;
        self.controller.save_start(options)
    }

    fn tick(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        match self.controller.prepare_flush() {
            Some(job) => {
                debug!(frames = job.frames(), "Flushing chunk");
                self.in_flight = Some(tokio::task::spawn_blocking(move || job.run()));
            }
            None => self.controller.maybe_finalize(),
        }
    }

    fn complete(&mut self, result: Result<FlushOutcome, JoinError>) {
        match result {
            Ok(outcome) => self.controller.complete_flush(outcome),
            Err(e) => {
                error!(error = %e, "Flush job did not complete");
                self.controller.fail_in_flight(&e.to_string());
            }
        }
    }

    /// Wait for the flush job in flight, if any.
    async fn settle(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            let result = handle.await;
            self.complete(result);
        }
    }

    /// Write everything still queued, off the actor task.
    async fn drain(&mut self) {
        while let Some(job) = self.controller.prepare_drain() {
            let result = tokio::task::spawn_blocking(move || job.run()).await;
            self.complete(result);
        }
    }

    async fn shutdown(&mut self) {
        self.settle().await;
        self.controller.save_stop();
        self.drain().await;
        self.controller.finalize();
    }

    fn sync_budget(&self) {
        self.budget
            .queued
            .store(self.controller.queue_ram(), Ordering::Release);
    }

    fn publish(&self) {
        self.sync_budget();
        let status = self.controller.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

/// Cloneable handle to a running [`FrameSaver`].
#[derive(Debug, Clone)]
pub struct FrameSaverHandle {
    tx: mpsc::UnboundedSender<SaverCommand>,
    status: watch::Receiver<SaveStatus>,
    budget: Arc<InboxBudget>,
}

impl FrameSaverHandle {
    async fn request<T>(&self, (command, rx): (SaverCommand, oneshot::Receiver<T>)) -> StreamResult<T> {
        self.tx
            .send(command)
            .map_err(|_| StreamError::ServiceClosed)?;
        rx.await.map_err(|_| StreamError::ServiceClosed)
    }

    /// Hand a batch to the saver. Never waits.
    ///
    /// If the batch does not fit in the RAM budget its frames are released
    /// here and the saver only records the drop.
    pub fn submit(&self, batch: FrameBatch) -> StreamResult<()> {
        let nbytes = batch.nbytes();
        let command = if self.budget.try_charge(nbytes) {
            SaverCommand::submit(batch)
        } else {
            SaverCommand::shed(batch.header())
        };
        self.tx.send(command).map_err(|e| {
            if let SaverCommand::Submit { .. } = e.0 {
                self.budget.release(nbytes);
            }
            StreamError::ServiceClosed
        })
    }

    /// Frame bytes submitted but not yet taken by the saver.
    pub fn inbox_bytes(&self) -> u64 {
        self.budget.in_transit.load(Ordering::Acquire)
    }

    /// Start a save session.
    pub async fn save_start(&self, options: SaveOptions) -> StreamResult<()> {
        self.request(SaverCommand::save_start(options)).await?
    }

    /// Request a graceful stop; returns the state right after the request.
    pub async fn save_stop(&self) -> StreamResult<SaveState> {
        self.request(SaverCommand::save_stop()).await
    }

    /// Create, resize or remove the pretrigger ring.
    pub async fn setup_pretrigger(&self, options: PretriggerOptions) -> StreamResult<()> {
        self.request(SaverCommand::setup_pretrigger(options)).await?
    }

    /// Empty the pretrigger ring.
    pub async fn clear_pretrigger(&self) -> StreamResult<()> {
        self.request(SaverCommand::clear_pretrigger()).await
    }

    /// Change the queue RAM ceiling.
    pub async fn setup_queue_ram(&self, max_bytes: u64) -> StreamResult<()> {
        self.request(SaverCommand::setup_queue_ram(max_bytes)).await
    }

    /// Add an event log entry; `false` if no session is active.
    pub async fn write_event_log(&self, message: impl Into<String>) -> StreamResult<bool> {
        self.request(SaverCommand::write_event_log(message)).await?
    }

    /// Current status, straight from the actor.
    pub async fn status(&self) -> StreamResult<SaveStatus> {
        self.request(SaverCommand::get_status()).await
    }

    /// Last published status, without a round trip.
    pub fn latest_status(&self) -> SaveStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.status.clone()
    }

    /// Wait until the saver reports `state`.
    pub async fn wait_for_state(
        &self,
        state: SaveState,
        timeout: Duration,
    ) -> StreamResult<SaveStatus> {
        let mut rx = self.status.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|s| s.state == state)).await {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(StreamError::ServiceClosed),
            Err(_) => Err(StreamError::Timeout(format!("saver state '{}'", state))),
        };
        result
    }

    /// Finish any session and stop the actor.
    pub async fn shutdown(&self) -> StreamResult<()> {
        self.request(SaverCommand::shutdown()).await
    }
}
