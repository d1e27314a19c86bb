//! Orchestration of the field and channel links.
//!
//! A [`Bridge`] runs three duties over one [`FieldLink`] and one
//! [`ChannelLink`]:
//!
//! - **supervisor**: reconnects whichever link is down, once per interval
//! - **poll-forward**: reads the register block and forwards it upstream
//! - **command intake**: hands received commands to a [`CommandHandler`]
//!
//! All duties run inside the caller's task and share only the running flag
//! and the two links. Link faults never stop the bridge; an orchestration
//! fault ([`BridgeError`]) shuts it down.

use std::cell::Cell;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use cloudlink_common::OutboundEnvelope;

use crate::channel::{ChannelConnector, ChannelLink};
use crate::commands::{CommandError, CommandHandler};
use crate::field::{FieldConnector, FieldLink};

/// Fault that stops the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Invalid poll spec: {0}")]
    InvalidPollSpec(String),

    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    #[error("Command handler failed: {0}")]
    Command(#[from] CommandError),
}

/// Register block to poll and the poll cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSpec {
    pub start_address: u16,
    pub count: u16,
    pub interval_secs: f64,
}

impl PollSpec {
    /// Poll interval as a duration.
    ///
    /// Fails for a non-finite, negative or zero interval and for an empty
    /// register block.
    pub fn interval(&self) -> Result<Duration, BridgeError> {
        if self.count == 0 {
            return Err(BridgeError::InvalidPollSpec(
                "register count must be > 0".to_string(),
            ));
        }

        match Duration::try_from_secs_f64(self.interval_secs) {
            Ok(interval) if !interval.is_zero() => Ok(interval),
            _ => Err(BridgeError::InvalidPollSpec(format!(
                "poll interval must be a positive number of seconds, got {}",
                self.interval_secs
            ))),
        }
    }
}

/// Cadence of the supervisor and command intake duties.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeTiming {
    /// Time between supervisory passes.
    pub supervise_interval: Duration,
    /// Command intake pause when the channel has nothing to deliver.
    pub idle_interval: Duration,
}

impl Default for BridgeTiming {
    fn default() -> Self {
        Self {
            supervise_interval: Duration::from_secs(5),
            idle_interval: Duration::from_millis(100),
        }
    }
}

impl BridgeTiming {
    fn validate(&self) -> Result<(), BridgeError> {
        if self.supervise_interval.is_zero() {
            return Err(BridgeError::InvalidTiming(
                "supervise interval must be > 0".to_string(),
            ));
        }
        if self.idle_interval.is_zero() {
            return Err(BridgeError::InvalidTiming(
                "idle interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs the bridge duties over a field link and a channel link.
pub struct Bridge<F: FieldConnector, C: ChannelConnector, H: CommandHandler> {
    field: FieldLink<F>,
    channel: ChannelLink<C>,
    handler: H,
    poll: PollSpec,
    timing: BridgeTiming,
    running: Cell<bool>,
    closed: Cell<bool>,
    stopped: Notify,
    fault: Cell<Option<BridgeError>>,
}

impl<F, C, H> Bridge<F, C, H>
where
    F: FieldConnector,
    C: ChannelConnector,
    H: CommandHandler,
{
    /// Create a bridge. It is running until stopped or shut down.
    pub fn new(
        field: FieldLink<F>,
        channel: ChannelLink<C>,
        handler: H,
        poll: PollSpec,
        timing: BridgeTiming,
    ) -> Self {
        Self {
            field,
            channel,
            handler,
            poll,
            timing,
            running: Cell::new(true),
            closed: Cell::new(false),
            stopped: Notify::new(),
            fault: Cell::new(None),
        }
    }

    /// Get a reference to the field link.
    pub fn field(&self) -> &FieldLink<F> {
        &self.field
    }

    /// Get a reference to the channel link.
    pub fn channel(&self) -> &ChannelLink<C> {
        &self.channel
    }

    /// Get a reference to the command handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Whether the duties are still running.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Run until [`stop`](Self::stop) is called or a duty fails.
    pub async fn run(&self) -> Result<(), BridgeError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `signal` resolves, [`stop`](Self::stop) is called, or a duty
    /// fails. Both links are closed before this returns.
    ///
    /// Returns the orchestration fault that stopped the bridge, if any.
    pub async fn run_until(&self, signal: impl Future<Output = ()>) -> Result<(), BridgeError> {
        info!(
            field = %self.field.connector().endpoint(),
            channel = %self.channel.url(),
            "Bridge running"
        );

        tokio::join!(
            self.guard("supervisor", self.supervise()),
            self.guard("poll-forward", self.poll_forward()),
            self.guard("command-intake", self.command_intake()),
            self.watch(signal),
        );

        info!("Bridge stopped");
        match self.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Ask every duty to exit. The running [`run_until`](Self::run_until)
    /// closes the links.
    pub fn stop(&self) {
        self.running.set(false);
        self.stopped.notify_waiters();
    }

    /// Stop the duties and close both links. Idempotent.
    pub async fn shutdown(&self) {
        self.stop();
        if self.closed.replace(true) {
            return;
        }

        debug!("Closing links");
        tokio::join!(self.field.close(), self.channel.close());
    }

    async fn supervise(&self) -> Result<(), BridgeError> {
        self.timing.validate()?;

        while self.running.get() {
            let started = Instant::now();

            tokio::join!(
                async {
                    if !self.field.is_connected() {
                        self.field.connect().await;
                    }
                },
                async {
                    if !self.channel.is_connected() {
                        self.channel.connect().await;
                    }
                },
            );

            let remaining = self
                .timing
                .supervise_interval
                .saturating_sub(started.elapsed());
            self.pause(remaining).await;
        }

        Ok(())
    }

    async fn poll_forward(&self) -> Result<(), BridgeError> {
        let interval = self.poll.interval()?;
        let PollSpec {
            start_address,
            count,
            ..
        } = self.poll;

        while self.running.get() {
            self.pause(interval).await;
            if !self.running.get() || !self.field.is_connected() {
                continue;
            }

            let Some(frame) = self.field.read_registers(start_address, count).await else {
                continue;
            };

            if !self.channel.is_connected() {
                trace!(registers = frame.len(), "Channel down, sample dropped");
                continue;
            }
            self.channel.send(&OutboundEnvelope::update(frame)).await;
        }

        Ok(())
    }

    async fn command_intake(&self) -> Result<(), BridgeError> {
        while self.running.get() {
            if self.channel.is_connected() {
                if let Some(command) = self.channel.receive().await {
                    self.handler.handle(command).await?;
                    continue;
                }
            }
            self.pause(self.timing.idle_interval).await;
        }

        Ok(())
    }

    async fn watch(&self, signal: impl Future<Output = ()>) {
        let mut stopped = pin!(self.stopped.notified());
        stopped.as_mut().enable();

        if self.running.get() {
            tokio::select! {
                _ = signal => info!("Shutdown requested"),
                _ = stopped => {}
            }
        }

        self.shutdown().await;
    }

    /// Run one duty. Its fault, if it is the first one, becomes the result of
    /// [`run_until`](Self::run_until).
    async fn guard(&self, duty: &'static str, work: impl Future<Output = Result<(), BridgeError>>) {
        match work.await {
            Ok(()) => debug!(duty, "Duty exited"),
            Err(e) => {
                error!(duty, error = %e, "Orchestration fault, shutting down");
                let first = self.fault.take();
                self.fault.set(first.or(Some(e)));
                self.shutdown().await;
            }
        }
    }

    /// Sleep for `duration`, returning early once the bridge is stopped.
    async fn pause(&self, duration: Duration) {
        let mut stopped = pin!(self.stopped.notified());
        stopped.as_mut().enable();

        if !self.running.get() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = stopped => {}
        }
    }
}
