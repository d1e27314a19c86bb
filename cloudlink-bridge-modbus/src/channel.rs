//! Resilient client for the cloud WebSocket channel.
//!
//! The connection is kept as two halves so a pending [`ChannelLink::receive`]
//! never holds up [`ChannelLink::send`]. A send fault or [`ChannelLink::close`]
//! wakes a pending receive through a reset notification.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace};

use cloudlink_common::{
    Backoff, DEFAULT_THROTTLE_WINDOW, ErrorKey, ErrorThrottle, InboundCommand, LinkState,
    OutboundEnvelope, decode_command,
};

const LINK: &str = "channel";

/// Fault raised by a channel transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelFault {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport fault: {0}")]
    Transport(String),
    #[error("Closed by peer: {0}")]
    Closed(String),
    #[error("Malformed payload: {0}")]
    Decode(String),
    #[error("Could not encode message: {0}")]
    Encode(String),
}

impl ChannelFault {
    /// Throttle key for this fault.
    pub fn key(&self) -> ErrorKey {
        match self {
            ChannelFault::Connect(_) => ErrorKey::ConnectFailed,
            ChannelFault::Timeout(_) => ErrorKey::Timeout,
            ChannelFault::Transport(_) | ChannelFault::Closed(_) => ErrorKey::TransportBroken,
            ChannelFault::Decode(_) | ChannelFault::Encode(_) => ErrorKey::DecodeError,
        }
    }

    /// Whether the connection is unusable after this fault.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChannelFault::Timeout(_) | ChannelFault::Transport(_) | ChannelFault::Closed(_)
        )
    }
}

/// Write half of a channel connection.
pub trait FrameSink {
    /// Write one text frame.
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), ChannelFault>>;

    /// Close the connection politely. Errors are ignored.
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// Read half of a channel connection.
pub trait FrameSource {
    /// Wait for the next text payload.
    fn next_text(&mut self) -> impl Future<Output = Result<String, ChannelFault>>;
}

/// Opens channel connections. One call is one handshake attempt.
pub trait ChannelConnector {
    type Sink: FrameSink;
    type Source: FrameSource;

    /// Perform a single connection attempt.
    fn connect(&self) -> impl Future<Output = Result<(Self::Sink, Self::Source), ChannelFault>>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Reconnect behaviour of a [`ChannelLink`].
#[derive(Debug, Clone)]
pub struct ChannelLinkOptions {
    /// Connect attempts per call to [`ChannelLink::connect`].
    pub retries: u32,
    /// Bound on each connect attempt.
    pub connect_timeout: Duration,
    /// Bound on writing one frame.
    pub send_timeout: Duration,
    /// Delay between attempts.
    pub backoff: Backoff,
    /// Window for suppressing repeated faults.
    pub throttle_window: Duration,
}

impl Default for ChannelLinkOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            backoff: Backoff::constant(Duration::from_secs(2)),
            throttle_window: DEFAULT_THROTTLE_WINDOW,
        }
    }
}

/// Resilient client for the cloud channel.
pub struct ChannelLink<C: ChannelConnector> {
    connector: C,
    options: ChannelLinkOptions,
    state: Cell<LinkState>,
    closed: Cell<bool>,
    connects: Cell<u64>,
    generation: Cell<u64>,
    sink: Mutex<Option<C::Sink>>,
    source: Mutex<Option<C::Source>>,
    reset: Notify,
    throttle: RefCell<ErrorThrottle>,
}

impl<C: ChannelConnector> ChannelLink<C> {
    /// Create a disconnected link.
    pub fn new(connector: C, options: ChannelLinkOptions) -> Self {
        let throttle = ErrorThrottle::new(options.throttle_window);
        Self {
            connector,
            options,
            state: Cell::new(LinkState::Disconnected),
            closed: Cell::new(false),
            connects: Cell::new(0),
            generation: Cell::new(0),
            sink: Mutex::new(None),
            source: Mutex::new(None),
            reset: Notify::new(),
            throttle: RefCell::new(throttle),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    /// Whether the link is connected.
    pub fn is_connected(&self) -> bool {
        self.state.get() == LinkState::Connected
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.get()
    }

    /// Get a reference to the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Endpoint this link connects to.
    pub fn url(&self) -> String {
        self.connector.endpoint()
    }

    /// Connect with bounded retries, each attempt bounded by the connect
    /// timeout.
    pub async fn connect(&self) {
        if self.closed.get() || self.state.get() != LinkState::Disconnected {
            return;
        }
        self.set_state(LinkState::Connecting);

        for attempt in 0..self.options.retries {
            let outcome =
                match tokio::time::timeout(self.options.connect_timeout, self.connector.connect())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ChannelFault::Connect(format!(
                        "handshake timed out after {:?}",
                        self.options.connect_timeout
                    ))),
                };

            match outcome {
                Ok((mut sink, source)) => {
                    let mut sink_slot = self.sink.lock().await;
                    let mut source_slot = self.source.lock().await;
                    if self.closed.get() {
                        drop((sink_slot, source_slot));
                        sink.close().await;
                        return;
                    }
                    *sink_slot = Some(sink);
                    *source_slot = Some(source);
                    self.generation.set(self.generation.get() + 1);
                    drop((sink_slot, source_slot));

                    self.connects.set(self.connects.get() + 1);
                    self.set_state(LinkState::Connected);
                    info!(
                        link = LINK,
                        endpoint = %self.connector.endpoint(),
                        attempt = attempt + 1,
                        "Channel connected"
                    );
                    return;
                }
                Err(fault) => {
                    self.report(&fault);
                    if attempt + 1 < self.options.retries {
                        tokio::time::sleep(self.options.backoff.delay(attempt)).await;
                    }
                    if self.closed.get() {
                        return;
                    }
                }
            }
        }

        if self.state.get() == LinkState::Connecting {
            self.set_state(LinkState::Disconnected);
        }
        debug!(
            link = LINK,
            retries = self.options.retries,
            "Connect attempts exhausted"
        );
    }

    /// Write one envelope as a text frame.
    ///
    /// Does nothing unless connected. A transport fault disconnects the link
    /// and the envelope is lost.
    pub async fn send(&self, envelope: &OutboundEnvelope) {
        if self.state.get() != LinkState::Connected {
            return;
        }

        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                self.report(&ChannelFault::Encode(e.to_string()));
                return;
            }
        };

        let mut guard = self.sink.lock().await;
        let generation = self.generation.get();
        let Some(sink) = guard.as_mut() else {
            return;
        };

        let result = match tokio::time::timeout(self.options.send_timeout, sink.send_text(text))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelFault::Timeout(self.options.send_timeout)),
        };

        match result {
            Ok(()) => {
                trace!(link = LINK, registers = envelope.data.len(), "Telemetry sent");
            }
            Err(fault) => {
                guard.take();
                drop(guard);
                self.drop_connection(&fault, generation).await;
            }
        }
    }

    /// Wait for the next command.
    ///
    /// Returns `None` at once unless connected, and `None` when the transport
    /// faults, the payload cannot be decoded, or the link is reset.
    pub async fn receive(&self) -> Option<InboundCommand> {
        if self.state.get() != LinkState::Connected {
            return None;
        }

        let mut reset = pin!(self.reset.notified());
        reset.as_mut().enable();

        let mut guard = self.source.lock().await;
        if self.state.get() != LinkState::Connected {
            return None;
        }
        let generation = self.generation.get();
        let source = guard.as_mut()?;

        let frame = tokio::select! {
            frame = source.next_text() => Some(frame),
            _ = reset.as_mut() => None,
        };
        let Some(frame) = frame else {
            guard.take();
            return None;
        };

        match frame {
            Ok(text) => match decode_command(&text) {
                Ok(command) => Some(command),
                Err(e) => {
                    self.report(&ChannelFault::Decode(e.to_string()));
                    None
                }
            },
            Err(fault) if fault.is_transport() => {
                guard.take();
                drop(guard);
                self.drop_connection(&fault, generation).await;
                None
            }
            Err(fault) => {
                self.report(&fault);
                None
            }
        }
    }

    /// Close the connection. Idempotent; the link never reconnects afterwards.
    pub async fn close(&self) {
        self.closed.set(true);
        if self.state.get() != LinkState::Disconnected {
            self.set_state(LinkState::Disconnected);
        }
        self.reset.notify_waiters();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if tokio::time::timeout(self.options.send_timeout, sink.close())
                .await
                .is_err()
            {
                debug!(link = LINK, "Close handshake timed out");
            }
            info!(link = LINK, "Channel link closed");
        }
        self.source.lock().await.take();
    }

    /// Disconnect after a transport fault and release both halves.
    ///
    /// `generation` identifies the connection that faulted. Once a newer
    /// connection has been installed the fault no longer applies to the link.
    async fn drop_connection(&self, fault: &ChannelFault, generation: u64) {
        if self.generation.get() != generation {
            trace!(link = LINK, error = %fault, "Fault on a replaced connection");
            return;
        }

        if self.state.get() == LinkState::Connected {
            self.set_state(LinkState::Disconnected);
        }
        self.report(fault);
        self.reset.notify_waiters();

        let mut sink = self.sink.lock().await;
        if self.generation.get() == generation {
            sink.take();
        }
        drop(sink);

        let mut source = self.source.lock().await;
        if self.generation.get() == generation {
            source.take();
        }
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state.replace(next);
        debug_assert!(
            prev.can_transition_to(next),
            "illegal channel link transition {} -> {}",
            prev,
            next
        );
        debug!(link = LINK, from = %prev, to = %next, "Link state changed");
    }

    fn report(&self, fault: &ChannelFault) {
        let key = fault.key();
        if self.throttle.borrow_mut().should_emit(key) {
            error!(link = LINK, key = %key, error = %fault, "Channel link fault");
        } else {
            trace!(link = LINK, key = %key, error = %fault, "Channel link fault (suppressed)");
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a WebSocket connection.
pub type WsSink = SplitSink<WsStream, Message>;

/// Read half of a WebSocket connection.
pub type WsSource = SplitStream<WsStream>;

/// Opens WebSocket connections (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Get the URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ChannelConnector for WsConnector {
    type Sink = WsSink;
    type Source = WsSource;

    async fn connect(&self) -> Result<(WsSink, WsSource), ChannelFault> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelFault::Connect(e.to_string()))?;

        debug!(link = LINK, status = %response.status(), "WebSocket handshake complete");
        Ok(stream.split())
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelFault> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| ChannelFault::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = SinkExt::close(self).await {
            debug!(link = LINK, error = %e, "Error while closing WebSocket");
        }
    }
}

impl FrameSource for WsSource {
    async fn next_text(&mut self) -> Result<String, ChannelFault> {
        loop {
            match self.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| ChannelFault::Decode(e.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason =
                        frame.map_or_else(|| "no reason".to_string(), |f| f.reason.to_string());
                    return Err(ChannelFault::Closed(reason));
                }
                // ping, pong and raw frames
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ChannelFault::Transport(e.to_string())),
                None => return Err(ChannelFault::Closed("stream ended".to_string())),
            }
        }
    }
}
