//! Resilient client for the Modbus field device.
//!
//! [`FieldLink`] owns the connection state machine and fault throttling. The
//! wire work is delegated to a [`FieldConnector`], which is [`ModbusConnector`]
//! in production.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_modbus::client::{Client, Context, Reader, rtu, tcp};
use tokio_modbus::prelude::Slave;
use tracing::{debug, error, info, trace};

use cloudlink_common::{
    Backoff, DEFAULT_THROTTLE_WINDOW, ErrorKey, ErrorThrottle, LinkState, RegisterFrame,
};

use crate::config::{ConnectionConfig, ModbusConfig};

const LINK: &str = "field";

/// Fault raised by a field transport.
#[derive(Debug, thiserror::Error)]
pub enum FieldFault {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Transport fault: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl FieldFault {
    /// Throttle key for this fault.
    pub fn key(&self) -> ErrorKey {
        match self {
            FieldFault::Connect(_) => ErrorKey::ConnectFailed,
            FieldFault::Exception(_) => ErrorKey::ReadError,
            FieldFault::Transport(_) => ErrorKey::TransportBroken,
            FieldFault::Protocol(_) => ErrorKey::ProtocolError,
            FieldFault::Timeout(_) => ErrorKey::Timeout,
        }
    }
}

/// An open connection to a field device.
pub trait FieldTransport {
    /// Read `count` contiguous holding registers starting at `address`.
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, FieldFault>>;

    /// Release the underlying handle.
    fn disconnect(&mut self) -> impl Future<Output = ()>;
}

/// Opens [`FieldTransport`]s. One call is one handshake attempt.
pub trait FieldConnector {
    type Transport: FieldTransport;

    /// Perform a single connection attempt.
    fn connect(&self) -> impl Future<Output = Result<Self::Transport, FieldFault>>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Reconnect behaviour of a [`FieldLink`].
#[derive(Debug, Clone)]
pub struct FieldLinkOptions {
    /// Connect attempts per call to [`FieldLink::connect`].
    pub retries: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
    /// Window for suppressing repeated faults.
    pub throttle_window: Duration,
}

impl Default for FieldLinkOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::default(),
            throttle_window: DEFAULT_THROTTLE_WINDOW,
        }
    }
}

/// Resilient client for the field device.
///
/// Every operation returns data or nothing; faults are only visible through
/// throttled logs. All methods take `&self` so the orchestrator's duties can
/// share one link inside a single task.
pub struct FieldLink<C: FieldConnector> {
    connector: C,
    options: FieldLinkOptions,
    state: Cell<LinkState>,
    closed: Cell<bool>,
    connects: Cell<u64>,
    transport: Mutex<Option<C::Transport>>,
    throttle: RefCell<ErrorThrottle>,
}

impl<C: FieldConnector> FieldLink<C> {
    /// Create a disconnected link.
    pub fn new(connector: C, options: FieldLinkOptions) -> Self {
        let throttle = ErrorThrottle::new(options.throttle_window);
        Self {
            connector,
            options,
            state: Cell::new(LinkState::Disconnected),
            closed: Cell::new(false),
            connects: Cell::new(0),
            transport: Mutex::new(None),
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

    /// Connect with bounded retries.
    ///
    /// Returns without signaling failure when the retry budget runs out; the
    /// link is then left disconnected for the next supervisory pass.
    pub async fn connect(&self) {
        if self.closed.get() || self.state.get() != LinkState::Disconnected {
            return;
        }
        self.set_state(LinkState::Connecting);

        for attempt in 0..self.options.retries {
            match self.connector.connect().await {
                Ok(mut transport) => {
                    let mut slot = self.transport.lock().await;
                    if self.closed.get() {
                        drop(slot);
                        transport.disconnect().await;
                        return;
                    }
                    *slot = Some(transport);
                    drop(slot);
                    self.connects.set(self.connects.get() + 1);
                    self.set_state(LinkState::Connected);
                    info!(
                        link = LINK,
                        endpoint = %self.connector.endpoint(),
                        attempt = attempt + 1,
                        "Field device connected"
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

    /// Read `count` holding registers from `address`.
    ///
    /// Returns `None` without touching the transport unless connected. A
    /// transport fault drops the handle and disconnects the link; any other
    /// fault leaves the connection as it is.
    pub async fn read_registers(&self, address: u16, count: u16) -> Option<RegisterFrame> {
        if self.state.get() != LinkState::Connected {
            return None;
        }

        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut()?;

        match transport.read_holding_registers(address, count).await {
            Ok(values) if values.len() == usize::from(count) => Some(RegisterFrame::new(values)),
            Ok(values) => {
                self.report(&FieldFault::Protocol(format!(
                    "expected {} registers, got {}",
                    count,
                    values.len()
                )));
                None
            }
            Err(fault @ FieldFault::Transport(_)) => {
                self.report(&fault);
                if self.state.get() == LinkState::Connected {
                    self.set_state(LinkState::Disconnected);
                }
                if let Some(mut transport) = guard.take() {
                    transport.disconnect().await;
                }
                None
            }
            Err(fault) => {
                self.report(&fault);
                None
            }
        }
    }

    /// Release the handle. Idempotent; the link never reconnects afterwards.
    pub async fn close(&self) {
        self.closed.set(true);

        let transport = self.transport.lock().await.take();
        if let Some(mut transport) = transport {
            transport.disconnect().await;
            info!(link = LINK, "Field link closed");
        }

        if self.state.get() != LinkState::Disconnected {
            self.set_state(LinkState::Disconnected);
        }
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state.replace(next);
        debug_assert!(
            prev.can_transition_to(next),
            "illegal field link transition {} -> {}",
            prev,
            next
        );
        debug!(link = LINK, from = %prev, to = %next, "Link state changed");
    }

    fn report(&self, fault: &FieldFault) {
        let key = fault.key();
        if self.throttle.borrow_mut().should_emit(key) {
            error!(link = LINK, key = %key, error = %fault, "Field link fault");
        } else {
            trace!(link = LINK, key = %key, error = %fault, "Field link fault (suppressed)");
        }
    }
}

/// Opens Modbus RTU or TCP connections.
#[derive(Debug, Clone)]
pub struct ModbusConnector {
    connection: ConnectionConfig,
    unit_id: u8,
    timeout: Duration,
}

impl ModbusConnector {
    /// Create a connector for one device.
    pub fn new(connection: ConnectionConfig, unit_id: u8, timeout: Duration) -> Self {
        Self {
            connection,
            unit_id,
            timeout,
        }
    }

    /// Create a connector from the bridge's modbus section.
    pub fn from_config(config: &ModbusConfig) -> Self {
        Self::new(config.connection.clone(), config.unit_id, config.timeout())
    }
}

impl FieldConnector for ModbusConnector {
    type Transport = ModbusTransport;

    async fn connect(&self) -> Result<ModbusTransport, FieldFault> {
        let slave = Slave(self.unit_id);

        let ctx = match &self.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| FieldFault::Connect(format!("Resolve '{}' failed: {}", host, e)))?
                    .next()
                    .ok_or_else(|| FieldFault::Connect(format!("No address for '{}'", host)))?;

                tokio::time::timeout(self.timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| FieldFault::Connect("Connection timeout".to_string()))?
                    .map_err(|e| FieldFault::Connect(e.to_string()))?
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits)
                    .timeout(self.timeout);

                let serial = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| FieldFault::Connect(format!("Serial open failed: {}", e)))?;

                rtu::attach_slave(serial, slave)
            }
        };

        Ok(ModbusTransport {
            ctx,
            timeout: self.timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{} unit {}", self.connection, self.unit_id)
    }
}

/// An open Modbus client context with a per-call time bound.
pub struct ModbusTransport {
    ctx: Context,
    timeout: Duration,
}

impl FieldTransport for ModbusTransport {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldFault> {
        let read = self.ctx.read_holding_registers(address, count);
        let response = tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| FieldFault::Timeout(self.timeout))?;

        match response {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(exception)) => Err(FieldFault::Exception(format!("{:?}", exception))),
            Err(tokio_modbus::Error::Transport(e)) => Err(FieldFault::Transport(e)),
            Err(e) => Err(FieldFault::Protocol(e.to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            debug!(link = LINK, error = %e, "Error while disconnecting field transport");
        }
    }
}
