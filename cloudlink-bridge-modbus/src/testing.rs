//! Scripted in-memory connectors for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::channel::{
    ChannelConnector, ChannelFault, ChannelLink, ChannelLinkOptions, FrameSink, FrameSource,
};
use crate::field::{FieldConnector, FieldFault, FieldLink, FieldLinkOptions, FieldTransport};

/// Observable behaviour of a mock field device.
#[derive(Default)]
pub struct FieldScript {
    pub connect_failures: Cell<usize>,
    pub reads: RefCell<VecDeque<Result<Vec<u16>, FieldFault>>>,
    pub connect_calls: Cell<usize>,
    pub read_calls: Cell<usize>,
    pub last_read: Cell<Option<(u16, u16)>>,
    pub disconnects: Cell<usize>,
}

#[derive(Clone, Default)]
pub struct MockFieldConnector {
    pub script: Rc<FieldScript>,
}

impl MockFieldConnector {
    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: usize) {
        self.script.connect_failures.set(n);
    }

    /// Queue the outcome of a future read. Unscripted reads return
    /// `address..address + count`.
    pub fn push_read(&self, outcome: Result<Vec<u16>, FieldFault>) {
        self.script.reads.borrow_mut().push_back(outcome);
    }
}

pub struct MockFieldTransport {
    script: Rc<FieldScript>,
}

impl FieldTransport for MockFieldTransport {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldFault> {
        let script = &self.script;
        script.read_calls.set(script.read_calls.get() + 1);
        script.last_read.set(Some((address, count)));
        let scripted = script.reads.borrow_mut().pop_front();
        scripted.unwrap_or_else(|| Ok((address..address + count).collect()))
    }

    async fn disconnect(&mut self) {
        self.script.disconnects.set(self.script.disconnects.get() + 1);
    }
}

impl FieldConnector for MockFieldConnector {
    type Transport = MockFieldTransport;

    async fn connect(&self) -> Result<MockFieldTransport, FieldFault> {
        let script = &self.script;
        script.connect_calls.set(script.connect_calls.get() + 1);

        let failures = script.connect_failures.get();
        if failures > 0 {
            script.connect_failures.set(failures - 1);
            return Err(FieldFault::Connect("port busy".to_string()));
        }

        Ok(MockFieldTransport {
            script: script.clone(),
        })
    }

    fn endpoint(&self) -> String {
        "mock-field".to_string()
    }
}

pub fn field_link(connector: MockFieldConnector, retries: u32) -> FieldLink<MockFieldConnector> {
    FieldLink::new(
        connector,
        FieldLinkOptions {
            retries,
            ..Default::default()
        },
    )
}

type Inbound = Result<String, ChannelFault>;

/// Observable behaviour of a mock cloud endpoint.
#[derive(Default)]
pub struct ChannelScript {
    pub connect_failures: Cell<usize>,
    pub hang_connects: Cell<bool>,
    pub send_failures: Cell<usize>,
    pub hang_sends: Cell<bool>,
    pub connect_calls: Cell<usize>,
    pub sent: RefCell<Vec<String>>,
    pub sink_closes: Cell<usize>,
    peer: RefCell<Option<mpsc::UnboundedSender<Inbound>>>,
}

#[derive(Clone, Default)]
pub struct MockChannelConnector {
    pub script: Rc<ChannelScript>,
}

impl MockChannelConnector {
    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: usize) {
        self.script.connect_failures.set(n);
    }

    /// Fail the next `n` frame writes with a transport fault.
    pub fn fail_sends(&self, n: usize) {
        self.script.send_failures.set(n);
    }

    /// Deliver a frame (or a fault) to the current connection.
    pub fn push_inbound(&self, frame: Inbound) {
        if let Some(peer) = self.script.peer.borrow().as_ref() {
            let _ = peer.send(frame);
        }
    }

    /// Text frames written so far, across connections.
    pub fn sent(&self) -> Vec<String> {
        self.script.sent.borrow().clone()
    }
}

pub struct MockSink {
    script: Rc<ChannelScript>,
}

impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelFault> {
        if self.script.hang_sends.get() {
            std::future::pending::<()>().await;
        }

        let failures = self.script.send_failures.get();
        if failures > 0 {
            self.script.send_failures.set(failures - 1);
            return Err(ChannelFault::Transport("broken pipe".to_string()));
        }
        self.script.sent.borrow_mut().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.script.sink_closes.set(self.script.sink_closes.get() + 1);
    }
}

pub struct MockSource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl FrameSource for MockSource {
    async fn next_text(&mut self) -> Result<String, ChannelFault> {
        match self.inbound.recv().await {
            Some(frame) => frame,
            None => Err(ChannelFault::Closed("peer went away".to_string())),
        }
    }
}

impl ChannelConnector for MockChannelConnector {
    type Sink = MockSink;
    type Source = MockSource;

    async fn connect(&self) -> Result<(MockSink, MockSource), ChannelFault> {
        let script = &self.script;
        script.connect_calls.set(script.connect_calls.get() + 1);

        if script.hang_connects.get() {
            std::future::pending::<()>().await;
        }

        let failures = script.connect_failures.get();
        if failures > 0 {
            script.connect_failures.set(failures - 1);
            return Err(ChannelFault::Connect("connection refused".to_string()));
        }

        let (peer, inbound) = mpsc::unbounded_channel();
        *script.peer.borrow_mut() = Some(peer);

        Ok((
            MockSink {
                script: script.clone(),
            },
            MockSource { inbound },
        ))
    }

    fn endpoint(&self) -> String {
        "ws://mock-cloud".to_string()
    }
}

pub fn channel_link(
    connector: MockChannelConnector,
    retries: u32,
) -> ChannelLink<MockChannelConnector> {
    ChannelLink::new(
        connector,
        ChannelLinkOptions {
            retries,
            send_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    )
}
