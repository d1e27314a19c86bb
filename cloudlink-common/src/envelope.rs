//! Wire messages exchanged with the cloud channel.
//!
//! Outbound telemetry is a JSON text frame:
//!
//! ```text
//! {"action":"update","data":[v0,v1,...]}
//! ```
//!
//! Inbound commands are arbitrary JSON objects.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Register values read in one poll, in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterFrame(Vec<u16>);

impl RegisterFrame {
    /// Wrap register values.
    pub fn new(values: Vec<u16>) -> Self {
        Self(values)
    }

    /// Number of registers in the frame.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame holds no registers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the register values.
    pub fn values(&self) -> &[u16] {
        &self.0
    }

    /// Take the register values.
    pub fn into_values(self) -> Vec<u16> {
        self.0
    }
}

impl From<Vec<u16>> for RegisterFrame {
    fn from(values: Vec<u16>) -> Self {
        Self(values)
    }
}

/// Action tag of an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Fresh register values.
    #[default]
    Update,
}

/// Message pushed upstream for every successful poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub action: Action,
    pub data: RegisterFrame,
}

impl OutboundEnvelope {
    /// Build an `update` message around a register frame.
    pub fn update(data: RegisterFrame) -> Self {
        Self {
            action: Action::Update,
            data,
        }
    }

    /// Encode as the channel's JSON text representation.
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }
}

/// Decoded command received from the channel. No schema is enforced.
pub type InboundCommand = serde_json::Map<String, serde_json::Value>;

/// Decode a text payload into a command.
///
/// Fails unless the payload is a JSON object.
pub fn decode_command(text: &str) -> Result<InboundCommand> {
    serde_json::from_str(text).map_err(Error::from)
}
