//! Connection state shared by every resilient link.

use serde::{Deserialize, Serialize};

/// Connection state of a link.
///
/// A link only moves along `Disconnected -> Connecting -> Connected ->
/// Disconnected`. `Connecting -> Disconnected` is taken when the retry budget
/// runs out or the link is closed while connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No transport handle is held.
    #[default]
    Disconnected,
    /// A bounded connect loop is in progress.
    Connecting,
    /// The transport handle is usable.
    Connected,
}

impl LinkState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Disconnected, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connected)
                | (LinkState::Connecting, LinkState::Disconnected)
                | (LinkState::Connected, LinkState::Disconnected)
        )
    }

    /// Return the string name for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
