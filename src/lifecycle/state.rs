//! Boot and server state machines.
//!
//! Transitions are pure: `transition` maps a state and an event to the next
//! state, or `None` when the event is not legal in that state. The session
//! performs the I/O around them.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "cause", rename_all = "lowercase")]
pub enum BootState {
    #[default]
    Idle,
    Booting,
    Mounting,
    Installing,
    Ready,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootEvent {
    Start,
    Connected,
    /// Files are mounted; `install` tells whether dependencies must be
    /// installed before the sandbox is ready.
    Mounted { install: bool },
    Installed,
    Failed(String),
    Reset,
}

impl BootState {
    pub fn transition(&self, event: BootEvent) -> Option<BootState> {
        use BootState::*;

        match (self, event) {
            (_, BootEvent::Reset) => Some(Idle),
            (Idle | Error(_), BootEvent::Start) => Some(Booting),
            (Booting, BootEvent::Connected) => Some(Mounting),
            (Mounting, BootEvent::Mounted { install: true }) => Some(Installing),
            (Mounting, BootEvent::Mounted { install: false }) => Some(Ready),
            (Installing, BootEvent::Installed) => Some(Ready),
            (Error(_), BootEvent::Failed(_)) => None,
            (_, BootEvent::Failed(cause)) => Some(Error(cause)),
            (
                Idle | Booting | Mounting | Installing | Ready | Error(_),
                BootEvent::Start
                | BootEvent::Connected
                | BootEvent::Mounted { .. }
                | BootEvent::Installed,
            ) => None,
        }
    }

    /// `start()` may run from here.
    pub fn can_start(&self) -> bool {
        matches!(self, BootState::Idle | BootState::Error(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, BootState::Ready)
    }

    /// A boot is in progress.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            BootState::Booting | BootState::Mounting | BootState::Installing
        )
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootState::Idle => f.write_str("idle"),
            BootState::Booting => f.write_str("booting"),
            BootState::Mounting => f.write_str("mounting"),
            BootState::Installing => f.write_str("installing"),
            BootState::Ready => f.write_str("ready"),
            BootState::Error(cause) => write!(f, "error: {cause}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Idle,
    Starting,
    Ready {
        url: String,
        port: u16,
    },
    Error {
        cause: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Start,
    Ready { url: String, port: u16 },
    Failed(String),
    Stop,
    Reset,
}

impl ServerState {
    /// `boot` is consulted for `Start`, which needs a ready sandbox.
    pub fn transition(&self, boot: &BootState, event: ServerEvent) -> Option<ServerState> {
        use ServerState::*;

        match (self, event) {
            (_, ServerEvent::Reset) => Some(Idle),
            (Idle | Error { .. }, ServerEvent::Start) if boot.is_ready() => Some(Starting),
            (_, ServerEvent::Start) => None,
            (Starting, ServerEvent::Ready { url, port }) => Some(Ready { url, port }),
            (Idle | Ready { .. } | Error { .. }, ServerEvent::Ready { .. }) => None,
            (Starting | Ready { .. }, ServerEvent::Failed(cause)) => Some(Error { cause }),
            (Idle | Error { .. }, ServerEvent::Failed(_)) => None,
            (Starting | Ready { .. }, ServerEvent::Stop) => Some(Idle),
            (Idle | Error { .. }, ServerEvent::Stop) => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ServerState::Ready { url, .. } => Some(url),
            ServerState::Idle | ServerState::Starting | ServerState::Error { .. } => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Ready { .. })
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Idle => f.write_str("idle"),
            ServerState::Starting => f.write_str("starting"),
            ServerState::Ready { url, .. } => write!(f, "ready at {url}"),
            ServerState::Error { cause } => write!(f, "error: {cause}"),
        }
    }
}
