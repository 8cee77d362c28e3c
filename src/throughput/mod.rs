//! Traffic generation: iperf command strings, phase descriptors, and the
//! local/remote process pair that runs one phase.

pub mod iperf;
pub mod local;
pub mod pair;
pub mod phase;

use std::fmt;

use serde::Serialize;

pub use local::{LocalProcess, ProcessLauncher, SpawnError, TokioLauncher};
pub use pair::{DirectionSinks, PairController, PairError, PairOutcome, PhaseSinks};
pub use phase::{compile, compile_device, DirectionCommands, PhaseDescriptor, PhaseLogs};

/// Direction of data flow relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote host sends, device receives.
    Downlink,
    /// Device sends, remote host receives.
    Uplink,
}

impl Direction {
    /// Short tag used in log file names.
    pub fn tag(self) -> &'static str {
        match self {
            Direction::Downlink => "dl",
            Direction::Uplink => "ul",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downlink => write!(f, "downlink"),
            Direction::Uplink => write!(f, "uplink"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn tag(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}
