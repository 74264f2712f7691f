//! Wire protocol spoken between the relay gateway and the channel controller over the serial
//! link. Shared by the gateway and the simulated controller used in tests.
//!
//! Everything here is pure: no I/O, no clocks, no shared state.

mod error;
mod frame;

pub use error::FrameError;
pub use frame::{encode, Body, Frame, FRAME_OVERHEAD, MAX_PAYLOAD_LEN, START_BYTE};

use serde::{Deserialize, Serialize};

use std::fmt;

/// Sequence number carried in every frame header.
pub type Sequence = u16;

/// One of the two fixed relay channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    One,
    Two,
}

impl ChannelId {
    /// Every channel, in wire order.
    pub const ALL: [ChannelId; 2] = [ChannelId::One, ChannelId::Two];

    /// Returns the zero-based table index of this channel.
    pub fn index(self) -> usize {
        match self {
            ChannelId::One => 0,
            ChannelId::Two => 1,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ChannelId::One => 1,
            ChannelId::Two => 2,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ChannelId::One),
            2 => Some(ChannelId::Two),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::One => f.write_str("one"),
            ChannelId::Two => f.write_str("two"),
        }
    }
}

/// The position a relay is commanded to take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

/// The state of a relay channel as tracked by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Off,
    On,
    /// Opened autonomously because of a fault. The physical relay is open.
    Tripped,
}

impl RelayState {
    /// Returns whether the physical relay is closed (conducting) in this state.
    pub fn relay_closed(self) -> bool {
        self == RelayState::On
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            RelayState::Off => 0,
            RelayState::On => 1,
            RelayState::Tripped => 2,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RelayState::Off),
            1 => Some(RelayState::On),
            2 => Some(RelayState::Tripped),
            _ => None,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Off => f.write_str("off"),
            RelayState::On => f.write_str("on"),
            RelayState::Tripped => f.write_str("tripped"),
        }
    }
}

/// A request sent from the gateway to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SetRelay { channel: ChannelId, desired: Switch },
    SetThreshold { channel: ChannelId, threshold_ma: u32 },
    QueryState { channel: ChannelId },
}

impl Command {
    /// Returns the channel this command targets.
    pub fn channel(&self) -> ChannelId {
        match *self {
            Command::SetRelay { channel, .. }
            | Command::SetThreshold { channel, .. }
            | Command::QueryState { channel } => channel,
        }
    }
}

/// A channel's state as reported by the controller in an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: ChannelId,
    pub state: RelayState,
    pub threshold_ma: u32,
}

/// A single measurement pushed by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub channel: ChannelId,
    pub current_ma: u32,
    pub power_mw: u32,
}

/// A measurement together with the sequence number of the frame that carried it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TelemetrySample {
    pub channel: ChannelId,
    pub current_ma: u32,
    pub power_mw: u32,
    pub sequence: Sequence,
}

impl TelemetrySample {
    /// Builds a sample from a telemetry frame's body and sequence number.
    pub fn new(measurement: Measurement, sequence: Sequence) -> Self {
        TelemetrySample {
            channel: measurement.channel,
            current_ma: measurement.current_ma,
            power_mw: measurement.power_mw,
            sequence,
        }
    }
}
