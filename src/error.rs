//! Error types for the gateway.

use relay_protocol::ChannelId;
use thiserror::Error;

use std::io;
use std::net::SocketAddr;

/// A command could not be delivered to the controller.
///
/// The affected channel's recorded state is left unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("controller did not acknowledge after {attempts} attempts")]
    Unreachable { attempts: u32 },

    #[error("serial device is not connected")]
    Disconnected,
}

/// The terminal failure of a submitted command.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(
        "channel {channel} last measured {current_ma} mA, above its {threshold_ma} mA threshold"
    )]
    OverCurrentInterlock {
        channel: ChannelId,
        current_ma: u32,
        threshold_ma: u32,
    },

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// A request parameter was missing or out of range. Never reaches the command queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing `{0}` parameter")]
    Missing(&'static str),

    #[error("`{name}` must be a positive integer, got {value:?}")]
    NotPositive { name: &'static str, value: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// The gateway could not be started.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}
