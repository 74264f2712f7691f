//! Ownership of the serial link to the controller.

mod client;
mod port;
mod server;

pub use client::Client;
pub use port::{open_serial_port, OpenPort, Port, BAUD_RATE};
pub use server::Server;

/// The message type used in channels related to the serial port.
pub type Data = Vec<u8>;

/// The state of the serial device connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// The port is open and the controller is reachable through it.
    Connected,
    /// The port is closed or unusable.
    NotConnected,
}
