//! The async side of the serial port connection.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch::Receiver;

use super::{Data, DeviceState};

/// A handle to the serial I/O [`Server`][super::Server] for sending bytes to be written and
/// receiving bytes that were read.
///
/// Exactly one client exists per server. The gateway splits it between the transport, which
/// writes, and the receive task, which reads.
pub struct Client {
    /// A sender for data to be written to the serial port.
    pub tx: UnboundedSender<Data>,
    /// A receiver for data read from the serial port.
    pub rx: UnboundedReceiver<Data>,
    /// A receiver for the device state signal.
    pub device_state: Receiver<DeviceState>,
}

impl Client {
    pub fn new(
        tx: UnboundedSender<Data>,
        rx: UnboundedReceiver<Data>,
        device_state: Receiver<DeviceState>,
    ) -> Self {
        Client {
            tx,
            rx,
            device_state,
        }
    }
}
