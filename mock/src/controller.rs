//! A simulated two-channel relay controller behind a serial port.

use relay_protocol::{
    Body, ChannelId, ChannelReport, Command, Frame, Measurement, RelayState, Sequence, Switch,
    START_BYTE,
};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// The threshold the controller starts with on both channels.
pub const INITIAL_THRESHOLD_MA: u32 = 2500;

struct Shared {
    channels: [ChannelReport; 2],
    /// Commands for an unresponsive channel are recorded but never acknowledged.
    responsive: [bool; 2],
    /// How many of the next acknowledgements go out with a broken checksum.
    corrupt_acks: u32,
    /// How many of the next acknowledgements are preceded by a damaged telemetry frame.
    noisy_acks: u32,
    /// Simulates a physical disconnect if `true`.
    has_error: bool,
    /// Bytes written by the gateway that do not form a complete frame yet.
    incoming: Vec<u8>,
    /// Bytes waiting to be read by the gateway.
    outgoing: VecDeque<u8>,
    commands: Vec<(Sequence, Command)>,
    command_frames: Vec<Vec<u8>>,
    telemetry_sequence: Sequence,
}

/// A serial port that behaves like the relay controller: it acknowledges every command frame
/// written to it and emits telemetry on demand.
///
/// This type is a handle that can be cloned to control the controller from multiple locations.
#[derive(Clone)]
pub struct SimulatedController {
    shared: Arc<Mutex<Shared>>,
}

impl Default for SimulatedController {
    fn default() -> Self {
        SimulatedController::new()
    }
}

impl SimulatedController {
    /// Returns a controller with both relays off and responsive.
    pub fn new() -> Self {
        let channel = |channel| ChannelReport {
            channel,
            state: RelayState::Off,
            threshold_ma: INITIAL_THRESHOLD_MA,
        };

        SimulatedController {
            shared: Arc::new(Mutex::new(Shared {
                channels: [channel(ChannelId::One), channel(ChannelId::Two)],
                responsive: [true; 2],
                corrupt_acks: 0,
                noisy_acks: 0,
                has_error: false,
                incoming: Vec::new(),
                outgoing: VecDeque::new(),
                commands: Vec::new(),
                command_frames: Vec::new(),
                telemetry_sequence: 0,
            })),
        }
    }

    /// Returns a function that opens this controller, for use as the gateway's port opener.
    pub fn open_fn(&self) -> impl Fn(&Path) -> serialport::Result<Box<dyn SerialPort>> + Send {
        let controller = self.clone();

        move |_: &Path| {
            controller.try_access()?;
            Ok(Box::new(controller.clone()) as _)
        }
    }

    fn shared(&self) -> MutexGuard<Shared> {
        self.shared.lock().unwrap()
    }

    pub fn has_error(&self) -> bool {
        self.shared().has_error
    }

    pub fn set_has_error(&self, has_error: bool) {
        self.shared().has_error = has_error;
    }

    pub fn set_responsive(&self, channel: ChannelId, responsive: bool) {
        self.shared().responsive[channel.index()] = responsive;
    }

    /// Sends the next `count` acknowledgements with a corrupted checksum.
    pub fn corrupt_next_acks(&self, count: u32) {
        self.shared().corrupt_acks = count;
    }

    /// Sends a damaged telemetry frame right before each of the next `count` acknowledgements.
    pub fn noise_before_next_acks(&self, count: u32) {
        self.shared().noisy_acks = count;
    }

    /// Simulates a power cycle: both relays open, thresholds and telemetry numbering start over,
    /// and anything in flight is lost.
    pub fn restart(&self) {
        let mut shared = self.shared();
        for report in &mut shared.channels {
            report.state = RelayState::Off;
            report.threshold_ma = INITIAL_THRESHOLD_MA;
        }
        shared.telemetry_sequence = 0;
        shared.incoming.clear();
        shared.outgoing.clear();
    }

    pub fn channel(&self, channel: ChannelId) -> ChannelReport {
        self.shared().channels[channel.index()]
    }

    pub fn set_channel_state(&self, channel: ChannelId, state: RelayState) {
        self.shared().channels[channel.index()].state = state;
    }

    /// Emits a telemetry frame and returns its sequence number.
    pub fn push_telemetry(&self, channel: ChannelId, current_ma: u32, power_mw: u32) -> Sequence {
        let mut shared = self.shared();
        let sequence = shared.telemetry_sequence;
        shared.telemetry_sequence = sequence.wrapping_add(1);

        let frame = Frame {
            sequence,
            body: Body::Telemetry(Measurement {
                channel,
                current_ma,
                power_mw,
            }),
        };
        shared.outgoing.extend(frame.encode());

        sequence
    }

    /// Emits arbitrary bytes.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.shared().outgoing.extend(bytes);
    }

    /// Every command received so far, with its sequence number.
    pub fn commands(&self) -> Vec<(Sequence, Command)> {
        self.shared().commands.clone()
    }

    /// The raw bytes of every command frame received so far.
    pub fn command_frames(&self) -> Vec<Vec<u8>> {
        self.shared().command_frames.clone()
    }

    pub fn clear_commands(&self) {
        let mut shared = self.shared();
        shared.commands.clear();
        shared.command_frames.clear();
    }

    fn try_access(&self) -> io::Result<()> {
        if self.has_error() {
            Err(io::ErrorKind::BrokenPipe.into())
        } else {
            Ok(())
        }
    }
}

impl Shared {
    /// Decodes every complete frame in `incoming` and answers the commands among them.
    fn process_incoming(&mut self) {
        loop {
            let Some(start) = self.incoming.iter().position(|&b| b == START_BYTE) else {
                self.incoming.clear();
                return;
            };
            self.incoming.drain(..start);

            let total = match Frame::peek_len(&self.incoming) {
                Ok(Some(total)) if total <= self.incoming.len() => total,
                Ok(_) => return,
                Err(_) => {
                    self.incoming.remove(0);
                    continue;
                }
            };

            let bytes: Vec<u8> = self.incoming.drain(..total).collect();
            if let Ok(Frame { sequence, body: Body::Command(command) }) = Frame::decode(&bytes) {
                self.commands.push((sequence, command));
                self.command_frames.push(bytes);
                self.answer(sequence, command);
            }
        }
    }

    fn answer(&mut self, sequence: Sequence, command: Command) {
        let index = command.channel().index();
        if !self.responsive[index] {
            return;
        }

        let report = &mut self.channels[index];
        match command {
            Command::SetRelay { desired: Switch::On, .. } => report.state = RelayState::On,
            Command::SetRelay { desired: Switch::Off, .. } => report.state = RelayState::Off,
            Command::SetThreshold { threshold_ma, .. } => report.threshold_ma = threshold_ma,
            Command::QueryState { .. } => {}
        }

        let mut ack = Frame {
            sequence,
            body: Body::Ack(*report),
        }
        .encode();

        if self.corrupt_acks > 0 {
            self.corrupt_acks -= 1;
            break_checksum(&mut ack);
        }

        if self.noisy_acks > 0 {
            self.noisy_acks -= 1;
            // Every byte of the measurement is a start byte
            let mut noise = Frame {
                sequence: 0xA5A5,
                body: Body::Telemetry(Measurement {
                    channel: ChannelId::One,
                    current_ma: 0xA5A5_A5A5,
                    power_mw: 0xA5A5_A5A5,
                }),
            }
            .encode();
            break_checksum(&mut noise);
            self.outgoing.extend(noise);
        }

        self.outgoing.extend(ack);
    }
}

fn break_checksum(frame: &mut [u8]) {
    if let Some(checksum) = frame.last_mut() {
        *checksum ^= 0xFF;
    }
}

impl Write for SimulatedController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_access()?;

        let mut shared = self.shared();
        shared.incoming.extend_from_slice(buf);
        shared.process_incoming();

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.try_access()
    }
}

impl Read for SimulatedController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_access()?;

        let mut shared = self.shared();
        if shared.outgoing.is_empty() {
            // A real port reports its read timeout the same way
            return Err(io::ErrorKind::TimedOut.into());
        }

        let bytes = buf.len().min(shared.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(shared.outgoing.drain(..bytes)) {
            *slot = byte;
        }

        Ok(bytes)
    }
}

impl SerialPort for SimulatedController {
    fn name(&self) -> Option<String> {
        Some("simulated-controller".into())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        self.try_access().map(|_| 115_200).map_err(Into::into)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        self.try_access().map(|_| DataBits::Eight).map_err(Into::into)
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        self.try_access().map(|_| FlowControl::None).map_err(Into::into)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        self.try_access().map(|_| Parity::None).map_err(Into::into)
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        self.try_access().map(|_| StopBits::One).map_err(Into::into)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_flow_control(&mut self, _flow_control: FlowControl) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_timeout(&mut self, _timeout: Duration) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| true).map_err(Into::into)
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| true).map_err(Into::into)
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| false).map_err(Into::into)
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| true).map_err(Into::into)
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        self.try_access()?;
        Ok(self.shared().outgoing.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        self.try_access().map(|_| 0).map_err(Into::into)
    }

    fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        self.try_access()?;

        let mut shared = self.shared();
        match buffer_to_clear {
            ClearBuffer::Input => shared.outgoing.clear(),
            ClearBuffer::Output => shared.incoming.clear(),
            ClearBuffer::All => {
                shared.outgoing.clear();
                shared.incoming.clear();
            }
        }

        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        Ok(Box::new(self.clone()))
    }

    fn set_break(&self) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn clear_break(&self) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_frame(controller: &mut SimulatedController) -> Frame {
        let mut buf = [0; 64];
        let n = controller.read(&mut buf).unwrap();
        Frame::decode(&buf[..n]).unwrap()
    }

    #[test]
    fn test_acknowledges_commands() {
        let mut controller = SimulatedController::new();
        let command = Command::SetThreshold {
            channel: ChannelId::Two,
            threshold_ma: 1200,
        };

        // Written in two pieces
        let bytes = relay_protocol::encode(command, 41);
        controller.write_all(&bytes[..3]).unwrap();
        controller.write_all(&bytes[3..]).unwrap();

        let ack = read_frame(&mut controller);
        assert_eq!(41, ack.sequence);
        assert_eq!(
            Body::Ack(ChannelReport {
                channel: ChannelId::Two,
                state: RelayState::Off,
                threshold_ma: 1200,
            }),
            ack.body,
        );
        assert_eq!(vec![(41, command)], controller.commands());
        assert_eq!(vec![bytes], controller.command_frames());
    }

    #[test]
    fn test_unresponsive_channel() {
        let mut controller = SimulatedController::new();
        controller.set_responsive(ChannelId::One, false);

        let command = Command::SetRelay {
            channel: ChannelId::One,
            desired: Switch::On,
        };
        controller.write_all(&relay_protocol::encode(command, 0)).unwrap();

        assert!(controller.read(&mut [0; 64]).is_err());
        assert_eq!(RelayState::Off, controller.channel(ChannelId::One).state);
        assert_eq!(1, controller.commands().len());
    }

    #[test]
    fn test_corrupt_acks() {
        let mut controller = SimulatedController::new();
        controller.corrupt_next_acks(1);

        let command = Command::QueryState {
            channel: ChannelId::One,
        };
        let mut buf = [0; 64];

        controller.write_all(&relay_protocol::encode(command, 0)).unwrap();
        let n = controller.read(&mut buf).unwrap();
        assert!(Frame::decode(&buf[..n]).is_err());

        controller.write_all(&relay_protocol::encode(command, 0)).unwrap();
        assert_eq!(0, read_frame(&mut controller).sequence);
    }

    #[test]
    fn test_noise_before_acks() {
        let mut controller = SimulatedController::new();
        controller.noise_before_next_acks(1);

        let command = Command::QueryState {
            channel: ChannelId::Two,
        };
        controller.write_all(&relay_protocol::encode(command, 3)).unwrap();

        let mut buf = [0; 64];
        let n = controller.read(&mut buf).unwrap();
        let ack = Frame {
            sequence: 3,
            body: Body::Ack(controller.channel(ChannelId::Two)),
        }
        .encode();
        let (noise, tail) = buf[..n].split_at(n - ack.len());
        assert!(Frame::decode(noise).is_err());
        assert_eq!(&ack[..], tail);
    }

    #[test]
    fn test_restart() {
        let mut controller = SimulatedController::new();
        controller.set_channel_state(ChannelId::One, RelayState::On);
        controller.push_telemetry(ChannelId::One, 10, 50);
        controller.push_telemetry(ChannelId::One, 10, 50);

        controller.restart();

        assert_eq!(RelayState::Off, controller.channel(ChannelId::One).state);
        assert!(controller.read(&mut [0; 64]).is_err());
        assert_eq!(0, controller.push_telemetry(ChannelId::One, 10, 50));
    }

    #[test]
    fn test_telemetry_sequence() {
        let mut controller = SimulatedController::new();

        assert_eq!(0, controller.push_telemetry(ChannelId::One, 10, 50));
        assert_eq!(1, controller.push_telemetry(ChannelId::Two, 20, 100));

        let first = read_frame_exact(&mut controller);
        assert_eq!(
            Body::Telemetry(Measurement {
                channel: ChannelId::One,
                current_ma: 10,
                power_mw: 50,
            }),
            first.body,
        );
        assert_eq!(1, read_frame_exact(&mut controller).sequence);
    }

    #[test]
    fn test_error() {
        let mut controller = SimulatedController::new();
        controller.set_has_error(true);

        assert!(controller.write(&[START_BYTE]).is_err());
        assert!(controller.read(&mut [0; 8]).is_err());
        assert!(controller.bytes_to_read().is_err());
        assert!((controller.open_fn())(Path::new("x")).is_err());

        controller.set_has_error(false);
        assert!((controller.open_fn())(Path::new("x")).is_ok());
    }

    // Reads exactly one telemetry frame.
    fn read_frame_exact(controller: &mut SimulatedController) -> Frame {
        let mut buf = [0; relay_protocol::FRAME_OVERHEAD + 9];
        controller.read_exact(&mut buf).unwrap();
        Frame::decode(&buf).unwrap()
    }
}
