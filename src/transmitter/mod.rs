// Licence: GNU GPLv3
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Serial transmission to an Enttec DMX USB Pro-compatible adapter.
//!
//! Drives the wire at a fixed 40 Hz refresh rate and runs a
//! reconnect state machine independent of the refresh loop: the loop
//! runs regardless of connection state, and disconnected ticks are
//! no-ops (spec §4.2).

use std::time::Duration;

use serialport::SerialPortType;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::universe::{Snapshot, UniverseState, DMX_CHANNELS};

const REFRESH_PERIOD: Duration = Duration::from_millis(25); // 40 Hz
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
const MAX_BACKOFF: Duration = Duration::from_millis(30_000);
const BAUD_RATE: u32 = 250_000;

const ENTTEC_VENDOR_ID: u16 = 0x0403;
const ENTTEC_PRODUCT_ID: u16 = 0x6001;
const FALLBACK_PATH_HINT: &str = "usbserial";

const COMMAND_START: u8 = 0x7E;
const MESSAGE_LABEL: u8 = 0x06;
const DATA_LSB: u8 = 0x01; // 513 (start code + 512 channels), little-endian
const DATA_MSB: u8 = 0x02;
const DMX_START_CODE: u8 = 0x00;
const COMMAND_END: u8 = 0xE7;

/// Encode one "Send DMX" frame per spec §4.2/§6. Always 518 bytes.
pub fn encode_frame(channels: &Snapshot) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + DMX_CHANNELS);
    frame.push(COMMAND_START);
    frame.push(MESSAGE_LABEL);
    frame.push(DATA_LSB);
    frame.push(DATA_MSB);
    frame.push(DMX_START_CODE);
    frame.extend_from_slice(channels);
    frame.push(COMMAND_END);
    frame
}

/// Transmitter connection state, published to subscribers on every
/// transition into or out of `Connected`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransmitterStatus {
    Idle,
    Scanning,
    Opening,
    Connected { port: String },
    Disconnected,
    Terminated,
}

impl TransmitterStatus {
    pub fn connected_port(&self) -> Option<&str> {
        match self {
            TransmitterStatus::Connected { port } => Some(port.as_str()),
            _ => None,
        }
    }
}

enum ControlMessage {
    Shutdown,
    Restart,
}

/// Handle used by the rest of the process to control the transmitter
/// and observe its status. The serial port itself is owned exclusively
/// by the background task spawned in `Transmitter::spawn`.
pub struct Transmitter {
    control: mpsc::Sender<ControlMessage>,
}

impl Transmitter {
    /// Spawn the transmitter task. `universe_rx` is the watch channel
    /// carrying the universe's effective state; `status_tx` publishes
    /// connection transitions.
    pub fn spawn(
        universe_rx: watch::Receiver<UniverseState>,
        status_tx: watch::Sender<TransmitterStatus>,
        forced_port: Option<String>,
    ) -> Transmitter {
        let (control_tx, control_rx) = mpsc::channel(8);
        tokio::spawn(run_transmitter(universe_rx, status_tx, control_rx, forced_port));
        Transmitter {
            control: control_tx,
        }
    }

    pub async fn shutdown(&self) {
        self.control.send(ControlMessage::Shutdown).await.ok();
    }

    pub async fn restart(&self) {
        self.control.send(ControlMessage::Restart).await.ok();
    }
}

/// Locate the Enttec adapter among the system's serial ports per the
/// discovery rule in spec §4.2: prefer vendor/product id match, fall
/// back to a path containing "usbserial", warn on multiple matches.
fn discover_port(forced: Option<&str>) -> Option<String> {
    if let Some(path) = forced {
        return Some(path.to_string());
    }

    let ports = serialport::available_ports().unwrap_or_default();

    let mut vid_pid_matches: Vec<String> = ports
        .iter()
        .filter_map(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => {
                if usb.vid == ENTTEC_VENDOR_ID && usb.pid == ENTTEC_PRODUCT_ID {
                    Some(p.port_name.clone())
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect();

    if !vid_pid_matches.is_empty() {
        if vid_pid_matches.len() > 1 {
            tracing::warn!(
                candidates = ?vid_pid_matches,
                "multiple Enttec-compatible ports found, picking the first"
            );
        }
        return Some(vid_pid_matches.remove(0));
    }

    ports
        .into_iter()
        .map(|p| p.port_name)
        .find(|name| name.contains(FALLBACK_PATH_HINT))
}

async fn open_port(path: &str) -> std::io::Result<tokio_serial::SerialStream> {
    tokio_serial::new(path, BAUD_RATE)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::Two)
        .parity(tokio_serial::Parity::None)
        .open_native_async()
}

/// The reconnect + refresh state machine. Runs for the lifetime of the
/// process (or until `shutdown()`).
async fn run_transmitter(
    mut universe_rx: watch::Receiver<UniverseState>,
    status_tx: watch::Sender<TransmitterStatus>,
    mut control_rx: mpsc::Receiver<ControlMessage>,
    forced_port: Option<String>,
) {
    let mut port: Option<tokio_serial::SerialStream> = None;
    let mut backoff = INITIAL_BACKOFF;
    let mut refresh = interval(REFRESH_PERIOD);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Set while waiting out a reconnect backoff; a control message
    // preempts it instead of the loop parking on a bare `sleep`, so
    // shutdown()/restart() are never deferred by a pending backoff
    // (spec §4.2/§5).
    let mut reconnect_deadline: Option<Instant> = None;

    set_status(&status_tx, TransmitterStatus::Scanning);

    loop {
        let reconnect_wait = async {
            match reconnect_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            control = control_rx.recv() => {
                match control {
                    Some(ControlMessage::Shutdown) | None => {
                        set_status(&status_tx, TransmitterStatus::Terminated);
                        return;
                    }
                    Some(ControlMessage::Restart) => {
                        port = None;
                        backoff = INITIAL_BACKOFF;
                        reconnect_deadline = None;
                        set_status(&status_tx, TransmitterStatus::Scanning);
                    }
                }
            }

            _ = reconnect_wait, if reconnect_deadline.is_some() => {
                reconnect_deadline = None;
                set_status(&status_tx, TransmitterStatus::Scanning);
            }

            _ = refresh.tick() => {
                if reconnect_deadline.is_some() {
                    // still backing off, no-op until the deadline fires
                } else if port.is_none() {
                    match discover_port(forced_port.as_deref()) {
                        Some(path) => {
                            set_status(&status_tx, TransmitterStatus::Opening);
                            match open_port(&path).await {
                                Ok(opened) => {
                                    port = Some(opened);
                                    backoff = INITIAL_BACKOFF;
                                    set_status(&status_tx, TransmitterStatus::Connected { port: path });
                                }
                                Err(error) => {
                                    tracing::warn!(%error, port = %path, "failed to open serial port");
                                    schedule_reconnect(&status_tx, &mut backoff, &mut reconnect_deadline);
                                }
                            }
                        }
                        None => {
                            tracing::warn!("no DMX adapter found during scan");
                            schedule_reconnect(&status_tx, &mut backoff, &mut reconnect_deadline);
                        }
                    }
                } else if let Some(ref mut stream) = port {
                    let channels = universe_rx.borrow_and_update().effective;
                    let frame = encode_frame(&channels);
                    if let Err(error) = stream.write_all(&frame).await {
                        tracing::warn!(%error, "serial write failed, connection remains open until closed");
                    }
                }
            }
        }
    }
}

fn schedule_reconnect(
    status_tx: &watch::Sender<TransmitterStatus>,
    backoff: &mut Duration,
    reconnect_deadline: &mut Option<Instant>,
) {
    set_status(status_tx, TransmitterStatus::Disconnected);
    *reconnect_deadline = Some(Instant::now() + *backoff);
    *backoff = std::cmp::min(*backoff * 2, MAX_BACKOFF);
}

fn set_status(status_tx: &watch::Sender<TransmitterStatus>, status: TransmitterStatus) {
    status_tx.send_replace(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_518_bytes_with_correct_header_and_trailer() {
        let mut channels = [0u8; DMX_CHANNELS];
        channels[0] = 0xAA;
        channels[511] = 0x55;
        let frame = encode_frame(&channels);

        assert_eq!(frame.len(), 518);
        assert_eq!(&frame[0..5], &[0x7E, 0x06, 0x01, 0x02, 0x00]);
        assert_eq!(frame[517], 0xE7);
        assert_eq!(&frame[5..517], &channels[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_is_not_deferred() {
        let (_universe_tx, universe_rx) =
            watch::channel(UniverseState { raw: [0; DMX_CHANNELS], effective: [0; DMX_CHANNELS] });
        let (status_tx, status_rx) = watch::channel(TransmitterStatus::Idle);
        let (control_tx, control_rx) = mpsc::channel(8);

        tokio::spawn(run_transmitter(
            universe_rx,
            status_tx,
            control_rx,
            Some("/nonexistent/dmx-port".to_string()),
        ));

        // One tick opens the bogus port, fails, and enters backoff.
        tokio::time::advance(REFRESH_PERIOD).await;
        tokio::task::yield_now().await;
        assert_eq!(*status_rx.borrow(), TransmitterStatus::Disconnected);

        // Shutdown must be observed without waiting out the backoff
        // (1000ms, not advanced here) — the old blocking `sleep` would
        // leave this stuck on `Disconnected` forever.
        control_tx.send(ControlMessage::Shutdown).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(*status_rx.borrow(), TransmitterStatus::Terminated);
    }

    #[test]
    fn backoff_doubles_and_caps_at_30s() {
        let mut backoff = INITIAL_BACKOFF;
        let mut sequence = vec![backoff];
        for _ in 0..6 {
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            sequence.push(backoff);
        }
        assert_eq!(
            sequence,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(16000),
                Duration::from_millis(30000),
                Duration::from_millis(30000),
            ]
        );
    }
}
