use super::protocol::{Report, REPORT_ID, REPORT_SIZE};
use crate::config::schema::DeviceIdentification;
use crate::error::{PadError, Result};
use hidapi::{HidApi, HidDevice};
use std::thread;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

/// Read poll granularity of the I/O thread; also bounds write latency.
const READ_POLL_MS: i32 = 20;

const LINK_BUFFER: usize = 32;

/// An open byte pipe to one keypad.
///
/// Dropping `outbound` stops the I/O thread; the thread closing `inbound`
/// means the device is gone.
pub struct HidLink {
    pub outbound: mpsc::Sender<Report>,
    pub inbound: mpsc::Receiver<Report>,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

/// Finds and opens a keypad. Called again for every reconnect attempt.
pub trait DeviceConnector: Send + Sync {
    /// # Errors
    /// `PadError::DeviceNotFound` when no enumerated device matches.
    fn connect(&self, identifications: &[DeviceIdentification]) -> Result<HidLink>;
}

/// Connector backed by the system HID stack.
#[derive(Debug, Default)]
pub struct HidApiConnector;

impl DeviceConnector for HidApiConnector {
    fn connect(&self, identifications: &[DeviceIdentification]) -> Result<HidLink> {
        // A fresh context re-enumerates, so replugged devices show up.
        let api = HidApi::new().map_err(|e| PadError::Hid(e.to_string()))?;

        for ident in identifications {
            let Some(found) = api.device_list().find(|d| {
                ident.matches(d.vendor_id(), d.product_id(), d.serial_number())
            }) else {
                continue;
            };

            let manufacturer = found.manufacturer_string().unwrap_or_default().to_string();
            let product = found.product_string().unwrap_or_default().to_string();
            let serial_number = found.serial_number().unwrap_or_default().to_string();
            info!(
                "opening keypad {:04x}:{:04x} {product} (serial: {serial_number})",
                found.vendor_id(),
                found.product_id()
            );

            let device = found
                .open_device(&api)
                .map_err(|e| PadError::Hid(e.to_string()))?;

            let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
            thread::Builder::new()
                .name("macropad-hid".to_string())
                .spawn(move || pump(&device, out_rx, &in_tx))?;

            return Ok(HidLink {
                outbound: out_tx,
                inbound: in_rx,
                manufacturer,
                product,
                serial_number,
            });
        }

        Err(PadError::DeviceNotFound)
    }
}

/// Blocking I/O loop: drain pending writes, then poll for one report.
fn pump(device: &HidDevice, mut outbound: mpsc::Receiver<Report>, inbound: &mpsc::Sender<Report>) {
    let mut buf = [0u8; REPORT_SIZE + 1];
    loop {
        loop {
            match outbound.try_recv() {
                Ok(report) => {
                    let mut data = [0u8; REPORT_SIZE + 1];
                    data[0] = REPORT_ID;
                    data[1..].copy_from_slice(&report);
                    if let Err(e) = device.write(&data) {
                        warn!("HID write failed: {e}");
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("HID link closed by session");
                    return;
                }
            }
        }

        match device.read_timeout(&mut buf, READ_POLL_MS) {
            Ok(0) => {}
            Ok(n) => {
                // Some platforms hand back the report id, some do not.
                let payload = if n == REPORT_SIZE + 1 && buf[0] == REPORT_ID {
                    &buf[1..n]
                } else {
                    &buf[..n.min(REPORT_SIZE)]
                };
                let mut report = [0u8; REPORT_SIZE];
                report[..payload.len()].copy_from_slice(payload);
                if inbound.blocking_send(report).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("HID read failed: {e}");
                return;
            }
        }
    }
}
