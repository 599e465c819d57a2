//! In-memory keypad firmware for tests.

use super::link::{DeviceConnector, HidLink};
use super::protocol::{Frame, Report, BEGIN_ACK_SEQ};
use crate::config::schema::DeviceIdentification;
use crate::error::{PadError, Result};
use crate::state::HardwareVariant;
use crate::update::{image_checksum, FirmwareVersion};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Hands out queued mock links, one per `connect`.
#[derive(Default)]
pub struct MockConnector {
    links: Mutex<VecDeque<HidLink>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn empty() -> Arc<Self> {
        Arc::default()
    }

    pub fn with_device() -> (Arc<Self>, MockFirmware) {
        let connector = Self::empty();
        let firmware = connector.plug();
        (connector, firmware)
    }

    /// Queue a device for the next `connect`.
    pub fn plug(&self) -> MockFirmware {
        let (to_host, inbound) = mpsc::channel(32);
        let (outbound, from_host) = mpsc::channel(32);
        self.links.lock().push_back(HidLink {
            outbound,
            inbound,
            manufacturer: "Acme".to_string(),
            product: "macropad".to_string(),
            serial_number: "MOCK-1".to_string(),
        });
        MockFirmware {
            to_host,
            from_host,
            version: Arc::new(Mutex::new(FirmwareVersion::new(1, 0, 0))),
            answer_version: Arc::new(AtomicBool::new(true)),
            heartbeats: Arc::new(AtomicBool::new(true)),
            nack_seq: None,
            ignore_seq: None,
            reported_crc: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl DeviceConnector for MockConnector {
    fn connect(&self, _identifications: &[DeviceIdentification]) -> Result<HidLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.links.lock().pop_front().ok_or(PadError::DeviceNotFound)
    }
}

/// The device end of a mock link.
pub struct MockFirmware {
    to_host: mpsc::Sender<Report>,
    from_host: mpsc::Receiver<Report>,
    version: Arc<Mutex<FirmwareVersion>>,
    answer_version: Arc<AtomicBool>,
    heartbeats: Arc<AtomicBool>,
    nack_seq: Option<u16>,
    ignore_seq: Option<u16>,
    reported_crc: Option<u32>,
    log: Arc<Mutex<Vec<Frame>>>,
}

impl MockFirmware {
    pub fn set_version(&self, version: FirmwareVersion) {
        *self.version.lock() = version;
    }

    /// Version currently reported; a completed transfer replaces it.
    pub fn version_handle(&self) -> Arc<Mutex<FirmwareVersion>> {
        self.version.clone()
    }

    pub fn set_answer_version(&self, answer: bool) {
        self.answer_version.store(answer, Ordering::SeqCst);
    }

    /// Clear to stop answering heartbeats.
    pub fn heartbeat_switch(&self) -> Arc<AtomicBool> {
        self.heartbeats.clone()
    }

    /// Always reject this chunk.
    pub fn nack_chunk(&mut self, seq: u16) {
        self.nack_seq = Some(seq);
    }

    /// Never answer this chunk.
    pub fn ignore_chunk(&mut self, seq: u16) {
        self.ignore_seq = Some(seq);
    }

    /// Report this checksum on `UpdateEnd` instead of the computed one.
    pub fn report_crc(&mut self, crc: u32) {
        self.reported_crc = Some(crc);
    }

    /// Every frame received from the host, in order.
    pub fn log(&self) -> Arc<Mutex<Vec<Frame>>> {
        self.log.clone()
    }

    /// Inject raw reports as if the keypad sent them.
    pub fn input(&self) -> mpsc::Sender<Report> {
        self.to_host.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut image = Vec::new();
        let mut next_seq: u16 = 0;
        let mut pending = None;

        while let Some(report) = self.from_host.recv().await {
            let Ok(frame) = Frame::decode(&report) else {
                continue;
            };
            self.log.lock().push(frame.clone());

            let reply = match frame {
                Frame::VersionQuery => self.answer_version.load(Ordering::SeqCst).then(|| {
                    Frame::VersionReply {
                        version: *self.version.lock(),
                        variant: HardwareVariant::TenButtonUsb,
                    }
                }),
                Frame::Heartbeat => self
                    .heartbeats
                    .load(Ordering::SeqCst)
                    .then_some(Frame::Heartbeat),
                Frame::UpdateBegin { version, .. } => {
                    image.clear();
                    next_seq = 0;
                    pending = Some(version);
                    Some(Frame::Ack {
                        seq: BEGIN_ACK_SEQ,
                        crc32: 0,
                    })
                }
                Frame::UpdateChunk { seq, data } => {
                    if self.ignore_seq == Some(seq) {
                        None
                    } else if self.nack_seq == Some(seq) {
                        Some(Frame::Nack { seq, reason: 1 })
                    } else {
                        if seq == next_seq {
                            image.extend_from_slice(&data);
                            next_seq += 1;
                        }
                        Some(Frame::Ack { seq, crc32: 0 })
                    }
                }
                Frame::UpdateEnd => {
                    let crc = self.reported_crc.unwrap_or_else(|| image_checksum(&image));
                    if let Some(version) = pending.take() {
                        *self.version.lock() = version;
                    }
                    Some(Frame::Ack {
                        seq: next_seq,
                        crc32: crc,
                    })
                }
                _ => None,
            };

            if let Some(reply) = reply {
                if self.to_host.send(reply.encode().unwrap()).await.is_err() {
                    break;
                }
            }
        }
    }
}
