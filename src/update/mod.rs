pub mod release;

use crate::config::schema::UpdateConfig;
use crate::device::protocol::{Frame, BEGIN_ACK_SEQ, CHUNK_SIZE};
use crate::device::session::{SessionHandle, UpdateChannel};
use crate::error::{PadError, Result, UpdateError};
use crc::{crc32, Hasher32};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Semantic firmware version as reported by the keypad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = PadError;

    /// Accepts `1.2.3` with an optional leading `v`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PadError::Config(format!("invalid firmware version: {s:?}"));
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = trimmed.split('.').map(|p| p.parse::<u8>().map_err(|_| invalid()));
        let major = parts.next().ok_or_else(invalid)??;
        let minor = parts.next().ok_or_else(invalid)??;
        let patch = parts.next().ok_or_else(invalid)??;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(major, minor, patch))
    }
}

/// CRC-32 (IEEE) over a whole image, as the keypad computes it.
pub fn image_checksum(data: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    digest.write(data);
    digest.sum32()
}

/// A firmware binary and the version it installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub version: FirmwareVersion,
    pub data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(version: FirmwareVersion, data: Vec<u8>) -> Self {
        Self { version, data }
    }

    /// # Errors
    /// `PadError::Io` if the file cannot be read.
    pub fn from_file(path: &Path, version: FirmwareVersion) -> Result<Self> {
        Ok(Self::new(version, std::fs::read(path)?))
    }

    pub fn checksum(&self) -> u32 {
        image_checksum(&self.data)
    }

    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(CHUNK_SIZE)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateSettings {
    pub ack_timeout: Duration,
    pub chunk_retries: u32,
}

impl From<&UpdateConfig> for UpdateSettings {
    fn from(config: &UpdateConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            chunk_retries: config.chunk_retries,
        }
    }
}

/// Install `image` unless the keypad already runs it (or something newer).
///
/// The session is switched to exclusive update traffic for the transfer and
/// always returned to `Connected`, whether the transfer succeeds or not.
///
/// # Errors
/// `UpdateError` describing the first unrecoverable failure.
pub async fn update(
    session: &SessionHandle,
    image: &FirmwareImage,
    current: FirmwareVersion,
    force: bool,
    settings: &UpdateSettings,
) -> std::result::Result<(), UpdateError> {
    if !force && current >= image.version {
        info!(
            "keypad firmware {current} is up to date (image {})",
            image.version
        );
        return Ok(());
    }
    // Sequence numbers must stay below the begin-ack marker.
    if image.chunk_count() >= usize::from(BEGIN_ACK_SEQ) {
        return Err(UpdateError::ImageTooLarge(image.data.len()));
    }

    info!(
        "updating keypad firmware {current} -> {} ({} bytes, {} chunks)",
        image.version,
        image.data.len(),
        image.chunk_count()
    );

    let mut channel = session.enter_update_mode().await?;
    let transferred = transfer(&mut channel, image, settings).await;
    channel.leave().await;
    transferred?;

    match session.query_version().await {
        Ok(actual) if actual == image.version => {
            info!("keypad firmware updated to {actual}");
            Ok(())
        }
        Ok(actual) => Err(UpdateError::VersionMismatch {
            expected: image.version,
            actual,
        }),
        Err(e) => {
            warn!("version confirmation failed: {e}");
            Err(UpdateError::VersionUnconfirmed)
        }
    }
}

/// Outcome of one send-and-wait exchange.
enum Exchange {
    Acked(u32),
    Rejected(u32),
}

async fn transfer(
    channel: &mut UpdateChannel,
    image: &FirmwareImage,
    settings: &UpdateSettings,
) -> std::result::Result<(), UpdateError> {
    let begin = Frame::UpdateBegin {
        size: image.data.len() as u32,
        crc32: image.checksum(),
        version: image.version,
    };
    if let Exchange::Rejected(_) = exchange(channel, begin, BEGIN_ACK_SEQ, settings).await? {
        return Err(UpdateError::BeginRejected);
    }

    for (index, data) in image.data.chunks(CHUNK_SIZE).enumerate() {
        let seq = index as u16;
        let chunk = Frame::UpdateChunk {
            seq,
            data: data.to_vec(),
        };
        if let Exchange::Rejected(attempts) = exchange(channel, chunk, seq, settings).await? {
            return Err(UpdateError::ChunkRejected { seq, attempts });
        }
    }

    let end_seq = image.chunk_count() as u16;
    let actual = match exchange(channel, Frame::UpdateEnd, end_seq, settings).await? {
        Exchange::Acked(crc) => crc,
        Exchange::Rejected(_) => return Err(UpdateError::EndRejected),
    };
    let expected = image.checksum();
    if actual != expected {
        return Err(UpdateError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Send `frame` and wait for the matching ack, retrying the same frame on a
/// nack or timeout.
async fn exchange(
    channel: &mut UpdateChannel,
    frame: Frame,
    seq: u16,
    settings: &UpdateSettings,
) -> std::result::Result<Exchange, UpdateError> {
    let attempts = settings.chunk_retries + 1;
    for attempt in 1..=attempts {
        channel.send(frame.clone()).await?;
        let deadline = Instant::now() + settings.ack_timeout;
        loop {
            match timeout_at(deadline, channel.recv()).await {
                Ok(Some(Frame::Ack { seq: acked, crc32 })) if acked == seq => {
                    return Ok(Exchange::Acked(crc32));
                }
                Ok(Some(Frame::Nack { seq: nacked, reason })) if nacked == seq => {
                    warn!("seq {seq} rejected (reason {reason}), attempt {attempt}/{attempts}");
                    break;
                }
                Ok(Some(stale)) => debug!("ignoring stale reply {stale:?}"),
                Ok(None) => return Err(UpdateError::SessionClosed),
                Err(_) => {
                    warn!("seq {seq} not acknowledged, attempt {attempt}/{attempts}");
                    break;
                }
            }
        }
    }
    Ok(Exchange::Rejected(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockConnector;
    use crate::device::session::{DeviceSession, SessionSettings};
    use crate::event::Hub;
    use crate::state::DeviceSessionState;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn settings() -> UpdateSettings {
        UpdateSettings {
            ack_timeout: Duration::from_millis(100),
            chunk_retries: 3,
        }
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::new(
            FirmwareVersion::new(1, 1, 0),
            (0..len).map(|i| (i % 251) as u8).collect(),
        )
    }

    async fn open(connector: &Arc<MockConnector>, hub: &Hub) -> DeviceSession {
        let settings = SessionSettings {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_misses: 3,
            version_timeout: Duration::from_millis(200),
        };
        DeviceSession::open(connector.clone(), &[], hub.clone(), settings, CancellationToken::new())
            .await
            .unwrap()
    }

    fn chunks_sent(log: &[Frame]) -> Vec<u16> {
        log.iter()
            .filter_map(|f| match f {
                Frame::UpdateChunk { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn version_parsing_and_order() {
        assert_eq!("v1.2.3".parse::<FirmwareVersion>().unwrap(), FirmwareVersion::new(1, 2, 3));
        assert!("1.2".parse::<FirmwareVersion>().is_err());
        assert!("1.2.3.4".parse::<FirmwareVersion>().is_err());
        assert!(FirmwareVersion::new(1, 10, 0) > FirmwareVersion::new(1, 9, 9));
        assert_eq!(FirmwareVersion::new(2, 0, 1).to_string(), "2.0.1");
    }

    #[test]
    fn checksum_matches_reference() {
        assert_eq!(image_checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(image(CHUNK_SIZE * 2 + 1).chunk_count(), 3);
    }

    #[tokio::test]
    async fn same_version_transfers_nothing() {
        let (connector, firmware) = MockConnector::with_device();
        let log = firmware.log();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await;
        let image = image(500);

        update(session.handle(), &image, image.version, false, &settings())
            .await
            .unwrap();
        assert!(!log.lock().iter().any(|f| matches!(
            f,
            Frame::UpdateBegin { .. } | Frame::UpdateChunk { .. }
        )));
        assert_eq!(hub.device_status().state, DeviceSessionState::Connected);
    }

    #[tokio::test]
    async fn full_transfer_confirms_version() {
        let (connector, firmware) = MockConnector::with_device();
        let log = firmware.log();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await;
        let image = image(CHUNK_SIZE * 4 + 10);

        update(session.handle(), &image, FirmwareVersion::new(1, 0, 0), false, &settings())
            .await
            .unwrap();

        let log = log.lock();
        assert_eq!(chunks_sent(&log), vec![0, 1, 2, 3, 4]);
        assert!(matches!(log.first(), Some(Frame::VersionQuery)));
        assert!(matches!(log.last(), Some(Frame::VersionQuery)));
        assert_eq!(hub.device_status().info.unwrap().version, image.version);
        assert_eq!(hub.device_status().state, DeviceSessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_chunk_aborts_after_retries() {
        let (connector, mut firmware) = MockConnector::with_device();
        firmware.nack_chunk(3);
        let log = firmware.log();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await;
        let image = image(CHUNK_SIZE * 6);

        let err = update(session.handle(), &image, FirmwareVersion::new(1, 0, 0), false, &settings())
            .await
            .unwrap_err();
        assert_eq!(err, UpdateError::ChunkRejected { seq: 3, attempts: 4 });
        assert_eq!(chunks_sent(&log.lock()), vec![0, 1, 2, 3, 3, 3, 3]);
        assert!(!log.lock().contains(&Frame::UpdateEnd));
        assert_eq!(hub.device_status().state, DeviceSessionState::Connected);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_fatal() {
        let (connector, mut firmware) = MockConnector::with_device();
        firmware.report_crc(0x1234_5678);
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await;
        let image = image(100);

        let err = update(session.handle(), &image, FirmwareVersion::new(1, 0, 0), true, &settings())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UpdateError::ChecksumMismatch {
                expected: image.checksum(),
                actual: 0x1234_5678
            }
        );
        assert_eq!(hub.device_status().state, DeviceSessionState::Connected);
    }

    #[tokio::test]
    async fn forced_update_reinstalls_same_version() {
        let (connector, firmware) = MockConnector::with_device();
        firmware.set_version(FirmwareVersion::new(1, 1, 0));
        let log = firmware.log();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await;
        let image = image(10);

        update(session.handle(), &image, image.version, true, &settings())
            .await
            .unwrap();
        assert_eq!(chunks_sent(&log.lock()), vec![0]);
    }

    #[tokio::test]
    async fn closing_session_fails_update() {
        let (connector, mut firmware) = MockConnector::with_device();
        // Never answered, so the transfer is still waiting when the session closes.
        firmware.ignore_chunk(0);
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await;
        let handle = session.handle().clone();
        let image = image(100);
        let slow = UpdateSettings {
            ack_timeout: Duration::from_secs(30),
            chunk_retries: 3,
        };

        let running = tokio::spawn(async move {
            update(&handle, &image, FirmwareVersion::new(1, 0, 0), false, &slow).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await;
        assert_eq!(running.await.unwrap(), Err(UpdateError::SessionClosed));
    }
}
