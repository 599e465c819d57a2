use super::{FirmwareImage, FirmwareVersion};
use crate::error::{PadError, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound for one feed request, including the image download.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// A downloadable firmware release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: FirmwareVersion,
    pub download_url: String,
}

/// Asset name of the firmware binary for a release.
pub fn asset_name(version: FirmwareVersion) -> String {
    format!("firmware-v{version}.bin")
}

/// GitHub-style "latest release" endpoint.
pub struct ReleaseFeed {
    client: reqwest::Client,
    url: String,
}

impl ReleaseFeed {
    /// # Errors
    /// `PadError::Http` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, REQUEST_TIMEOUT)
    }

    /// # Errors
    /// `PadError::Http` if the HTTP client cannot be built.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("macropadd/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Latest published release, if it ships a firmware binary.
    pub async fn latest(&self) -> Result<Option<ReleaseInfo>> {
        let release: Release = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let version: FirmwareVersion = release.tag_name.parse()?;
        let wanted = asset_name(version);
        debug!("latest firmware release {version}");

        Ok(release
            .assets
            .into_iter()
            .find(|a| a.name == wanted)
            .map(|a| ReleaseInfo {
                version,
                download_url: a.browser_download_url,
            }))
    }

    pub async fn download(&self, release: &ReleaseInfo) -> Result<FirmwareImage> {
        let bytes = self
            .client
            .get(&release.download_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        if bytes.is_empty() {
            return Err(PadError::Protocol("empty firmware download".to_string()));
        }
        info!("downloaded firmware {} ({} bytes)", release.version, bytes.len());
        Ok(FirmwareImage::new(release.version, bytes.to_vec()))
    }

    /// Download the latest image when it is newer than `current`.
    pub async fn newer_than(&self, current: FirmwareVersion) -> Result<Option<FirmwareImage>> {
        match self.latest().await? {
            Some(release) if release.version > current => Ok(Some(self.download(&release).await?)),
            Some(release) => {
                info!("keypad firmware {current} is current (latest {})", release.version);
                Ok(None)
            }
            None => {
                debug!("latest release has no firmware binary");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn serve(tag: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let download = format!("{base}/fw.bin");
        let app = Router::new()
            .route(
                "/latest",
                get(move || async move {
                    Json(serde_json::json!({
                        "tag_name": tag,
                        "assets": [
                            { "name": "notes.txt", "browser_download_url": "unused" },
                            { "name": format!("firmware-{tag}.bin"), "browser_download_url": download },
                        ]
                    }))
                }),
            )
            .route("/fw.bin", get(|| async { vec![1u8, 2, 3, 4] }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("{base}/latest")
    }

    #[tokio::test]
    async fn downloads_newer_release() {
        let feed = ReleaseFeed::new(serve("v1.2.0").await).unwrap();
        let image = feed
            .newer_than(FirmwareVersion::new(1, 1, 9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(image.version, FirmwareVersion::new(1, 2, 0));
        assert_eq!(image.data, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn skips_when_current() {
        let feed = ReleaseFeed::new(serve("v1.2.0").await).unwrap();
        assert!(feed
            .newer_than(FirmwareVersion::new(1, 2, 0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stalled_feed_gives_up() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/latest", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let feed = ReleaseFeed::with_timeout(url, Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), feed.latest())
            .await
            .unwrap();
        assert!(matches!(result, Err(PadError::Http(ref e)) if e.is_timeout()));
    }

    #[test]
    fn asset_naming() {
        assert_eq!(asset_name(FirmwareVersion::new(0, 9, 1)), "firmware-v0.9.1.bin");
    }
}
