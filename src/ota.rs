//! Firmware update polling.
//!
//! Runs on its own period, over its own HTTP transport, and is not gated by
//! the session state. A staged update ends the process so the supervisor can
//! restart into the new image.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Duration;

use crate::traits::FirmwareUpdater;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OtaPoller<U: FirmwareUpdater> {
    updater: U,
    interval_secs: f64,
    last_check: Option<f64>,
}

impl<U: FirmwareUpdater> OtaPoller<U> {
    pub fn new(updater: U, interval_secs: f64) -> Self {
        OtaPoller {
            updater,
            interval_secs,
            last_check: None,
        }
    }

    /// Check for an update if the period has elapsed. Returns the version that
    /// was staged, if any.
    pub fn poll(&mut self, now: f64) -> Option<String> {
        if let Some(last) = self.last_check {
            if now - last < self.interval_secs {
                return None;
            }
        }
        self.last_check = Some(now);

        let version = match self.updater.check_for_update() {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!("[OTA] Firmware up to date");
                return None;
            }
            Err(e) => {
                warn!("[OTA] Version check failed: {}", e);
                return None;
            }
        };

        info!("[OTA] New firmware {} available", version);
        match self.updater.apply_update(&version) {
            Ok(()) => {
                info!("[OTA] Firmware {} staged", version);
                Some(version)
            }
            Err(e) => {
                warn!("[OTA] Update to {} failed: {}", version, e);
                None
            }
        }
    }
}

/// Fetches `version.txt` and firmware images from the update server.
pub struct HttpFirmwareUpdater {
    client: reqwest::blocking::Client,
    base_url: String,
    board: String,
    current_version: String,
    auth_token: Option<String>,
    staging_dir: PathBuf,
}

impl HttpFirmwareUpdater {
    pub fn new(
        base_url: &str,
        board: &str,
        current_version: &str,
        auth_token: Option<String>,
        staging_dir: PathBuf,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(HttpFirmwareUpdater {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            board: board.to_string(),
            current_version: current_version.to_string(),
            auth_token,
            staging_dir,
        })
    }

    pub fn version_url(&self) -> String {
        format!("{}/{}/version.txt", self.base_url, self.board)
    }

    pub fn firmware_url(&self, version: &str) -> String {
        format!("{}/{}/firmware/{}_{}.bin", self.base_url, self.board, self.board, version)
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().with_context(|| format!("GET {}", url))?;
        if !resp.status().is_success() {
            return Err(anyhow!("GET {} returned {}", url, resp.status()));
        }
        Ok(resp)
    }
}

impl FirmwareUpdater for HttpFirmwareUpdater {
    fn check_for_update(&mut self) -> Result<Option<String>> {
        let published = self.get(&self.version_url())?.text()?;
        let published = published.trim();

        if published.is_empty() || published == self.current_version {
            Ok(None)
        } else {
            Ok(Some(published.to_string()))
        }
    }

    fn apply_update(&mut self, version: &str) -> Result<()> {
        let url = self.firmware_url(version);
        info!("[OTA] Downloading {}", url);

        let resp = self.get(&url)?;
        let expected = resp.content_length();
        let image = resp.bytes()?;

        if image.is_empty() {
            return Err(anyhow!("empty firmware image"));
        }
        if let Some(len) = expected {
            if len as usize != image.len() {
                return Err(anyhow!("incomplete download: {}/{} bytes", image.len(), len));
            }
        }

        std::fs::create_dir_all(&self.staging_dir)
            .with_context(|| format!("Failed to create {}", self.staging_dir.display()))?;
        let target = self.staging_dir.join(format!("{}_{}.bin", self.board, version));
        let partial = target.with_extension("bin.part");
        std::fs::write(&partial, &image)?;
        std::fs::rename(&partial, &target)?;

        info!("[OTA] Wrote {} bytes to {}", image.len(), target.display());
        Ok(())
    }
}
