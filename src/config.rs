use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub server: Endpoint,
    pub session: SessionConfig,
    pub liveness: LivenessConfig,
    pub capture: CaptureConfig,
    pub identity: IdentityConfig,
    pub ota: OtaConfig,
    pub boot: BootConfig,
}

/// The one coordinating server this node talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry_backoff_secs: f64,     // minimum gap between connect attempts
    pub connect_timeout_secs: f64,   // handshake gives up after this
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub hb_interval_secs: f64,
    pub hb_timeout_secs: f64,
    pub hb_max_misses: u32,
    pub soft_wd_interval_secs: f64,  // total silence before forced close
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub late_tolerance_secs: f64,    // slightly-late commands still count as "now"
    pub image_path: Option<String>,
    pub resolution: String,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub device_id: Option<String>,
    pub interface: Option<String>,
    pub board_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub check_interval_secs: f64,
    pub staging_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub link_timeout_secs: f64,
    pub tick_interval_ms: u64,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            retry_backoff_secs: 5.0,
            connect_timeout_secs: 3.0,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        LivenessConfig {
            hb_interval_secs: 5.0,
            hb_timeout_secs: 3.0,
            hb_max_misses: 2,
            soft_wd_interval_secs: 30.0,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            late_tolerance_secs: 0.010,
            image_path: None,
            resolution: "SVGA".to_string(),
            jpeg_quality: 12,
        }
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        OtaConfig {
            enabled: false,
            base_url: None,
            auth_token: None,
            check_interval_secs: 60.0,
            staging_dir: "/var/lib/camnode/firmware".to_string(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            link_timeout_secs: 10.0,  // 20 polls at 500ms
            tick_interval_ms: 10,
        }
    }
}

impl Endpoint {
    /// Same endpoint with `host` replaced by an address literal.
    /// Performs a blocking name lookup unless the host already is one.
    pub fn resolve(&self) -> Result<Endpoint> {
        if self.host.parse::<IpAddr>().is_ok() {
            return Ok(self.clone());
        }
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", self.host))?
            .next()
            .ok_or_else(|| anyhow!("No address for {}:{}", self.host, self.port))?;
        Ok(Endpoint {
            host: addr.ip().to_string(),
            port: self.port,
        })
    }
}

fn check_secs(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("{} must be a finite, non-negative number of seconds (got {})", name, value);
    }
    Ok(())
}

impl SystemConfig {
    /// Read a JSON config file. Missing sections and fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Reject durations that cannot become a `Duration` or a sane deadline.
    pub fn validate(&self) -> Result<()> {
        check_secs("session.retry_backoff_secs", self.session.retry_backoff_secs)?;
        check_secs("session.connect_timeout_secs", self.session.connect_timeout_secs)?;
        check_secs("liveness.hb_interval_secs", self.liveness.hb_interval_secs)?;
        check_secs("liveness.hb_timeout_secs", self.liveness.hb_timeout_secs)?;
        check_secs("liveness.soft_wd_interval_secs", self.liveness.soft_wd_interval_secs)?;
        check_secs("capture.late_tolerance_secs", self.capture.late_tolerance_secs)?;
        check_secs("ota.check_interval_secs", self.ota.check_interval_secs)?;
        check_secs("boot.link_timeout_secs", self.boot.link_timeout_secs)?;
        if self.liveness.hb_max_misses == 0 {
            bail!("liveness.hb_max_misses must be at least 1");
        }
        Ok(())
    }
}
