//! Runtime configuration.
//!
//! All configuration comes from the command line (plus an optional PSK
//! file); nothing is persisted. The config is immutable once validated.

use crate::crypto::MIN_PSK_LEN;
use crate::error::{VpnError, VpnResult};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default TCP port for the tunnel.
pub const DEFAULT_PORT: u16 = 51860;

/// Default TUN device name.
pub const DEFAULT_TUN_NAME: &str = "tun0";

/// Default TUN MTU. Leaves room for the 56-byte frame header, the data IV,
/// and CBC padding inside a 1500-byte path MTU.
pub const DEFAULT_MTU: u16 = 1408;

/// Accepted TUN MTU range.
pub const MTU_RANGE: std::ops::RangeInclusive<u16> = 576..=1408;

/// Default delay between client reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Operating mode for this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Connect to a remote server and initiate authentication.
    Client,
    /// Listen and accept a single client.
    Server,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// Immutable tunnel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Remote server host or IP. Required in client mode.
    pub remote_host: Option<String>,
    pub port: u16,
    pub tun_name: String,
    /// This end's TUN address.
    pub local_tun_ip: Ipv4Addr,
    /// Peer's TUN address (point-to-point destination).
    pub remote_tun_ip: Ipv4Addr,
    pub tun_mtu: u16,
    /// Pre-shared key. Required unless encryption is disabled.
    pub psk: Option<String>,
    pub enable_encryption: bool,
    pub enable_keepalive: bool,
    pub reconnect_interval: Duration,
    /// Add a host route to the peer's TUN address on startup.
    pub enable_auto_route: bool,
}

impl Config {
    /// Validate the configuration.
    ///
    /// Returns a configuration error if:
    /// - client mode has no remote host
    /// - the MTU is outside [`MTU_RANGE`]
    /// - encryption is enabled without a PSK, or the PSK is too short
    pub fn validate(&self) -> VpnResult<()> {
        if self.mode == Mode::Client && self.remote_host.as_deref().unwrap_or("").is_empty() {
            return Err(VpnError::config(
                "remote server address is required in client mode (--remote-ip)",
            ));
        }

        if !MTU_RANGE.contains(&self.tun_mtu) {
            return Err(VpnError::config(format!(
                "TUN MTU {} out of range ({}-{})",
                self.tun_mtu,
                MTU_RANGE.start(),
                MTU_RANGE.end()
            )));
        }

        if self.enable_encryption {
            match self.psk.as_deref() {
                None | Some("") => {
                    return Err(VpnError::config(
                        "a pre-shared key is required when encryption is enabled \
                         (--psk or --psk-file, or --no-encryption to disable)",
                    ));
                }
                Some(psk) if psk.len() < MIN_PSK_LEN => {
                    return Err(VpnError::config(format!(
                        "pre-shared key too short: {} bytes (minimum {})",
                        psk.len(),
                        MIN_PSK_LEN
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Read a PSK from a file, trimming trailing whitespace.
///
/// The file is read exactly once at startup; nothing else is persisted.
pub fn load_psk_file(path: &Path) -> VpnResult<String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| VpnError::config(format!("cannot read PSK file {}: {}", path.display(), e)))?;
    let psk = contents.trim_end().to_string();
    if psk.is_empty() {
        return Err(VpnError::config(format!(
            "PSK file {} is empty",
            path.display()
        )));
    }
    Ok(psk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mode: Mode) -> Config {
        Config {
            mode,
            remote_host: Some("198.51.100.7".to_string()),
            port: DEFAULT_PORT,
            tun_name: DEFAULT_TUN_NAME.to_string(),
            local_tun_ip: "10.0.1.2".parse().expect("parse IPv4"),
            remote_tun_ip: "10.0.1.1".parse().expect("parse IPv4"),
            tun_mtu: DEFAULT_MTU,
            psk: Some("0123456789abcdef0123456789abcdef".to_string()),
            enable_encryption: true,
            enable_keepalive: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            enable_auto_route: false,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(base_config(Mode::Client).validate().is_ok());
        assert!(base_config(Mode::Server).validate().is_ok());
    }

    #[test]
    fn test_client_requires_remote_host() {
        let mut config = base_config(Mode::Client);
        config.remote_host = None;
        let err = config.validate().expect_err("missing remote host");
        assert!(err.to_string().contains("--remote-ip"));

        // Servers listen; no remote host needed.
        let mut config = base_config(Mode::Server);
        config.remote_host = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mtu_range() {
        for mtu in [576u16, 1200, 1408] {
            let mut config = base_config(Mode::Server);
            config.tun_mtu = mtu;
            assert!(config.validate().is_ok(), "MTU {} should be valid", mtu);
        }
        for mtu in [0u16, 575, 1409, 9000] {
            let mut config = base_config(Mode::Server);
            config.tun_mtu = mtu;
            assert!(config.validate().is_err(), "MTU {} should be invalid", mtu);
        }
    }

    #[test]
    fn test_encryption_requires_psk() {
        let mut config = base_config(Mode::Server);
        config.psk = None;
        assert!(config.validate().is_err());

        config.psk = Some("too-short".to_string());
        let err = config.validate().expect_err("short PSK");
        assert!(err.to_string().contains("minimum 16"));

        config.psk = None;
        config.enable_encryption = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_psk_file_trims_newline() {
        let dir = std::env::temp_dir();
        let path = dir.join("linknet-test-psk");
        std::fs::write(&path, "0123456789abcdef0123456789abcdef\n").expect("write PSK file");

        let psk = load_psk_file(&path).expect("load PSK");
        assert_eq!(psk, "0123456789abcdef0123456789abcdef");

        std::fs::write(&path, "\n").expect("write empty PSK file");
        assert!(load_psk_file(&path).is_err());

        let _ = std::fs::remove_file(&path);
    }
}
