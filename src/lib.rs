//! linknet
//!
//! Point-to-point layer-3 VPN bridging a local TUN interface to a remote
//! peer over a single authenticated, encrypted TCP connection.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  TUN ◄──► Bridge ◄──► Crypto Channel ◄──► TCP ◄──► Peer      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One side runs as a server (accepts one client), the other as a client
//! (connects and initiates the PSK handshake). IP packets read from the
//! TUN are encrypted (AES-256-CBC), authenticated (HMAC-SHA-256), framed,
//! and sent over the socket; inbound frames are verified, decrypted, and
//! injected back into the TUN.

pub mod bridge;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod routes;
pub mod stats;
pub mod transport;
pub mod tun;

// Re-exports for convenience
pub use bridge::Bridge;
pub use config::{Config, Mode};
pub use crypto::{generate_psk, CryptoChannel};
pub use error::{CryptoError, FrameError, VpnError, VpnResult};
pub use stats::{BridgeStats, StatsSnapshot};
pub use tun::TunDevice;
