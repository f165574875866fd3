//! TUN device creation and packet I/O.
//!
//! The bridge consumes a minimal surface: one IP packet per read, one per
//! write, split into owned halves so each forwarding direction has its own
//! task. Device lifecycle (addresses, MTU, link state) is configured once
//! at creation; the device is a point-to-point link between the two tunnel
//! addresses.

use crate::config::Config;
use crate::error::{VpnError, VpnResult};
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// A managed TUN device with async I/O.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create and bring up the TUN device described by `config`.
    ///
    /// The device is configured point-to-point: local address
    /// `local_tun_ip`, peer `remote_tun_ip`, host netmask.
    pub fn create(config: &Config) -> VpnResult<Self> {
        let mut tun_config = Configuration::default();
        tun_config
            .address(config.local_tun_ip)
            .netmask(Ipv4Addr::BROADCAST)
            .destination(config.remote_tun_ip)
            .mtu(config.tun_mtu)
            .up();

        #[allow(deprecated)]
        tun_config.name(&config.tun_name);

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| VpnError::tun_device(format!("failed to create TUN device: {}", e)))?;

        let name = device
            .tun_name()
            .map_err(|e| VpnError::tun_device(format!("failed to get TUN name: {}", e)))?;

        log::info!(
            "created TUN device {} ({} -> {}, mtu {})",
            name,
            config.local_tun_ip,
            config.remote_tun_ip,
            config.tun_mtu
        );

        Ok(Self {
            device,
            name,
            mtu: config.tun_mtu,
        })
    }

    /// Device name as assigned by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer size needed for one packet read.
    pub fn buffer_size(&self) -> usize {
        self.mtu as usize + tun::PACKET_INFORMATION_LENGTH
    }

    /// Split into read and write halves.
    /// Note: the tun crate returns (writer, reader) order from split().
    pub fn split(self) -> VpnResult<(TunReader, TunWriter)> {
        let buffer_size = self.buffer_size();
        let (writer, reader) = self
            .device
            .split()
            .map_err(|e| VpnError::tun_device(format!("failed to split TUN device: {}", e)))?;

        Ok((
            TunReader {
                reader,
                buffer_size,
            },
            TunWriter { writer },
        ))
    }
}

/// Read half of a TUN device.
pub struct TunReader {
    reader: DeviceReader,
    buffer_size: usize,
}

impl TunReader {
    /// Read one IP packet into `buf`, returning its length.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> VpnResult<usize> {
        let n = self.reader.read(buf).await?;
        Ok(n)
    }

    /// Buffer size needed for one packet read.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Write half of a TUN device.
pub struct TunWriter {
    writer: DeviceWriter,
}

impl TunWriter {
    /// Write exactly one IP packet.
    pub async fn write_packet(&mut self, packet: &[u8]) -> VpnResult<()> {
        self.writer.write_all(packet).await?;
        Ok(())
    }
}
