//! Linux TUN device
//!
//! Opens `/dev/net/tun` in non-blocking mode and drives it through tokio's
//! `AsyncFd`, so packet reads and writes never park a runtime thread.

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use super::VirtualInterface;
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit differently
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Owned TUN file descriptor
struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A Linux TUN interface carrying raw IP packets (no packet info header)
pub struct TunDevice {
    fd: AsyncFd<TunFd>,
    name: String,
    closed: CancellationToken,
}

impl TunDevice {
    /// Create a TUN device; must be called inside a tokio runtime
    pub fn create(name: &str) -> Result<Self> {
        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let fd = TunFd(fd);

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd.0, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let flags = unsafe { libc::fcntl(fd.0, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd.0, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        tracing::info!("Created TUN device {}", actual_name);

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: actual_name,
            closed: CancellationToken::new(),
        })
    }

    /// Assign the inside address, set the MTU and bring the link up
    pub fn configure(&self, address: IpAddr, prefix: u8, mtu: u16) -> Result<()> {
        run_ip(&["addr", "add", &format!("{}/{}", address, prefix), "dev", &self.name])?;

        if let Err(e) = run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()]) {
            tracing::warn!("Failed to set MTU {} on {}: {}", mtu, self.name, e);
        }

        run_ip(&["link", "set", "dev", &self.name, "up"])?;

        tracing::info!("{} configured with {}/{} (mtu {})", self.name, address, prefix, mtu);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(Error::Config(format!("`ip {}` failed with {}", args.join(" "), status)));
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[async_trait]
impl VirtualInterface for TunDevice {
    async fn recv_packet(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::InterfaceClosed),
                guard = self.fd.readable() => guard?,
            };

            match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_packet(&self, packet: &[u8]) -> Result<usize> {
        loop {
            if self.closed.is_cancelled() {
                return Err(Error::InterfaceClosed);
            }

            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), packet)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("Closing TUN device {}", self.name);
        }
        self.closed.cancel();
    }
}
