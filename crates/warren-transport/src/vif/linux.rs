// ============================================
// File: crates/warren-transport/src/vif/linux.rs
// ============================================
//! # Linux TUN/TAP Driver
//!
//! ## Creation Reason
//! Binds one end of the tunnel to a kernel netdevice: an L3 point for
//! tun mode, an L2 port for tap mode, created on demand through the
//! `/dev/net/tun` clone device.
//!
//! ## Main Functionality
//! - `LinuxVif`: device creation, bring-up, frame read/write
//! - Raw `ifreq` encoding for the `TUNSETIFF` bind
//! - Address/MTU/link-state configuration through `ip(8)`
//!
//! ## Frame Contract
//! The descriptor is bound with `IFF_NO_PI`, so no kernel proto word
//! precedes the frames: a read hands back exactly one L3 packet (tun)
//! or one Ethernet frame (tap, possibly 802.1Q tagged), ready for the
//! routing extractor. Callers size buffers with
//! [`VifConfig::frame_capacity`], which reserves the L2 header plus
//! one VLAN tag in tap mode; outbound frames are checked against the
//! same geometry before they reach the kernel.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Creating the device needs root or CAP_NET_ADMIN
//! - `ip addr replace` keeps bring-up idempotent across restarts; do
//!   not switch it back to `add`
//! - A tap device may deliver tagged frames 4 bytes past MTU + 14;
//!   undersized read buffers silently truncate

#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, info, warn};

use warren_core::frame::TunnelKind;

use crate::error::{Result, TransportError};
use crate::traits::{VifConfig, VirtualInterface};

// ============================================
// Constants
// ============================================

/// Clone device that mints tun/tap descriptors.
const CLONE_DEVICE: &str = "/dev/net/tun";

/// `TUNSETIFF` ioctl request number.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Request an L3 (packet) device.
const IFF_TUN: libc::c_short = 0x0001;

/// Request an L2 (Ethernet) device.
const IFF_TAP: libc::c_short = 0x0002;

/// Suppress the kernel's 4-byte proto word on every frame.
const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` size: the interface name plus a 24-byte request
/// union, of which `TUNSETIFF` uses the leading flags halfword.
const IFREQ_LEN: usize = libc::IFNAMSIZ + 24;

/// Offset of the flags halfword inside the request.
const IFREQ_FLAGS_OFF: usize = libc::IFNAMSIZ;

// ============================================
// ifreq Encoding
// ============================================

/// Builds the raw `TUNSETIFF` request for a named device.
///
/// The name is nul-terminated inside the leading `IFNAMSIZ` bytes
/// (truncated if necessary); the mode flags land in the halfword that
/// follows, in native byte order.
fn encode_ifreq(name: &str, flags: libc::c_short) -> [u8; IFREQ_LEN] {
    let mut raw = [0u8; IFREQ_LEN];
    let bytes = name.as_bytes();
    let keep = bytes.len().min(libc::IFNAMSIZ - 1);
    raw[..keep].copy_from_slice(&bytes[..keep]);
    raw[IFREQ_FLAGS_OFF..IFREQ_FLAGS_OFF + 2].copy_from_slice(&flags.to_ne_bytes());
    raw
}

/// Reads back the device name the kernel registered.
///
/// The kernel rewrites the name field when it expands a pattern such
/// as `tap%d`, so the request must be decoded after the ioctl.
fn decode_ifreq_name(raw: &[u8; IFREQ_LEN]) -> String {
    let name = &raw[..libc::IFNAMSIZ];
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    String::from_utf8_lossy(&name[..end]).into_owned()
}

/// `TUNSETIFF` flags for the requested mode, always without the proto
/// word.
const fn mode_flags(kind: TunnelKind) -> libc::c_short {
    let mode = match kind {
        TunnelKind::Tun => IFF_TUN,
        TunnelKind::Tap => IFF_TAP,
    };
    mode | IFF_NO_PI
}

// ============================================
// Device Creation
// ============================================

/// Opens the clone device, binds it to the named interface, and puts
/// the descriptor into non-blocking mode.
///
/// Returns the file and the name the kernel actually registered.
fn clone_device(config: &VifConfig) -> Result<(File, String)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(CLONE_DEVICE)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                TransportError::PermissionDenied {
                    operation: format!("open {CLONE_DEVICE}"),
                }
            } else {
                TransportError::vif_create_failed(&config.name, e.to_string())
            }
        })?;

    let mut request = encode_ifreq(&config.name, mode_flags(config.kind));
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, request.as_mut_ptr()) };
    if rc < 0 {
        return Err(TransportError::vif_create_failed(
            &config.name,
            format!("TUNSETIFF: {}", io::Error::last_os_error()),
        ));
    }

    set_nonblocking(&file)
        .map_err(|e| TransportError::vif_create_failed(&config.name, e.to_string()))?;

    Ok((file, decode_ifreq_name(&request)))
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ============================================
// LinuxVif
// ============================================

/// Linux tun/tap device.
///
/// # Example
/// ```ignore
/// use warren_transport::vif::LinuxVif;
/// use warren_transport::traits::VifConfig;
/// use warren_core::frame::TunnelKind;
///
/// let vif = LinuxVif::create(VifConfig::new("warren0", TunnelKind::Tap)).await?;
/// vif.up().await?;
///
/// let mut buf = vec![0u8; vif.frame_capacity()];
/// let len = vif.read(&mut buf).await?;
/// ```
pub struct LinuxVif {
    /// Readiness-driven descriptor.
    fd: AsyncFd<File>,
    /// Geometry and identity; `name` holds the registered name.
    config: VifConfig,
    /// Link state as last set through `up`/`down`.
    active: AtomicBool,
}

impl LinuxVif {
    /// Creates the device described by `config`.
    ///
    /// # Errors
    /// - `PermissionDenied` without CAP_NET_ADMIN
    /// - `VifCreateFailed` if the clone bind or fcntl setup fails
    pub async fn create(config: VifConfig) -> Result<Self> {
        config.validate()?;

        let (file, registered) = clone_device(&config)?;
        debug!("{} device '{}' bound", config.kind, registered);

        let fd = AsyncFd::new(file).map_err(|e| {
            TransportError::vif_create_failed(&registered, format!("readiness setup: {e}"))
        })?;

        let mut config = config;
        config.name = registered;

        Ok(Self {
            fd,
            config,
            active: AtomicBool::new(false),
        })
    }

    /// Largest frame this device can hand back or accept; sized per
    /// mode (tap reserves the Ethernet header plus one 802.1Q tag).
    #[must_use]
    pub fn frame_capacity(&self) -> usize {
        self.config.frame_capacity()
    }

    /// Device address in CIDR notation, for `ip addr`.
    fn cidr(&self) -> String {
        let prefix = u32::from_be_bytes(self.config.netmask.octets()).count_ones();
        format!("{}/{prefix}", self.config.address)
    }

    /// Runs one `ip(8)` invocation against this device.
    fn ip(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("ip").args(args).output().map_err(|e| {
            TransportError::VifConfigFailed {
                name: self.config.name.clone(),
                reason: format!("ip {}: {e}", args.join(" ")),
            }
        })?;

        if output.status.success() {
            return Ok(());
        }
        Err(TransportError::VifConfigFailed {
            name: self.config.name.clone(),
            reason: format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[async_trait]
impl VirtualInterface for LinuxVif {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.fd
            .async_io(Interest::READABLE, |file| {
                let rc = unsafe {
                    libc::read(file.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            })
            .await
            .map_err(|e| TransportError::VifReadFailed {
                reason: e.to_string(),
            })
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.config.check_outbound(buf)?;

        self.fd
            .async_io(Interest::WRITABLE, |file| {
                let rc = unsafe {
                    libc::write(file.as_raw_fd(), buf.as_ptr().cast(), buf.len())
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            })
            .await
            .map_err(|e| TransportError::VifWriteFailed {
                reason: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> TunnelKind {
        self.config.kind
    }

    fn mtu(&self) -> u16 {
        self.config.mtu
    }

    async fn up(&self) -> Result<()> {
        let name = self.config.name.clone();
        let mtu = self.config.mtu.to_string();

        // `replace` is idempotent: a leftover address from a previous
        // run is overwritten instead of failing the bring-up
        self.ip(&["addr", "replace", &self.cidr(), "dev", &name])?;
        self.ip(&["link", "set", "dev", &name, "mtu", &mtu])?;
        self.ip(&["link", "set", "dev", &name, "up"])?;

        self.active.store(true, Ordering::Release);
        info!(
            "{} '{}' up, {} (capacity {} bytes)",
            self.config.kind,
            name,
            self.cidr(),
            self.frame_capacity()
        );
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        if let Err(e) = self.ip(&["link", "set", "dev", &self.config.name, "down"]) {
            // The device may already be gone; not worth failing over
            warn!("{}", e);
        }
        self.active.store(false, Ordering::Release);
        info!("{} '{}' down", self.config.kind, self.config.name);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LinuxVif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxVif")
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .field("capacity", &self.frame_capacity())
            .field("active", &self.is_up())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    // Device-backed paths need CAP_NET_ADMIN; only the request
    // encoding and geometry are covered here.

    #[test]
    fn test_encode_ifreq_layout() {
        let raw = encode_ifreq("warren0", mode_flags(TunnelKind::Tap));

        // Name is nul-terminated at the front
        assert_eq!(&raw[..7], b"warren0");
        assert_eq!(raw[7], 0);

        // Flags halfword sits right after the name field
        let flags = libc::c_short::from_ne_bytes([raw[IFREQ_FLAGS_OFF], raw[IFREQ_FLAGS_OFF + 1]]);
        assert_eq!(flags, IFF_TAP | IFF_NO_PI);
    }

    #[test]
    fn test_ifreq_name_roundtrip_and_cap() {
        let raw = encode_ifreq("warren0", 0);
        assert_eq!(decode_ifreq_name(&raw), "warren0");

        // Overlong names are truncated below IFNAMSIZ, nul included
        let long = "q".repeat(libc::IFNAMSIZ + 8);
        let raw = encode_ifreq(&long, 0);
        assert_eq!(decode_ifreq_name(&raw).len(), libc::IFNAMSIZ - 1);
    }

    #[test]
    fn test_mode_flags_suppress_proto_word() {
        assert_eq!(mode_flags(TunnelKind::Tun) & IFF_NO_PI, IFF_NO_PI);
        assert_eq!(mode_flags(TunnelKind::Tap) & IFF_NO_PI, IFF_NO_PI);
        assert_ne!(mode_flags(TunnelKind::Tun), mode_flags(TunnelKind::Tap));
    }
}
