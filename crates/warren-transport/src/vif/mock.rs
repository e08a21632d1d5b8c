// ============================================
// File: crates/warren-transport/src/vif/mock.rs
// ============================================
//! # In-Memory Virtual Interface
//!
//! ## Creation Reason
//! Engine and event-loop tests need a virtual interface they can feed
//! and observe without CAP_NET_ADMIN. This one keeps both directions
//! in memory and, unlike a plain queue pair, can also simulate a
//! congested device so backpressure paths are testable.
//!
//! ## Main Functionality
//! - `queue_inbound` / `drain_outbound`: feed reads, inspect writes
//! - `set_write_blocked`: writers park until the device is unblocked,
//!   the way the real driver parks on a non-writable descriptor
//! - The same geometry checks as the Linux driver: oversize frames
//!   and tap runts are refused, not silently captured
//!
//! ## ⚠️ Important Note for Next Developer
//! - Test-only; the capture buffer is bounded so a runaway loop fails
//!   fast instead of eating memory
//! - `read` truncates into short buffers exactly like the kernel path;
//!   size buffers with `VifConfig::frame_capacity`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use warren_core::frame::TunnelKind;

use crate::error::{Result, TransportError};
use crate::traits::{VifConfig, VirtualInterface};

// ============================================
// Constants
// ============================================

/// Upper bound on captured outbound frames; hitting it means a test
/// forgot to drain.
const MAX_CAPTURED: usize = 4096;

/// Upper bound on queued inbound frames.
const MAX_QUEUED: usize = 4096;

// ============================================
// MockVif
// ============================================

/// In-memory virtual interface with congestion simulation.
///
/// # Example
/// ```ignore
/// use warren_transport::vif::MockVif;
/// use warren_transport::traits::{VifConfig, VirtualInterface};
/// use warren_core::frame::TunnelKind;
///
/// let vif = MockVif::new(VifConfig::new("mock0", TunnelKind::Tun));
///
/// vif.queue_inbound(vec![0x45; 20]);
/// let mut buf = [0u8; 1500];
/// let len = vif.read(&mut buf).await?;
///
/// vif.write(&buf[..len]).await?;
/// assert_eq!(vif.drain_outbound().len(), 1);
/// ```
pub struct MockVif {
    config: VifConfig,
    /// Frames a test injected, waiting to be read.
    inbound: Mutex<VecDeque<Vec<u8>>>,
    /// Frames the code under test wrote.
    outbound: Mutex<Vec<Vec<u8>>>,
    /// Link state.
    active: AtomicBool,
    /// Simulated congestion: writers park while set.
    write_blocked: AtomicBool,
    /// Wakes readers when inbound frames arrive.
    inbound_ready: Notify,
    /// Wakes parked writers when congestion clears.
    write_ready: Notify,
}

impl MockVif {
    /// Creates an interface with the given geometry.
    #[must_use]
    pub fn new(config: VifConfig) -> Self {
        Self {
            config,
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            write_blocked: AtomicBool::new(false),
            inbound_ready: Notify::new(),
            write_ready: Notify::new(),
        }
    }

    // ========================================
    // Test Surface
    // ========================================

    /// Queues a frame for the next `read`.
    ///
    /// # Panics
    /// Panics past `MAX_QUEUED` frames; the test is not reading.
    pub fn queue_inbound(&self, frame: Vec<u8>) {
        let mut inbound = self.inbound.lock();
        assert!(inbound.len() < MAX_QUEUED, "inbound queue never drained");
        inbound.push_back(frame);
        drop(inbound);
        self.inbound_ready.notify_one();
    }

    /// Frames queued but not yet read.
    #[must_use]
    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Takes every frame written so far, oldest first.
    #[must_use]
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbound.lock())
    }

    /// Frames written and not yet drained.
    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Simulates (or clears) device congestion.
    ///
    /// While blocked, `write` parks instead of completing, mirroring a
    /// descriptor that stopped signalling writability.
    pub fn set_write_blocked(&self, blocked: bool) {
        self.write_blocked.store(blocked, Ordering::Release);
        if !blocked {
            self.write_ready.notify_one();
        }
    }

    /// Discards all queued and captured frames.
    pub fn reset(&self) {
        self.inbound.lock().clear();
        self.outbound.lock().clear();
    }
}

#[async_trait]
impl VirtualInterface for MockVif {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(frame) = self.inbound.lock().pop_front() {
                // Short buffers truncate, as the kernel path would
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                return Ok(len);
            }
            self.inbound_ready.notified().await;
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.config.check_outbound(buf)?;

        while self.write_blocked.load(Ordering::Acquire) {
            self.write_ready.notified().await;
        }
        // Pass the permit on in case another writer is parked too
        self.write_ready.notify_one();

        let mut outbound = self.outbound.lock();
        if outbound.len() >= MAX_CAPTURED {
            return Err(TransportError::VifWriteFailed {
                reason: "capture buffer full".into(),
            });
        }
        outbound.push(buf.to_vec());
        Ok(buf.len())
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
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MockVif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVif")
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .field("inbound", &self.inbound_len())
            .field("outbound", &self.outbound_len())
            .field("write_blocked", &self.write_blocked.load(Ordering::Acquire))
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn tun_mock() -> MockVif {
        MockVif::new(VifConfig::new("mock0", TunnelKind::Tun))
    }

    #[tokio::test]
    async fn test_inbound_order_preserved() {
        let vif = tun_mock();
        for byte in [0x11u8, 0x22, 0x33] {
            vif.queue_inbound(vec![byte; 20]);
        }
        assert_eq!(vif.inbound_len(), 3);

        let mut buf = [0u8; 64];
        for byte in [0x11u8, 0x22, 0x33] {
            let len = vif.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &[byte; 20]);
        }
        assert_eq!(vif.inbound_len(), 0);
    }

    #[tokio::test]
    async fn test_read_parks_until_frame_arrives() {
        let vif = Arc::new(tun_mock());

        let reader = {
            let vif = Arc::clone(&vif);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let len = vif.read(&mut buf).await.unwrap();
                buf[..len].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        vif.queue_inbound(b"late frame".to_vec());

        let got = timeout(Duration::from_millis(500), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"late frame");
    }

    #[tokio::test]
    async fn test_outbound_capture_and_drain() {
        let vif = tun_mock();

        vif.write(&[0x45; 20]).await.unwrap();
        vif.write(&[0x46; 28]).await.unwrap();
        assert_eq!(vif.outbound_len(), 2);

        let drained = vif.drain_outbound();
        assert_eq!(drained[0].len(), 20);
        assert_eq!(drained[1].len(), 28);
        assert_eq!(vif.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_blocked_write_parks_until_cleared() {
        let vif = Arc::new(tun_mock());
        vif.set_write_blocked(true);

        let writer = {
            let vif = Arc::clone(&vif);
            tokio::spawn(async move { vif.write(&[0x45; 20]).await })
        };

        // The writer must still be parked after a grace period
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(vif.outbound_len(), 0);

        vif.set_write_blocked(false);
        timeout(Duration::from_millis(500), writer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(vif.outbound_len(), 1);
    }

    #[tokio::test]
    async fn test_geometry_enforced_on_write() {
        let vif = tun_mock();
        let oversize = vec![0u8; vif.config.frame_capacity() + 1];
        assert!(vif.write(&oversize).await.is_err());

        let tap = MockVif::new(VifConfig::new("mock1", TunnelKind::Tap));
        assert!(tap.write(&[0u8; 10]).await.is_err()); // runt
        assert!(tap.write(&[0u8; 60]).await.is_ok());
    }

    #[tokio::test]
    async fn test_truncating_read_and_reset() {
        let vif = tun_mock();
        vif.queue_inbound(vec![0x7f; 100]);

        let mut small = [0u8; 8];
        let len = vif.read(&mut small).await.unwrap();
        assert_eq!(len, 8);
        assert_eq!(small, [0x7f; 8]);

        vif.queue_inbound(vec![1]);
        vif.write(&[0x45; 20]).await.unwrap();
        vif.reset();
        assert_eq!(vif.inbound_len(), 0);
        assert_eq!(vif.outbound_len(), 0);
    }
}
