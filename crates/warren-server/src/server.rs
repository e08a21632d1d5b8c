// ============================================
// File: crates/warren-server/src/server.rs
// ============================================
//! # Server Orchestrator and Event Loop
//!
//! ## Creation Reason
//! Wires the engine to real I/O: the wire socket, the virtual
//! interface, per-instance timers and signals, in both datagram (UDP)
//! and stream (TCP) modes.
//!
//! ## Main Functionality
//! - `Server`: lifecycle management and component wiring
//! - `run_engine_udp`: the single-task datagram event loop
//! - `run_engine_tcp`: accept loop plus per-connection stream drivers
//!
//! ## Event Loop Shape (UDP)
//! ```text
//! loop:
//!   1. consume latched signals (TERM/HUP drain, USR1 soft)
//!   2. deadline = earliest wake-up, capped
//!   3. wait on {link readable, vif readable, timer, signal}
//!      - link/vif priority alternates each pass
//!      - vif reads pause while deferred output is pending
//!   4. one match on the event; engine returns a Dispatch to perform
//!   5. per-second housekeeping, deferred flush, status rewrite
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The engine never blocks; every wait lives in this module
//! - Stream drivers marshal their results through the engine's guarded
//!   structures - never touch another connection's socket
//! - Processing of one frame always runs to completion before the next
//!   event is taken

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use warren_core::addr::{OuterAddr, PktInfo};
use warren_core::codec::MAX_FRAME_SIZE;
use warren_core::pipeline::{NullPipelineFactory, PipelineFactory};
use warren_transport::tcp::{bind_stream_listener, SendStatus, TcpLink};
use warren_transport::traits::{DatagramTransport, TrySend, VifConfig, VirtualInterface};
use warren_transport::udp::UdpTransport;

use crate::config::{ServerConfig, WireProto};
use crate::engine::instance::{ClientInstance, DeferredPush};
use crate::engine::pool::JsonPoolFile;
use crate::engine::{Dispatch, EngineConfig, MultiEngine};
use crate::error::{Result, ServerError};
use crate::signal::SignalFlags;
use crate::status::StatusWriter;

// ============================================
// Constants
// ============================================

/// Receive buffer size for the wire socket and the virtual interface.
const RECV_BUF_SIZE: usize = 65536;

// ============================================
// Event
// ============================================

/// One readiness event, reified so the loop body is a single match.
enum Event {
    /// A datagram arrived on the wire socket.
    LinkRead(usize, OuterAddr, Option<PktInfo>),
    /// A frame arrived on the virtual interface.
    VifRead(usize),
    /// The wait deadline expired.
    Timer,
    /// A signal latch was raised.
    Signal,
    /// An I/O error outside the per-peer paths.
    Failed(ServerError),
}

// ============================================
// Server
// ============================================

/// Main Warren server.
///
/// # Lifecycle
/// 1. Create with `Server::new(config)`
/// 2. Start with `server.run().await`
/// 3. Shutdown via TERM/HUP or Ctrl+C
pub struct Server {
    config: ServerConfig,
    factory: Arc<dyn PipelineFactory>,
}

impl Server {
    /// Creates a server with the pass-through (plaintext) pipeline.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            factory: Arc::new(NullPipelineFactory::new()),
        }
    }

    /// Replaces the pipeline factory (cipher stack).
    #[must_use]
    pub fn with_pipeline_factory(mut self, factory: Arc<dyn PipelineFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Runs the server until a terminating signal.
    ///
    /// # Errors
    /// Returns error if startup fails; runtime errors are handled per
    /// peer and never abort the loop.
    pub async fn run(&self) -> Result<()> {
        info!("starting warren-server v{}", env!("CARGO_PKG_VERSION"));

        let engine = Arc::new(MultiEngine::new(
            EngineConfig::from_server_config(&self.config)?,
            Arc::clone(&self.factory),
        )?);

        // Optional pool persistence
        let persist = self
            .config
            .pool
            .persist_file
            .as_ref()
            .map(JsonPoolFile::new);
        if let Some(store) = &persist {
            engine.restore_pool(store);
        }

        let status = self.config.status.file.as_ref().map(|path| {
            StatusWriter::new(
                path,
                self.config.status.version,
                Duration::from_secs(self.config.status.interval_secs),
            )
        });

        let signals = SignalFlags::new();
        signals.install();

        let vif = self.init_vif().await?;

        match self.config.network.proto {
            WireProto::Udp => {
                let link = Arc::new(
                    UdpTransport::bind_addr(self.config.network.listen_addr)
                        .await
                        .map_err(|e| {
                            ServerError::startup_failed(format!("UDP bind failed: {e}"))
                        })?,
                );
                run_engine_udp(Arc::clone(&engine), link, vif, signals, status).await?;
            }
            WireProto::Tcp => {
                let listener = bind_stream_listener(self.config.network.listen_addr)
                    .await
                    .map_err(|e| ServerError::startup_failed(format!("TCP bind failed: {e}")))?;
                run_engine_tcp(Arc::clone(&engine), listener, vif, signals, status).await?;
            }
        }

        if let Some(store) = &persist {
            engine.persist_pool(store);
        }

        info!("server shutdown complete");
        Ok(())
    }

    /// Creates and activates the virtual interface.
    #[cfg(target_os = "linux")]
    async fn init_vif(&self) -> Result<Arc<warren_transport::LinuxVif>> {
        let vif_config = VifConfig::new(&self.config.tunnel.device_name, self.config.tunnel.mode)
            .with_address(self.config.tunnel.gateway_ip)
            .with_mtu(self.config.tunnel.mtu);

        let vif = warren_transport::LinuxVif::create(vif_config)
            .await
            .map_err(|e| ServerError::startup_failed(format!("interface creation failed: {e}")))?;

        vif.up()
            .await
            .map_err(|e| ServerError::startup_failed(format!("interface activation failed: {e}")))?;

        info!(
            "interface '{}' up ({} mode, {})",
            vif.name(),
            self.config.tunnel.mode,
            self.config.tunnel.gateway_ip
        );

        Ok(Arc::new(vif))
    }

    #[cfg(not(target_os = "linux"))]
    async fn init_vif(&self) -> Result<Arc<warren_transport::MockVif>> {
        Err(ServerError::startup_failed(
            "virtual interfaces are only supported on Linux",
        ))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_addr", &self.config.network.listen_addr)
            .field("proto", &self.config.network.proto)
            .field("device", &self.config.tunnel.device_name)
            .finish()
    }
}

// ============================================
// Datagram Event Loop
// ============================================

/// Runs the engine against a datagram transport until drained.
///
/// # Errors
/// Only startup-class failures abort; per-peer errors are absorbed.
pub async fn run_engine_udp<D, V>(
    engine: Arc<MultiEngine>,
    link: Arc<D>,
    vif: Arc<V>,
    signals: Arc<SignalFlags>,
    mut status: Option<StatusWriter>,
) -> Result<()>
where
    D: DatagramTransport + 'static,
    V: VirtualInterface + 'static,
{
    let mut link_buf = vec![0u8; RECV_BUF_SIZE];
    let mut vif_buf = vec![0u8; RECV_BUF_SIZE];

    info!("datagram event loop running");

    loop {
        // Latched signals are honored at the loop top
        if signals.take_term() || signals.take_hup() {
            engine.drain();
            break;
        }
        if signals.take_usr1() {
            info!("soft restart: closing idle instances");
            engine.close_idle();
        }

        let now = Instant::now();
        let deadline = tokio::time::Instant::from_std(engine.deadline(now));
        let link_first = engine.flip_io_order();
        // Hold off the interface while deferred wire output is queued
        let vif_ready = !engine.has_deferred();

        let event = if link_first {
            tokio::select! {
                biased;
                _ = signals.wait() => Event::Signal,
                r = link.recv(&mut link_buf) => into_link_event(r),
                r = vif.read(&mut vif_buf), if vif_ready => into_vif_event(r),
                _ = tokio::time::sleep_until(deadline) => Event::Timer,
            }
        } else {
            tokio::select! {
                biased;
                _ = signals.wait() => Event::Signal,
                r = vif.read(&mut vif_buf), if vif_ready => into_vif_event(r),
                r = link.recv(&mut link_buf) => into_link_event(r),
                _ = tokio::time::sleep_until(deadline) => Event::Timer,
            }
        };

        match event {
            Event::Signal => {}
            Event::LinkRead(len, peer, _pktinfo) => match engine.instance_for(&peer) {
                Ok(inst) => {
                    let out = engine.process_incoming_link(&inst, &link_buf[..len]);
                    perform_udp(&engine, &*link, &*vif, out).await;
                }
                Err(e) if e.is_admission_refusal() => {
                    // The peer gets no response at all
                    debug!("refused {}: {}", peer, e);
                }
                Err(e) => warn!("admission error for {}: {}", peer, e),
            },
            Event::VifRead(len) => {
                let out = engine.process_incoming_vif(&vif_buf[..len]);
                perform_udp(&engine, &*link, &*vif, out).await;
            }
            Event::Timer => {
                let out = engine.process_timeouts(Instant::now());
                perform_udp(&engine, &*link, &*vif, out).await;
            }
            Event::Failed(e) => {
                warn!("transport error: {}", e);
            }
        }

        engine.per_second();
        flush_deferred_udp(&engine, &*link);
        if let Some(writer) = status.as_mut() {
            writer.maybe_write(&engine.status_rows());
        }
    }

    if let Some(writer) = status.as_mut() {
        let _ = writer.write_now(&engine.status_rows());
    }

    info!("datagram event loop stopped");
    Ok(())
}

fn into_link_event(
    r: warren_transport::Result<(usize, OuterAddr, Option<PktInfo>)>,
) -> Event {
    match r {
        Ok((len, peer, pktinfo)) => Event::LinkRead(len, peer, pktinfo),
        Err(e) => Event::Failed(e.into()),
    }
}

fn into_vif_event(r: warren_transport::Result<usize>) -> Event {
    match r {
        Ok(len) => Event::VifRead(len),
        Err(e) => Event::Failed(e.into()),
    }
}

/// Performs the I/O an engine call asked for (datagram mode).
async fn perform_udp<D, V>(engine: &Arc<MultiEngine>, link: &D, vif: &V, out: Dispatch)
where
    D: DatagramTransport,
    V: VirtualInterface,
{
    for frame in out.to_vif {
        if let Err(e) = vif.write(&frame).await {
            debug!("interface write error: {}", e);
        }
    }
    for (inst, frame) in out.to_link {
        send_datagram(engine, link, &inst, frame);
    }
}

/// Sends one wire frame, deferring on a full socket buffer.
fn send_datagram<D: DatagramTransport>(
    engine: &Arc<MultiEngine>,
    link: &D,
    inst: &Arc<ClientInstance>,
    frame: Bytes,
) {
    match link.try_send(&frame, &inst.real) {
        Ok(TrySend::Sent(_)) => {}
        Ok(TrySend::WouldBlock) => {
            match inst.push_deferred(frame, engine.config().tcp_queue_limit) {
                DeferredPush::Queued => engine.mark_deferred(inst),
                DeferredPush::Dropped => {
                    trace!("[{}] deferred queue full, frame dropped", inst.msg_prefix());
                }
                DeferredPush::Overflow => {
                    warn!("[{}] deferred queue overflow", inst.msg_prefix());
                    engine.close_instance(inst, false);
                }
            }
        }
        Err(e) => {
            inst.stats.record_drop();
            debug!("[{}] send error: {}", inst.msg_prefix(), e);
        }
    }
}

/// Drains deferred wire output, FIFO across instances, until the
/// socket blocks again.
fn flush_deferred_udp<D: DatagramTransport>(engine: &Arc<MultiEngine>, link: &D) {
    while let Some(inst) = engine.next_deferred() {
        loop {
            let Some(frame) = inst.pop_deferred() else {
                break;
            };
            match link.try_send(&frame, &inst.real) {
                Ok(TrySend::Sent(_)) => {}
                Ok(TrySend::WouldBlock) => {
                    // Socket still congested; try again next pass
                    inst.unpop_deferred(frame);
                    engine.mark_deferred(&inst);
                    return;
                }
                Err(e) => {
                    inst.stats.record_drop();
                    debug!("[{}] deferred send error: {}", inst.msg_prefix(), e);
                }
            }
        }
    }
}

// ============================================
// Stream Event Loop
// ============================================

/// Runs the engine against a stream listener until drained.
///
/// Each accepted connection gets a driver task owning its socket; all
/// shared state flows through the engine.
///
/// # Errors
/// Only startup-class failures abort.
pub async fn run_engine_tcp<V>(
    engine: Arc<MultiEngine>,
    listener: TcpListener,
    vif: Arc<V>,
    signals: Arc<SignalFlags>,
    mut status: Option<StatusWriter>,
) -> Result<()>
where
    V: VirtualInterface + 'static,
{
    let mut vif_buf = vec![0u8; RECV_BUF_SIZE];

    info!("stream event loop running");

    loop {
        if signals.take_term() || signals.take_hup() {
            engine.drain();
            break;
        }
        if signals.take_usr1() {
            info!("soft restart: closing idle instances");
            engine.close_idle();
        }

        let now = Instant::now();
        let deadline = tokio::time::Instant::from_std(engine.deadline(now));

        tokio::select! {
            biased;
            _ = signals.wait() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let peer = OuterAddr::Ip(peer_addr);
                    match engine.instance_for(&peer) {
                        Ok(inst) => match TcpLink::new(stream, MAX_FRAME_SIZE) {
                            Ok(tcp) => {
                                tokio::spawn(drive_stream(
                                    Arc::clone(&engine),
                                    inst,
                                    tcp,
                                    Arc::clone(&vif),
                                ));
                            }
                            Err(e) => warn!("link setup failed for {}: {}", peer, e),
                        },
                        Err(e) if e.is_admission_refusal() => {
                            // Dropping the stream refuses the peer
                            debug!("refused {}: {}", peer, e);
                        }
                        Err(e) => warn!("admission error for {}: {}", peer, e),
                    }
                }
                Err(e) => warn!("accept error: {}", e),
            },
            r = vif.read(&mut vif_buf) => match r {
                Ok(len) => {
                    let out = engine.process_incoming_vif(&vif_buf[..len]);
                    perform_stream(&engine, &*vif, out).await;
                }
                Err(e) => warn!("interface read error: {}", e),
            },
            _ = tokio::time::sleep_until(deadline) => {
                let out = engine.process_timeouts(Instant::now());
                perform_stream(&engine, &*vif, out).await;
            }
        }

        engine.per_second();
        if let Some(writer) = status.as_mut() {
            writer.maybe_write(&engine.status_rows());
        }
    }

    if let Some(writer) = status.as_mut() {
        let _ = writer.write_now(&engine.status_rows());
    }

    info!("stream event loop stopped");
    Ok(())
}

/// Performs the I/O an engine call asked for (stream mode): interface
/// writes happen here, wire frames queue on the owning drivers.
async fn perform_stream<V: VirtualInterface>(engine: &Arc<MultiEngine>, vif: &V, out: Dispatch) {
    for frame in out.to_vif {
        if let Err(e) = vif.write(&frame).await {
            debug!("interface write error: {}", e);
        }
    }
    for (inst, frame) in out.to_link {
        queue_stream_frame(engine, &inst, frame);
    }
}

/// Hands a wire frame to a stream driver through its deferred queue.
fn queue_stream_frame(engine: &Arc<MultiEngine>, inst: &Arc<ClientInstance>, frame: Bytes) {
    match inst.push_deferred(frame, engine.config().tcp_queue_limit) {
        DeferredPush::Queued => {}
        DeferredPush::Dropped => {
            trace!("[{}] stream queue full, frame dropped", inst.msg_prefix());
        }
        DeferredPush::Overflow => {
            warn!("[{}] stream queue overflow", inst.msg_prefix());
            engine.close_instance(inst, false);
        }
    }
}

/// Drives one accepted stream connection: framed reads into the
/// engine, deferred-queue drains onto the socket.
async fn drive_stream<V: VirtualInterface>(
    engine: Arc<MultiEngine>,
    inst: Arc<ClientInstance>,
    mut link: TcpLink,
    vif: Arc<V>,
) {
    debug!("[{}] stream driver started", inst.msg_prefix());

    loop {
        if inst.is_halted() {
            break;
        }

        tokio::select! {
            r = link.read_frame() => match r {
                Ok(Some(frame)) => {
                    let out = engine.process_incoming_link(&inst, &frame);
                    perform_stream(&engine, &*vif, out).await;
                }
                Ok(None) => {
                    info!("[{}] peer disconnected", inst.msg_prefix());
                    engine.close_instance(&inst, false);
                    break;
                }
                Err(e) => {
                    if e.is_peer_fatal() {
                        info!("[{}] stream reset: {}", inst.msg_prefix(), e);
                    } else {
                        warn!("[{}] stream error: {}", inst.msg_prefix(), e);
                    }
                    engine.close_instance(&inst, false);
                    break;
                }
            },
            _ = inst.outbound_ready() => {}
        }

        // Drain queued wire output now that the socket is free
        if let Err(e) = flush_stream_outbound(&inst, &mut link).await {
            if e.is_peer_fatal() {
                info!("[{}] stream reset on write: {}", inst.msg_prefix(), e);
            } else {
                warn!("[{}] stream write error: {}", inst.msg_prefix(), e);
            }
            engine.close_instance(&inst, false);
            break;
        }
    }

    debug!("[{}] stream driver stopped", inst.msg_prefix());
}

/// Writes every queued frame, parking on writability as needed.
async fn flush_stream_outbound(
    inst: &Arc<ClientInstance>,
    link: &mut TcpLink,
) -> warren_transport::Result<()> {
    link.flush_pending().await?;

    while let Some(frame) = inst.pop_deferred() {
        loop {
            match link.try_send_frame(&frame)? {
                SendStatus::Sent => {
                    link.flush_pending().await?;
                    break;
                }
                SendStatus::Blocked => {
                    link.writable().await?;
                }
            }
        }
    }
    Ok(())
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::time::timeout;
    use warren_core::frame::TunnelKind;
    use warren_transport::MockVif;

    const WAIT: Duration = Duration::from_millis(500);

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[9] = 17;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    struct Harness {
        engine: Arc<MultiEngine>,
        server_addr: OuterAddr,
        vif: Arc<MockVif>,
        signals: Arc<SignalFlags>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start_harness(tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
        let mut config = EngineConfig {
            enable_c2c: true,
            ..EngineConfig::default()
        };
        tweak(&mut config);

        let engine = Arc::new(
            MultiEngine::new(config, Arc::new(NullPipelineFactory::new())).unwrap(),
        );
        let link = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        let server_addr = link.local_addr().unwrap();
        let vif = Arc::new(MockVif::new(VifConfig::new("mock0", TunnelKind::Tun)));
        vif.up().await.unwrap();
        let signals = SignalFlags::new();

        let task = tokio::spawn(run_engine_udp(
            Arc::clone(&engine),
            link,
            Arc::clone(&vif),
            Arc::clone(&signals),
            None,
        ));

        Harness {
            engine,
            server_addr,
            vif,
            signals,
            task,
        }
    }

    async fn recv_from(client: &UdpTransport) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (len, _, _) = timeout(WAIT, client.recv(&mut buf)).await.unwrap().unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn test_unknown_destination_reaches_interface() {
        let h = start_harness(|_| {}).await;
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let packet = ipv4_packet([10, 8, 0, 6], [192, 0, 2, 99]);
        client.send(&packet, &h.server_addr).await.unwrap();

        // The frame lands on the virtual interface
        timeout(WAIT, async {
            while h.vif.outbound_len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let written = h.vif.drain_outbound();
        assert_eq!(written[0], packet);

        h.signals.raise_term();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interface_frame_routed_back_to_peer() {
        let h = start_harness(|_| {}).await;
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        // Teach the engine where 10.8.0.6 lives
        let hello = ipv4_packet([10, 8, 0, 6], [10, 8, 0, 1]);
        client.send(&hello, &h.server_addr).await.unwrap();

        timeout(WAIT, async {
            while h.engine.counts().instances == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A frame from the interface for that address reaches the peer
        let reply = ipv4_packet([192, 0, 2, 50], [10, 8, 0, 6]);
        h.vif.queue_inbound(reply.clone());

        assert_eq!(recv_from(&client).await, reply);

        h.signals.raise_term();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_c2c_round_trip_between_clients() {
        let h = start_harness(|_| {}).await;
        let client_a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        // Both peers announce themselves
        client_b
            .send(&ipv4_packet([10, 8, 0, 10], [10, 8, 0, 1]), &h.server_addr)
            .await
            .unwrap();
        client_a
            .send(&ipv4_packet([10, 8, 0, 6], [10, 8, 0, 1]), &h.server_addr)
            .await
            .unwrap();

        timeout(WAIT, async {
            while h.engine.counts().instances < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A -> B crosses inside the server, not the interface
        h.vif.reset();
        let packet = ipv4_packet([10, 8, 0, 6], [10, 8, 0, 10]);
        client_a.send(&packet, &h.server_addr).await.unwrap();

        assert_eq!(recv_from(&client_b).await, packet);
        assert_eq!(h.vif.outbound_len(), 0);

        h.signals.raise_term();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_term_drains_and_stops() {
        let h = start_harness(|_| {}).await;
        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        client
            .send(&ipv4_packet([10, 8, 0, 6], [10, 8, 0, 1]), &h.server_addr)
            .await
            .unwrap();

        timeout(WAIT, async {
            while h.engine.counts().instances == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.signals.raise_term();
        timeout(WAIT, h.task).await.unwrap().unwrap().unwrap();

        let counts = h.engine.counts();
        assert_eq!(counts.instances, 0);
        assert_eq!(counts.scheduled, 0);
        assert_eq!(counts.pool_outstanding, 0);
    }

    #[tokio::test]
    async fn test_max_clients_refused_silently() {
        let h = start_harness(|c| c.max_clients = 1).await;
        let client_a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        client_a
            .send(&ipv4_packet([10, 8, 0, 6], [10, 8, 0, 1]), &h.server_addr)
            .await
            .unwrap();
        timeout(WAIT, async {
            while h.engine.counts().instances == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client_b
            .send(&ipv4_packet([10, 8, 0, 10], [10, 8, 0, 1]), &h.server_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still exactly one instance, one pool assignment
        let counts = h.engine.counts();
        assert_eq!(counts.instances, 1);
        assert_eq!(counts.pool_outstanding, 1);

        h.signals.raise_term();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stream_mode_round_trip() {
        let mut config = EngineConfig {
            enable_c2c: true,
            ..EngineConfig::default()
        };
        config.tcp_queue_limit = 8;

        let engine = Arc::new(
            MultiEngine::new(config, Arc::new(NullPipelineFactory::new())).unwrap(),
        );
        let listener = bind_stream_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr: SocketAddr = listener.local_addr().unwrap();
        let vif = Arc::new(MockVif::new(VifConfig::new("mock0", TunnelKind::Tun)));
        vif.up().await.unwrap();
        let signals = SignalFlags::new();

        let task = tokio::spawn(run_engine_tcp(
            Arc::clone(&engine),
            listener,
            Arc::clone(&vif),
            Arc::clone(&signals),
            None,
        ));

        // Client connects and sends one framed record
        let mut client = tokio::net::TcpStream::connect(server_addr).await.unwrap();
        let packet = ipv4_packet([10, 8, 0, 6], [192, 0, 2, 1]);
        let framed = warren_core::codec::encode_frame(&packet).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &framed)
            .await
            .unwrap();

        timeout(WAIT, async {
            while vif.outbound_len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(vif.drain_outbound()[0], packet);

        // A frame from the interface comes back framed on the stream
        let reply = ipv4_packet([192, 0, 2, 1], [10, 8, 0, 6]);
        vif.queue_inbound(reply.clone());

        let mut buf = vec![0u8; 2 + reply.len()];
        timeout(WAIT, tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..2], &(reply.len() as u16).to_be_bytes());
        assert_eq!(&buf[2..], &reply[..]);

        signals.raise_term();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(engine.counts().instances, 0);
    }
}
