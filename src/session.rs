//! Session wiring.
//!
//! A session owns the full data plane for one tunnel endpoint: the
//! transport endpoint(s), one FEC engine per direction, the two deadline
//! queues, the pacer and the firewall scope. It spawns one task per logical
//! flow and tears everything down on shutdown, removing its firewall rules
//! last.
//!
//! Egress: `send` → send queue → FEC encode → seal → pace → endpoint.
//! Ingress: endpoint → open → FEC decode → recv queue → `recv`.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Mode, Role, TunnelConfig};
use crate::crypto::{PacketCipher, PacketKey, SEAL_OVERHEAD};
use crate::error::{Error, Result};
use crate::faketcp::{
    Dispatcher, Endpoint, FakeTcpConn, NewPeer, RawEndpoint, UdpEndpoint, HANDSHAKE_TIMEOUT,
    KEEPALIVE_INTERVAL,
};
use crate::fec::{BlockDecoder, BlockEncoder, FecParams, Shard};
use crate::firewall::{FirewallGuard, IptablesRunner};
use crate::mtu::{payload_budget, MtuProber};
use crate::pacing::Pacer;
use crate::queue::DeadlineQueue;
use crate::rawsock::{RawSocket, IPV4_HEADER_LEN, TCP_HEADER_LEN};
use crate::wire::{control, Frame, SHARD_HEADER_SIZE};

/// Partial FEC blocks flush after this long, matching the queue deadline.
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Granularity of the egress loop's flush checks.
const FLUSH_POLL: Duration = Duration::from_millis(50);

/// First retry delay after a transient I/O failure.
const RETRY_INITIAL: Duration = Duration::from_millis(10);

/// Retries back off exponentially up to this bound, then give up.
const RETRY_MAX: Duration = Duration::from_secs(1);

/// Session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Sealed packets handed to the endpoint
    pub tx_packets: AtomicU64,
    /// Packets received and opened successfully
    pub rx_packets: AtomicU64,
    /// Packets dropped at open/decode (bad tag, malformed frame)
    pub open_failures: AtomicU64,
    /// Decoded packets dropped because the receive queue pushed back
    pub recv_drops: AtomicU64,
    /// Keepalives sent
    pub keepalives: AtomicU64,
}

/// Handles every spawned flow needs.
#[derive(Clone)]
struct Shared {
    role: Role,
    cipher: Arc<PacketCipher>,
    send_queue: Arc<DeadlineQueue>,
    recv_queue: Arc<DeadlineQueue>,
    stats: Arc<SessionStats>,
    last_rx: Arc<Mutex<Instant>>,
    shutdown_rx: watch::Receiver<bool>,
    /// Latest usable endpoint; servers repoint it on accept, and a dead
    /// endpoint is cleared so egress stops aiming at it.
    active: Arc<watch::Sender<Option<Arc<Endpoint>>>>,
    /// Sizes echoed back by the peer's MTU responder.
    echo_tx: Arc<watch::Sender<Option<u16>>>,
}

/// One tunnel endpoint's data plane.
pub struct Session {
    send_queue: Arc<DeadlineQueue>,
    recv_queue: Arc<DeadlineQueue>,
    stats: Arc<SessionStats>,
    firewall: Option<Arc<FirewallGuard>>,
    shutdown_tx: watch::Sender<bool>,
    active: Arc<watch::Sender<Option<Arc<Endpoint>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start a client session: install the firewall scope, open the
    /// transport, complete the handshake, discover the path MTU and spawn
    /// the flows.
    pub async fn connect(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        if config.role != Role::Client {
            return Err(Error::config("connect requires role = client"));
        }

        let mut builder = SessionBuilder::new(&config);
        match connect_flows(&mut builder, &config).await {
            Ok(()) => Ok(builder.finish()),
            Err(e) => {
                builder.teardown().await;
                Err(e)
            }
        }
    }

    /// Start a server session: install the firewall scope, bind the
    /// transport and accept peers as they handshake.
    pub async fn serve(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        if config.role != Role::Server {
            return Err(Error::config("serve requires role = server"));
        }

        let mut builder = SessionBuilder::new(&config);
        match serve_flows(&mut builder, &config).await {
            Ok(()) => Ok(builder.finish()),
            Err(e) => {
                builder.teardown().await;
                Err(e)
            }
        }
    }

    /// Queue one IP packet for the tunnel.
    ///
    /// Fails with [`Error::Backpressure`] when the send queue is full after
    /// its deadline sweep.
    pub fn send(&self, ip_packet: Bytes) -> Result<()> {
        self.send_queue.push(ip_packet)
    }

    /// Receive the next IP packet from the tunnel.
    ///
    /// Resolves to `None` once the session is shut down.
    pub async fn recv(&self) -> Option<Bytes> {
        self.recv_queue.pop().await
    }

    /// Session counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Depths of the send and receive queues.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.send_queue.depth(), self.recv_queue.depth())
    }

    /// Stop every flow, notify the peer and remove firewall rules.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.send_queue.close();
        self.recv_queue.close();

        let active = self.active.borrow().clone();
        if let Some(endpoint) = active {
            if let Err(e) = endpoint.close().await {
                tracing::debug!(error = %e, "endpoint close failed");
            }
        }

        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }

        // Nothing may outlive the firewall cleanup.
        if let Some(firewall) = self.firewall {
            firewall.remove_all()?;
        }
        Ok(())
    }
}

async fn connect_flows(builder: &mut SessionBuilder, config: &TunnelConfig) -> Result<()> {
    let remote = config.require_remote()?;

    let endpoint = match config.mode {
        Mode::Udp => {
            let ep = UdpEndpoint::bind(config.local_addr, Some(remote)).await?;
            Arc::new(Endpoint::Udp(ep))
        }
        Mode::Raw => {
            builder.install_firewall(config, Some(remote))?;
            let sock = Arc::new(RawSocket::open(config.local_addr, false)?);
            let (dispatcher, _accepts) = Dispatcher::new(sock, config.local_addr, false);

            let conn = Arc::new(FakeTcpConn::client(config.local_addr, remote));
            let inbound = dispatcher.register(conn.clone());

            builder.spawn_dispatcher(dispatcher.clone());
            handshake(&dispatcher, &conn).await?;

            Arc::new(Endpoint::Raw(RawEndpoint::new(dispatcher, conn, inbound)))
        }
    };

    builder.set_active(endpoint.clone());
    builder.spawn_ingress(endpoint.clone(), config);

    // Probe the path before fixing the shard size; the ingress flow is
    // already answering and routing echo frames.
    let budget = if config.mode == Mode::Raw {
        let shared = builder.shared();
        let mut prober = MtuProber::new();
        let path_mtu = prober
            .discover(|size| probe_once(endpoint.clone(), shared.clone(), size))
            .await;
        tracing::info!(path_mtu, budget = payload_budget(path_mtu), "mtu discovery done");
        payload_budget(path_mtu)
    } else {
        payload_budget(config.mtu)
    };

    builder.spawn_egress(config, budget)?;
    builder.spawn_keepalive(config, None);
    Ok(())
}

async fn serve_flows(builder: &mut SessionBuilder, config: &TunnelConfig) -> Result<()> {
    match config.mode {
        Mode::Udp => {
            let ep = UdpEndpoint::bind(config.local_addr, None).await?;
            let endpoint = Arc::new(Endpoint::Udp(ep));
            builder.set_active(endpoint.clone());
            builder.spawn_ingress(endpoint, config);
            builder.spawn_keepalive(config, None);
        }
        Mode::Raw => {
            builder.install_firewall(config, None)?;
            let sock = Arc::new(RawSocket::open(config.local_addr, true)?);
            let (dispatcher, accepts) = Dispatcher::new(sock, config.local_addr, true);

            builder.spawn_dispatcher(dispatcher.clone());
            builder.spawn_acceptor(dispatcher.clone(), accepts, config);
            builder.spawn_keepalive(config, Some(dispatcher));
        }
    }

    builder.spawn_egress(config, payload_budget(config.mtu))?;
    Ok(())
}

struct SessionBuilder {
    shared: Shared,
    shutdown_tx: watch::Sender<bool>,
    firewall: Option<Arc<FirewallGuard>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionBuilder {
    fn new(config: &TunnelConfig) -> Self {
        let key = PacketKey::derive(&config.key);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (active_tx, _) = watch::channel(None);
        let (echo_tx, _) = watch::channel(None);

        let shared = Shared {
            role: config.role,
            cipher: Arc::new(PacketCipher::new(&key)),
            send_queue: Arc::new(DeadlineQueue::with_capacity(config.send_queue_size)),
            recv_queue: Arc::new(DeadlineQueue::with_capacity(config.recv_queue_size)),
            stats: Arc::new(SessionStats::default()),
            last_rx: Arc::new(Mutex::new(Instant::now())),
            shutdown_rx,
            active: Arc::new(active_tx),
            echo_tx: Arc::new(echo_tx),
        };

        Self {
            shared,
            shutdown_tx,
            firewall: None,
            tasks: Vec::new(),
        }
    }

    fn shared(&self) -> Arc<Shared> {
        Arc::new(self.shared.clone())
    }

    fn set_active(&self, endpoint: Arc<Endpoint>) {
        // send_replace: must take effect even before any flow subscribes.
        self.shared.active.send_replace(Some(endpoint));
    }

    /// Install the RST-suppression scope. Clients also pin the 4-tuple.
    fn install_firewall(
        &mut self,
        config: &TunnelConfig,
        remote: Option<SocketAddrV4>,
    ) -> Result<()> {
        let guard = Arc::new(FirewallGuard::new(Arc::new(IptablesRunner))?);
        guard.clear_stale(config.local_addr.port());
        guard.install(config.local_addr.port(), config.role)?;
        if let Some(remote) = remote {
            guard.install_tuple(
                *config.local_addr.ip(),
                config.local_addr.port(),
                *remote.ip(),
                remote.port(),
            )?;
        }
        self.firewall = Some(guard);
        Ok(())
    }

    fn spawn_dispatcher(&mut self, dispatcher: Arc<Dispatcher>) {
        let mut shutdown_rx = self.shared.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                result = dispatcher.run() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "dispatcher stopped");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }));
    }

    fn spawn_acceptor(
        &mut self,
        dispatcher: Arc<Dispatcher>,
        mut accepts: mpsc::Receiver<NewPeer>,
        config: &TunnelConfig,
    ) {
        let shared = self.shared();
        let config = config.clone();

        self.tasks.push(tokio::spawn(async move {
            while let Some(NewPeer { conn, inbound }) = accepts.recv().await {
                let endpoint = Arc::new(Endpoint::Raw(RawEndpoint::new(
                    dispatcher.clone(),
                    conn,
                    inbound,
                )));

                // Point-to-point: the most recent peer carries egress.
                shared.active.send_replace(Some(endpoint.clone()));

                // Ingress flows exit on their own when the session shuts
                // down or their endpoint closes.
                spawn_ingress_task(endpoint, shared.clone(), &config);
            }
        }));
    }

    fn spawn_ingress(&mut self, endpoint: Arc<Endpoint>, config: &TunnelConfig) {
        let task = spawn_ingress_task(endpoint, self.shared(), config);
        self.tasks.push(task);
    }

    fn spawn_egress(&mut self, config: &TunnelConfig, budget: u16) -> Result<()> {
        let max_shard = (budget as usize)
            .saturating_sub(SHARD_HEADER_SIZE)
            .min(config.faketcp_max_segment);
        let params = FecParams::new(
            config.fec_data as usize,
            config.fec_parity as usize,
            max_shard,
        )?;
        let encoder = BlockEncoder::new(params)?;
        let pacer = Pacer::new(config.faketcp_pacing_us);
        let shared = self.shared();

        self.tasks.push(tokio::spawn(async move {
            egress_loop(shared, encoder, pacer).await;
        }));
        Ok(())
    }

    fn spawn_keepalive(&mut self, config: &TunnelConfig, dispatcher: Option<Arc<Dispatcher>>) {
        let shared = self.shared();
        let idle_limit = config.idle_timeout();

        self.tasks.push(tokio::spawn(async move {
            keepalive_loop(shared, idle_limit, dispatcher).await;
        }));
    }

    /// Abort whatever was started and drop the firewall scope. Used when
    /// session construction fails partway.
    async fn teardown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        if let Some(firewall) = self.firewall {
            if let Err(e) = firewall.remove_all() {
                tracing::warn!(error = %e, "firewall cleanup after failed start");
            }
        }
    }

    fn finish(self) -> Session {
        Session {
            send_queue: self.shared.send_queue.clone(),
            recv_queue: self.shared.recv_queue.clone(),
            stats: self.shared.stats.clone(),
            firewall: self.firewall,
            shutdown_tx: self.shutdown_tx,
            active: self.shared.active.clone(),
            tasks: self.tasks,
        }
    }
}

/// Send the SYN and wait for the handshake, retrying lost opens.
async fn handshake(dispatcher: &Arc<Dispatcher>, conn: &Arc<FakeTcpConn>) -> Result<()> {
    const ATTEMPTS: u32 = 3;
    let per_attempt = HANDSHAKE_TIMEOUT / ATTEMPTS;

    for attempt in 1..=ATTEMPTS {
        let syn = conn.open_segment()?;
        dispatcher.send_segment(conn, &syn).await?;

        match conn.wait_established(per_attempt).await {
            Ok(()) => return Ok(()),
            Err(Error::Timeout(_)) if attempt < ATTEMPTS => {
                tracing::debug!(attempt, "handshake attempt timed out, resending SYN");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))
}

/// One MTU probe: emit a padded echo request, wait for the matching reply.
async fn probe_once(endpoint: Arc<Endpoint>, shared: Arc<Shared>, size: u16) -> bool {
    let outer_overhead = IPV4_HEADER_LEN + TCP_HEADER_LEN + SEAL_OVERHEAD;
    let plaintext_len = (size as usize).saturating_sub(outer_overhead);
    // kind + subtype + echoed size
    let pad = plaintext_len.saturating_sub(4);

    let mut body = Vec::with_capacity(2 + pad);
    body.extend_from_slice(&size.to_be_bytes());
    body.resize(2 + pad, 0);

    let frame = Frame::Control {
        subtype: control::MTU_ECHO_REQUEST,
        body: body.into(),
    };
    let Ok(sealed) = shared.cipher.seal(&frame.encode()) else {
        return false;
    };

    // Subscribe before sending so a fast reply cannot slip past.
    let mut echo_rx = shared.echo_tx.subscribe();

    if endpoint.write_packet(&sealed).await.is_err() {
        return false;
    }

    loop {
        if echo_rx.changed().await.is_err() {
            return false;
        }
        if *echo_rx.borrow() == Some(size) {
            return true;
        }
    }
}

fn spawn_ingress_task(
    endpoint: Arc<Endpoint>,
    shared: Arc<Shared>,
    config: &TunnelConfig,
) -> JoinHandle<()> {
    // Shard sizes are sender-chosen; bound them by the wire maximum rather
    // than the local budget.
    let params = FecParams::new(
        config.fec_data as usize,
        config.fec_parity as usize,
        crate::mtu::MAX_MTU as usize,
    )
    .expect("config was validated");
    let decoder = BlockDecoder::new(params).expect("config was validated");

    tokio::spawn(async move {
        ingress_loop(endpoint, shared, decoder).await;
    })
}

async fn ingress_loop(endpoint: Arc<Endpoint>, shared: Arc<Shared>, mut decoder: BlockDecoder) {
    let mut shutdown_rx = shared.shutdown_rx.clone();
    let mut retry_delay = RETRY_INITIAL;

    loop {
        let packet = tokio::select! {
            _ = shutdown_rx.changed() => return,
            result = endpoint.read_packet() => match result {
                Ok(packet) => {
                    retry_delay = RETRY_INITIAL;
                    packet
                }
                Err(Error::Closed) => return,
                Err(Error::Io(e)) => {
                    if retry_delay > RETRY_MAX {
                        tracing::error!(error = %e, "ingress read retries exhausted");
                        return;
                    }
                    tracing::debug!(error = %e, "ingress read failed, backing off");
                    tokio::time::sleep(retry_delay).await;
                    retry_delay *= 2;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ingress read failed");
                    return;
                }
            },
        };

        let plaintext = match shared.cipher.open(&packet) {
            Ok(p) => p,
            Err(_) => {
                shared.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let frame = match Frame::decode(Bytes::from(plaintext)) {
            Ok(f) => f,
            Err(_) => {
                shared.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        *shared.last_rx.lock() = Instant::now();
        shared.stats.rx_packets.fetch_add(1, Ordering::Relaxed);

        match frame {
            Frame::Data {
                block_id,
                shard_index,
                total_data,
                total_parity,
                payload,
            } => {
                let shard = Shard {
                    block_id,
                    index: shard_index,
                    total_data,
                    total_parity,
                    data: payload.to_vec(),
                };
                match decoder.push(shard) {
                    Ok(Some(block)) => deliver_block(&shared, &block),
                    Ok(None) => {}
                    // Logged and the slot closed; the next block proceeds.
                    Err(Error::FecUnrecoverable) => {}
                    Err(_) => {
                        shared.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Frame::Keepalive => {}
            Frame::Control { subtype, body } => {
                handle_control(&endpoint, &shared, subtype, body).await;
            }
        }
    }
}

/// Split a decoded block into IP packets and queue them.
///
/// The block tail is zero padding; an IPv4 packet is self-describing via
/// its total-length field, so packets are peeled off until the version
/// nibble stops reading 4.
fn deliver_block(shared: &Shared, block: &[u8]) {
    for packet in split_ipv4_packets(block) {
        if shared.recv_queue.push(packet).is_err() {
            shared.stats.recv_drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn split_ipv4_packets(block: &[u8]) -> Vec<Bytes> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset + IPV4_HEADER_LEN <= block.len() {
        if block[offset] >> 4 != 4 {
            break;
        }
        let total = usize::from(u16::from_be_bytes([block[offset + 2], block[offset + 3]]));
        if total < IPV4_HEADER_LEN || offset + total > block.len() {
            break;
        }
        packets.push(Bytes::copy_from_slice(&block[offset..offset + total]));
        offset += total;
    }

    packets
}

async fn handle_control(endpoint: &Arc<Endpoint>, shared: &Shared, subtype: u8, body: Bytes) {
    match subtype {
        control::MTU_ECHO_REQUEST if body.len() >= 2 => {
            let size = u16::from_be_bytes([body[0], body[1]]);
            let reply = Frame::Control {
                subtype: control::MTU_ECHO_REPLY,
                body: Bytes::copy_from_slice(&size.to_be_bytes()),
            };
            if let Ok(sealed) = shared.cipher.seal(&reply.encode()) {
                if let Err(e) = endpoint.write_packet(&sealed).await {
                    tracing::debug!(error = %e, "echo reply failed");
                }
            }
        }
        control::MTU_ECHO_REPLY if body.len() >= 2 => {
            let size = u16::from_be_bytes([body[0], body[1]]);
            shared.echo_tx.send_replace(Some(size));
        }
        control::FIN_NOTICE => {
            tracing::info!("peer announced shutdown");
            shared.send_queue.close();
            shared.recv_queue.close();
        }
        _ => {
            shared.stats.open_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn egress_loop(shared: Arc<Shared>, mut encoder: BlockEncoder, mut pacer: Pacer) {
    let shutdown_rx = shared.shutdown_rx.clone();

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match tokio::time::timeout(FLUSH_POLL, shared.send_queue.pop()).await {
            Ok(Some(packet)) => {
                match encoder.push(&packet) {
                    Ok(Some(block)) => {
                        if !emit_block(&shared, &mut pacer, block).await {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Oversized datagram; the tunnel never fragments.
                        tracing::warn!(error = %e, "dropped oversized packet");
                        continue;
                    }
                }
                if encoder.is_full() {
                    if let Some(block) = encoder.flush() {
                        if !emit_block(&shared, &mut pacer, block).await {
                            return;
                        }
                    }
                }
            }
            Ok(None) => return, // queue closed
            Err(_elapsed) => {}
        }

        // A partial block must not sit past the queue deadline.
        if encoder.flush_due(FLUSH_INTERVAL) {
            if let Some(block) = encoder.flush() {
                if !emit_block(&shared, &mut pacer, block).await {
                    return;
                }
            }
        }
    }
}

/// Seal and transmit every shard of a block. Returns false when the
/// egress flow should stop.
async fn emit_block(shared: &Shared, pacer: &mut Pacer, block: Vec<Shard>) -> bool {
    let active = shared.active.borrow().clone();
    let Some(endpoint) = active else {
        // No peer yet; the block is lost, which the FEC layer tolerates.
        tracing::trace!("dropping block: no active endpoint");
        return true;
    };

    for shard in block {
        let frame = Frame::Data {
            block_id: shard.block_id,
            shard_index: shard.index,
            total_data: shard.total_data,
            total_parity: shard.total_parity,
            payload: Bytes::from(shard.data),
        };
        let sealed = match shared.cipher.seal(&frame.encode()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "seal failed");
                return false;
            }
        };

        pacer.pace(shared.send_queue.depth()).await;

        if !send_with_retry(&endpoint, &sealed).await {
            return fail_endpoint(shared, &endpoint).await;
        }
        shared.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
    }
    true
}

/// Close a connection whose sends keep failing. Servers survive and wait
/// for the peer to reconnect; for a client the session is over.
async fn fail_endpoint(shared: &Shared, endpoint: &Arc<Endpoint>) -> bool {
    tracing::warn!("closing connection after send failures");
    if let Err(e) = endpoint.close().await {
        tracing::debug!(error = %e, "close after send failure");
    }

    shared.active.send_if_modified(|current| {
        if current
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, endpoint))
        {
            *current = None;
            true
        } else {
            false
        }
    });

    match shared.role {
        Role::Client => {
            shared.send_queue.close();
            shared.recv_queue.close();
            false
        }
        Role::Server => true,
    }
}

/// Retry transient I/O errors with exponential backoff up to one second.
async fn send_with_retry(endpoint: &Endpoint, packet: &[u8]) -> bool {
    let mut delay = RETRY_INITIAL;
    loop {
        match endpoint.write_packet(packet).await {
            Ok(()) => return true,
            Err(Error::Io(e)) => {
                if delay > RETRY_MAX {
                    tracing::warn!(error = %e, "send retries exhausted");
                    return false;
                }
                tracing::debug!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "send failed, backing off"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                tracing::warn!(error = %e, "send failed");
                return false;
            }
        }
    }
}

async fn keepalive_loop(
    shared: Arc<Shared>,
    idle_limit: Duration,
    dispatcher: Option<Arc<Dispatcher>>,
) {
    let mut shutdown_rx = shared.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {}
        }

        // Server side: FIN and forget connections that went quiet.
        if let Some(dispatcher) = &dispatcher {
            for (conn, fin) in dispatcher.reap_idle(idle_limit) {
                if let Err(e) = dispatcher.send_segment(&conn, &fin).await {
                    tracing::debug!(error = %e, "fin for idle peer failed");
                }
                shared.active.send_if_modified(|current| {
                    let is_reaped = current.as_ref().is_some_and(|active| {
                        active.peer_addr() == Some(conn.peer())
                    });
                    if is_reaped {
                        *current = None;
                        true
                    } else {
                        false
                    }
                });
            }
        } else if shared.role == Role::Client && shared.last_rx.lock().elapsed() >= idle_limit {
            tracing::info!("idle limit exceeded, closing session flows");
            shared.send_queue.close();
            shared.recv_queue.close();
            return;
        }

        let active = shared.active.borrow().clone();
        let Some(endpoint) = active else {
            continue;
        };
        if let Ok(sealed) = shared.cipher.seal(&Frame::Keepalive.encode()) {
            match endpoint.write_packet(&sealed).await {
                Ok(()) => {
                    shared.stats.keepalives.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "keepalive send failed");
                }
            }
        }
    }
}
