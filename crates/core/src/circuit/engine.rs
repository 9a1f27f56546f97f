use super::behavior::{CircuitBehavior, Disposition};
use super::crypto::{Aes128Ctr, DigestState};
use super::handshake::{begin_handshake, complete_handshake, OnionSkinSealer, PendingHandshake};
use super::relay::{build_relay, verify_digest, DestroyReason, EndReason, ExtendPayload, RelayCell, RelayCommand};
use super::state::StateWatch;
use super::stream::{begin_payload, Disconnect, StreamEvents, StreamTable, StreamTarget};
use super::types::{CircuitId, CircuitState, Hop, IdAllocator};
use crate::transport::{Cell, CellCommand, CellSink, RouterDirectory};
use ctr::cipher::StreamCipher;
use onioncell_common::config::cell::{PAYLOAD_LEN, RELAY_DATA_MAX};
use onioncell_common::config::crypto::REND_COOKIE_LEN;
use onioncell_common::flow::{CIRCUIT_WINDOW_INCREMENT, CIRCUIT_WINDOW_START, SENDME_THRESHOLD};
use onioncell_common::{ClientConfig, OnionError, Result, RouterDescriptor, TruncatePolicy};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

/// Everything that changes while the circuit runs; guarded by one lock
struct CircuitInner {
    hops: Vec<Hop>,
    pending: Option<PendingHandshake>,
    to_build: VecDeque<RouterDescriptor>,
    streams: StreamTable,
    send_window: u32,
    receive_window: u32,
    cells_sent: u64,
    bytes_sent: u64,
    cells_received: u64,
    rendezvous_cookie: Option<[u8; REND_COOKIE_LEN]>,
    build_epoch: u64,
    failed_build: Option<FailedBuild>,
}

/// A create or extend that was cut short by TRUNCATED
struct FailedBuild {
    epoch: u64,
    hop: usize,
    reason: String,
}

/// Point-in-time counters for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub hops: usize,
    pub streams: usize,
    pub cells_sent: u64,
    pub bytes_sent: u64,
    pub cells_received: u64,
    pub send_window: u32,
    pub receive_window: u32,
}

/// Result of peeling inbound layers until a hop recognised the cell
struct Recognized {
    hop: usize,
    ciphers: Vec<Aes128Ctr>,
    digest: DigestState,
}

/// Wrap `cell` in one layer per hop, last hop innermost.
///
/// Works on clones; the advanced ciphers come back in hop order.
fn onion_encrypt(hops: &[Hop], cell: &mut [u8]) -> Vec<Aes128Ctr> {
    let mut ciphers: Vec<Aes128Ctr> = hops.iter().map(|hop| hop.crypto.forward_cipher.clone()).collect();
    for cipher in ciphers.iter_mut().rev() {
        cipher.apply_keystream(cell);
    }
    ciphers
}

/// Peel layers from hop 0 outward and check each hop's digest.
///
/// Nothing in `hops` is touched; `None` means no hop claimed the cell.
fn onion_decrypt(hops: &[Hop], cell: &mut [u8]) -> Option<Recognized> {
    let mut ciphers = Vec::with_capacity(hops.len());
    for (index, hop) in hops.iter().enumerate() {
        let mut cipher = hop.crypto.backward_cipher.clone();
        cipher.apply_keystream(cell);
        ciphers.push(cipher);

        if let Some(digest) = verify_digest(&hop.crypto.backward_digest, cell) {
            return Some(Recognized {
                hop: index,
                ciphers,
                digest,
            });
        }
    }
    None
}

/// A client circuit through one or more relays
pub struct Circuit {
    id: CircuitId,
    sink: Arc<dyn CellSink>,
    first_hop: Option<RouterDescriptor>,
    directory: Option<Arc<dyn RouterDirectory>>,
    sealer: Arc<dyn OnionSkinSealer>,
    behavior: Box<dyn CircuitBehavior>,
    ids: Arc<IdAllocator>,
    config: ClientConfig,
    blocking: AtomicBool,
    state: StateWatch,
    inner: Mutex<CircuitInner>,
}

impl Circuit {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CircuitId,
        sink: Arc<dyn CellSink>,
        first_hop: Option<RouterDescriptor>,
        directory: Option<Arc<dyn RouterDirectory>>,
        sealer: Arc<dyn OnionSkinSealer>,
        behavior: Box<dyn CircuitBehavior>,
        ids: Arc<IdAllocator>,
        config: ClientConfig,
    ) -> Self {
        Self {
            id,
            sink,
            first_hop,
            directory,
            sealer,
            behavior,
            ids,
            blocking: AtomicBool::new(config.blocking),
            config,
            state: StateWatch::new(id),
            inner: Mutex::new(CircuitInner {
                hops: Vec::new(),
                pending: None,
                to_build: VecDeque::new(),
                streams: StreamTable::new(),
                send_window: CIRCUIT_WINDOW_START,
                receive_window: CIRCUIT_WINDOW_START,
                cells_sent: 0,
                bytes_sent: 0,
                cells_received: 0,
                rendezvous_cookie: None,
                build_epoch: 0,
                failed_build: None,
            }),
        }
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == CircuitState::Destroyed
    }

    pub fn behavior_name(&self) -> &'static str {
        self.behavior.name()
    }

    /// Whether create/extend/rendezvous calls wait for their target state
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    pub async fn hop_count(&self) -> usize {
        self.inner.lock().await.hops.len()
    }

    pub async fn hops(&self) -> Vec<RouterDescriptor> {
        self.inner.lock().await.hops.iter().map(|hop| hop.router.clone()).collect()
    }

    pub async fn last_hop(&self) -> Option<RouterDescriptor> {
        self.inner.lock().await.hops.last().map(|hop| hop.router.clone())
    }

    pub async fn send_window(&self) -> u32 {
        self.inner.lock().await.send_window
    }

    pub async fn receive_window(&self) -> u32 {
        self.inner.lock().await.receive_window
    }

    pub async fn stream_count(&self) -> usize {
        self.inner.lock().await.streams.len()
    }

    pub async fn rendezvous_cookie(&self) -> Option<[u8; REND_COOKIE_LEN]> {
        self.inner.lock().await.rendezvous_cookie
    }

    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            state: self.state(),
            hops: inner.hops.len(),
            streams: inner.streams.len(),
            cells_sent: inner.cells_sent,
            bytes_sent: inner.bytes_sent,
            cells_received: inner.cells_received,
            send_window: inner.send_window,
            receive_window: inner.receive_window,
        }
    }

    /// Wait until the circuit is in `desired`. With `wait_if_already`, a
    /// circuit already in `desired` must leave and re-enter it first.
    pub async fn wait_for_state(&self, desired: CircuitState, wait_if_already: bool) -> Result<()> {
        let mut waiter = self.state.subscribe();
        if wait_if_already {
            waiter.wait_for_next(desired).await
        } else {
            waiter.wait_for(desired).await
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            error!("{}: operation on destroyed circuit", self.id);
            return Err(OnionError::CircuitDestroyed(self.id.as_u32()));
        }
        Ok(())
    }

    async fn lock_alive(&self) -> Result<MutexGuard<'_, CircuitInner>> {
        self.ensure_alive()?;
        let inner = self.inner.lock().await;
        self.ensure_alive()?;
        Ok(inner)
    }

    fn set_state(&self, new: CircuitState) {
        if let Some(old) = self.state.set(new) {
            trace!("{}: {} -> {}", self.id, old, new);
            self.behavior.on_state_change(self.id, old, new);
        }
    }

    /// Send the first-hop handshake to the configured entry router
    pub async fn create(&self) -> Result<()> {
        let first_hop = self
            .first_hop
            .clone()
            .ok_or_else(|| OnionError::InvalidRouter("circuit has no first hop".to_string()))?;
        self.create_to(first_hop).await
    }

    /// Send the first-hop handshake to `router`
    pub async fn create_to(&self, router: RouterDescriptor) -> Result<()> {
        let mut waiter = self.state.subscribe();
        let epoch = {
            let mut inner = self.lock_alive().await?;
            self.send_create(&mut inner, router)?;
            inner.build_epoch
        };
        if self.is_blocking() {
            waiter.wait_for(CircuitState::Ready).await?;
            self.build_outcome(epoch).await?;
        }
        Ok(())
    }

    /// Build through the first hop and then every named router in order.
    ///
    /// All names are resolved before anything is sent.
    pub async fn create_route(&self, names: &[&str]) -> Result<()> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| OnionError::RouterNotFound("no directory configured".to_string()))?;
        let first_hop = self
            .first_hop
            .clone()
            .ok_or_else(|| OnionError::InvalidRouter("circuit has no first hop".to_string()))?;
        let routers = names
            .iter()
            .map(|name| directory.resolve_router(name))
            .collect::<Result<Vec<_>>>()?;

        let mut waiter = self.state.subscribe();
        let epoch = {
            let mut inner = self.lock_alive().await?;
            inner.to_build.extend(routers);
            if let Err(err) = self.send_create(&mut inner, first_hop) {
                inner.to_build.clear();
                return Err(err);
            }
            inner.build_epoch
        };
        if self.is_blocking() {
            waiter.wait_for(CircuitState::Ready).await?;
            self.build_outcome(epoch).await?;
        }
        Ok(())
    }

    /// Error for a blocked create/extend whose build was truncated after it went out
    async fn build_outcome(&self, epoch: u64) -> Result<()> {
        let inner = self.inner.lock().await;
        match &inner.failed_build {
            Some(failed) if failed.epoch == epoch => Err(OnionError::Truncated {
                hop: failed.hop,
                reason: failed.reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn send_create(&self, inner: &mut CircuitInner, router: RouterDescriptor) -> Result<()> {
        if !inner.hops.is_empty() || inner.pending.is_some() {
            return Err(OnionError::protocol("create on a circuit that is already built"));
        }

        let (pending, request) = begin_handshake(self.sealer.as_ref(), &router)?;
        self.sink.send_cell(self.id, CellCommand::CREATE, request)?;
        debug!("{}: CREATE sent to {}", self.id, router);

        inner.pending = Some(pending);
        inner.build_epoch += 1;
        self.set_state(CircuitState::Creating);
        Ok(())
    }

    /// Append `router` through the current last hop
    pub async fn extend(&self, router: RouterDescriptor) -> Result<()> {
        let mut waiter = self.state.subscribe();
        let epoch = {
            let mut inner = self.lock_alive().await?;
            if inner.pending.is_some() {
                return Err(OnionError::protocol("a handshake is already in flight"));
            }
            self.send_extend(&mut inner, router)?;
            inner.build_epoch += 1;
            inner.build_epoch
        };
        if self.is_blocking() {
            waiter.wait_for(CircuitState::Ready).await?;
            self.build_outcome(epoch).await?;
        }
        Ok(())
    }

    fn send_extend(&self, inner: &mut CircuitInner, router: RouterDescriptor) -> Result<()> {
        if inner.hops.is_empty() {
            return Err(OnionError::NoHops);
        }

        let (pending, request) = begin_handshake(self.sealer.as_ref(), &router)?;
        let payload = ExtendPayload::new(&router, request).encode();
        self.send_relay_locked(inner, RelayCommand::Extend.code(), 0, &payload, true)?;
        debug!("{}: EXTEND to {} sent through hop {}", self.id, router, inner.hops.len() - 1);

        inner.pending = Some(pending);
        self.set_state(CircuitState::Extending);
        Ok(())
    }

    /// Send a relay cell addressed to the last hop
    pub async fn send_relay(&self, command: RelayCommand, stream_id: u16, data: &[u8]) -> Result<()> {
        let mut inner = self.lock_alive().await?;
        self.send_relay_locked(&mut inner, command.code(), stream_id, data, command == RelayCommand::Extend)
    }

    /// Send a relay cell with an arbitrary command byte, optionally as RELAY_EARLY
    pub async fn send_raw_relay(&self, command: u8, stream_id: u16, data: &[u8], early: bool) -> Result<()> {
        let mut inner = self.lock_alive().await?;
        self.send_relay_locked(&mut inner, command, stream_id, data, early)
    }

    /// Build, digest, encrypt and hand off one relay cell.
    ///
    /// Digest and cipher states are committed only after the sink accepted the cell.
    fn send_relay_locked(
        &self,
        inner: &mut CircuitInner,
        command: u8,
        stream_id: u16,
        data: &[u8],
        early: bool,
    ) -> Result<()> {
        let last = inner.hops.len().checked_sub(1).ok_or(OnionError::NoHops)?;

        let (mut cell, digest) = build_relay(&inner.hops[last].crypto.forward_digest, command, stream_id, data)?;
        let ciphers = onion_encrypt(&inner.hops, &mut cell);

        let outer = if early {
            CellCommand::RELAY_EARLY
        } else {
            CellCommand::RELAY
        };
        self.sink.send_cell(self.id, outer, cell.to_vec())?;

        inner.hops[last].crypto.forward_digest = digest;
        for (hop, cipher) in inner.hops.iter_mut().zip(ciphers) {
            hop.crypto.forward_cipher = cipher;
        }

        if command == RelayCommand::Data.code() {
            inner.send_window = inner.send_window.saturating_sub(1);
        }
        inner.cells_sent += 1;
        inner.bytes_sent += PAYLOAD_LEN as u64;

        trace!(
            "{}: sent relay command {} stream {} ({} bytes)",
            self.id,
            command,
            stream_id,
            data.len()
        );
        Ok(())
    }

    /// Open a TCP stream through the exit. Returns the stream id.
    pub async fn open_stream(&self, host: &str, port: u16, events: Arc<dyn StreamEvents>) -> Result<u16> {
        let mut inner = self.lock_alive().await?;
        let target = StreamTarget::Tcp {
            host: host.to_string(),
            port,
        };
        self.open_stream_locked(&mut inner, RelayCommand::Begin, &begin_payload(host, port), target, events)
    }

    /// Open a stream to the last hop's directory port
    pub async fn open_dir_stream(&self, events: Arc<dyn StreamEvents>) -> Result<u16> {
        let mut inner = self.lock_alive().await?;
        self.open_stream_locked(&mut inner, RelayCommand::BeginDir, &[], StreamTarget::Directory, events)
    }

    fn open_stream_locked(
        &self,
        inner: &mut CircuitInner,
        command: RelayCommand,
        payload: &[u8],
        target: StreamTarget,
        events: Arc<dyn StreamEvents>,
    ) -> Result<u16> {
        let stream_id = inner
            .streams
            .allocate(&self.ids)
            .ok_or_else(|| OnionError::protocol("no free stream ids"))?;

        inner.streams.insert(stream_id, target, events);
        if let Err(err) = self.send_relay_locked(inner, command.code(), stream_id, payload, false) {
            inner.streams.remove(stream_id);
            return Err(err);
        }

        debug!("{}: {} sent for stream {}", self.id, command, stream_id);
        Ok(stream_id)
    }

    /// Send `data` on a stream, split into as many DATA cells as needed
    pub async fn send_stream_data(&self, stream_id: u16, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock_alive().await?;
        if !inner.streams.contains(stream_id) {
            return Err(OnionError::UnknownStream(stream_id));
        }

        for chunk in data.chunks(RELAY_DATA_MAX) {
            self.send_relay_locked(&mut inner, RelayCommand::Data.code(), stream_id, chunk, false)?;
        }
        Ok(data.len())
    }

    /// Send RELAY_END (DONE) and forget the stream
    pub async fn close_stream(&self, stream_id: u16) -> Result<()> {
        let mut inner = self.lock_alive().await?;
        let consumer = inner
            .streams
            .remove(stream_id)
            .ok_or(OnionError::UnknownStream(stream_id))?;

        let sent = self.send_relay_locked(
            &mut inner,
            RelayCommand::End.code(),
            stream_id,
            &[EndReason::Done.code()],
            false,
        );
        consumer.disconnected(stream_id, Disconnect::Local);
        sent
    }

    /// Ask the last hop to act as rendezvous point. A random cookie is used
    /// when none is given; the cookie in use is returned.
    pub async fn establish_rendezvous(
        &self,
        cookie: Option<[u8; REND_COOKIE_LEN]>,
    ) -> Result<[u8; REND_COOKIE_LEN]> {
        let cookie = cookie.unwrap_or_else(|| {
            let mut fresh = [0u8; REND_COOKIE_LEN];
            OsRng.fill_bytes(&mut fresh);
            fresh
        });

        let mut waiter = self.state.subscribe();
        {
            let mut inner = self.lock_alive().await?;
            self.send_relay_locked(&mut inner, RelayCommand::EstablishRendezvous.code(), 0, &cookie, false)?;
            inner.rendezvous_cookie = Some(cookie);
            self.set_state(CircuitState::RendezvousWait);
        }
        if self.is_blocking() {
            waiter.wait_for(CircuitState::RendezvousEstablished).await?;
        }
        Ok(cookie)
    }

    /// Start the handshake the hidden service will answer in RENDEZVOUS2.
    ///
    /// Returns the sealed request for the caller to embed in INTRODUCE1.
    pub async fn prepare_rendezvous_handshake(&self, service: RouterDescriptor) -> Result<Vec<u8>> {
        let mut inner = self.lock_alive().await?;
        if inner.pending.is_some() {
            return Err(OnionError::protocol("a handshake is already in flight"));
        }

        let (pending, request) = begin_handshake(self.sealer.as_ref(), &service)?;
        inner.pending = Some(pending);
        debug!("{}: rendezvous handshake prepared for {}", self.id, service.nickname);
        Ok(request)
    }

    /// Send an opaque INTRODUCE1 body to the introduction point
    pub async fn send_introduce1(&self, payload: &[u8]) -> Result<()> {
        let mut waiter = self.state.subscribe();
        {
            let mut inner = self.lock_alive().await?;
            self.send_relay_locked(&mut inner, RelayCommand::Introduce1.code(), 0, payload, false)?;
        }
        if self.is_blocking() {
            waiter.wait_for(CircuitState::Introduced).await?;
        }
        Ok(())
    }

    /// Send DESTROY and release everything
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.lock_alive().await?;
        info!("{}: destroying", self.id);
        self.destroy_locked(&mut inner, DestroyReason::Requested)
    }

    fn destroy_locked(&self, inner: &mut CircuitInner, reason: DestroyReason) -> Result<()> {
        let sent = self
            .sink
            .send_cell(self.id, CellCommand::DESTROY, vec![reason.code()]);
        self.teardown(inner);
        sent
    }

    fn teardown(&self, inner: &mut CircuitInner) {
        for (stream_id, consumer) in inner.streams.drain() {
            consumer.disconnected(stream_id, Disconnect::CircuitClosed);
        }
        inner.hops.clear();
        inner.pending = None;
        inner.to_build.clear();
        self.set_state(CircuitState::Destroyed);
    }

    /// Give up on a build that cannot continue so nobody waits forever
    fn abort_build(&self, inner: &mut CircuitInner, err: OnionError) -> OnionError {
        error!("{}: build failed: {}", self.id, err);
        if let Err(send_err) = self.destroy_locked(inner, DestroyReason::Protocol) {
            warn!("{}: could not send DESTROY: {}", self.id, send_err);
        }
        err
    }

    /// Process one inbound cell for this circuit.
    ///
    /// Returns `Ok(false)` when the cell was dropped without effect.
    pub async fn handle_cell(&self, cell: Cell) -> Result<bool> {
        let mut inner = self.lock_alive().await?;
        inner.cells_received += 1;

        match cell.command {
            CellCommand::CREATED => {
                if inner.pending.is_none() || !inner.hops.is_empty() {
                    warn!("{}: unsolicited CREATED dropped", self.id);
                    return Ok(false);
                }
                self.add_hop(&mut inner, &cell.payload)?;
                self.continue_build(&mut inner)?;
                Ok(true)
            }
            CellCommand::RELAY => self.handle_relay(&mut inner, cell.payload),
            CellCommand::DESTROY => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                info!(
                    "{}: destroyed by peer, reason {}",
                    self.id,
                    DestroyReason::describe(reason)
                );
                self.teardown(&mut inner);
                Ok(true)
            }
            CellCommand::RELAY_EARLY | CellCommand::PADDING | CellCommand::VPADDING => {
                let route: Vec<&str> = inner.hops.iter().map(|hop| hop.router.nickname.as_str()).collect();
                warn!(
                    "{}: inbound {} on a client circuit, possible deanonymization attempt (route: {})",
                    self.id,
                    cell.command.name(),
                    route.join(", ")
                );
                Ok(true)
            }
            other => {
                debug!("{}: unhandled cell {}", self.id, other);
                Ok(false)
            }
        }
    }

    /// Complete the pending handshake and append the hop.
    ///
    /// A failed handshake destroys the circuit.
    fn add_hop(&self, inner: &mut CircuitInner, reply: &[u8]) -> Result<usize> {
        let pending = inner
            .pending
            .take()
            .ok_or_else(|| OnionError::protocol("handshake reply without a pending handshake"))?;

        let (router, keys) = match complete_handshake(pending, reply, self.config.strict_handshake_verification) {
            Ok(done) => done,
            Err(err) => return Err(self.abort_build(inner, err.into())),
        };

        let index = inner.hops.len();
        info!("{}: hop {} established ({})", self.id, index, router);
        inner.hops.push(Hop::new(index, router, &keys));
        Ok(index)
    }

    /// Extend to the next queued router, or declare the circuit ready
    fn continue_build(&self, inner: &mut CircuitInner) -> Result<()> {
        match inner.to_build.pop_front() {
            Some(next) => self
                .send_extend(inner, next)
                .map_err(|err| self.abort_build(inner, err)),
            None => {
                info!("{}: built ({} hops)", self.id, inner.hops.len());
                self.set_state(CircuitState::Ready);
                Ok(())
            }
        }
    }

    fn handle_relay(&self, inner: &mut CircuitInner, mut payload: Vec<u8>) -> Result<bool> {
        if payload.len() != PAYLOAD_LEN {
            warn!("{}: relay cell of {} bytes dropped", self.id, payload.len());
            return Ok(false);
        }

        let recognized = match onion_decrypt(&inner.hops, &mut payload) {
            Some(recognized) => recognized,
            None => {
                warn!("{}: unrecognized relay cell dropped", self.id);
                return Ok(false);
            }
        };

        let Recognized { hop: from_hop, ciphers, digest } = recognized;
        for (hop, cipher) in inner.hops.iter_mut().zip(ciphers) {
            hop.crypto.backward_cipher = cipher;
        }
        inner.hops[from_hop].crypto.backward_digest = digest;

        let cell = match RelayCell::parse(&payload) {
            Ok(cell) => cell,
            Err(err) => {
                warn!("{}: malformed relay cell from hop {}: {}", self.id, from_hop, err);
                return Ok(false);
            }
        };

        if from_hop + 1 != inner.hops.len() {
            info!("{}: {} from intermediate hop {}", self.id, cell.command_name(), from_hop);
        }

        if self.behavior.intercept_relay(self.id, from_hop, &cell) == Disposition::Handled {
            trace!("{}: {} handled by {}", self.id, cell.command_name(), self.behavior.name());
            return Ok(true);
        }

        self.dispatch_relay(inner, from_hop, cell)
    }

    fn dispatch_relay(&self, inner: &mut CircuitInner, from_hop: usize, cell: RelayCell) -> Result<bool> {
        let stream_id = cell.stream_id;
        let consumer = if stream_id != 0 {
            match inner.streams.get(stream_id) {
                Some(consumer) => Some(consumer),
                None => {
                    warn!("{}: {} for unknown stream {}", self.id, cell.command_name(), stream_id);
                    return Ok(false);
                }
            }
        } else {
            None
        };

        let command = match cell.relay_command() {
            Some(command) => command,
            None => {
                warn!("{}: unknown relay command {} dropped", self.id, cell.command);
                return Ok(false);
            }
        };

        if command.is_stream_scoped() && stream_id == 0 {
            warn!("{}: {} without a stream id dropped", self.id, command);
            return Ok(false);
        }

        match command {
            RelayCommand::Drop => {
                warn!(
                    "{}: RELAY_DROP from hop {}, possible deanonymization attempt",
                    self.id, from_hop
                );
            }
            RelayCommand::Extended => {
                if inner.pending.is_none() || !matches!(self.state(), CircuitState::Extending) {
                    warn!("{}: unsolicited EXTENDED dropped", self.id);
                    return Ok(false);
                }
                self.add_hop(inner, &cell.data)?;
                self.continue_build(inner)?;
            }
            RelayCommand::Truncated => {
                return self.handle_truncated(inner, from_hop, &cell.data);
            }
            RelayCommand::RendezvousEstablished => {
                if self.state() != CircuitState::RendezvousWait {
                    warn!("{}: RENDEZVOUS_ESTABLISHED outside RENDEZVOUS_WAIT dropped", self.id);
                    return Ok(false);
                }
                info!("{}: rendezvous point ready", self.id);
                self.set_state(CircuitState::RendezvousEstablished);
            }
            RelayCommand::Rendezvous2 => {
                if self.state() != CircuitState::RendezvousEstablished || inner.pending.is_none() {
                    warn!("{}: RENDEZVOUS2 outside RENDEZVOUS_ESTABLISHED dropped", self.id);
                    return Ok(false);
                }
                self.add_hop(inner, &cell.data)?;
                info!("{}: rendezvous complete", self.id);
                self.set_state(CircuitState::RendezvousComplete);
            }
            RelayCommand::IntroduceAck => {
                info!("{}: introduction acknowledged", self.id);
                self.set_state(CircuitState::Introduced);
            }
            RelayCommand::Sendme => {
                if stream_id == 0 {
                    if inner.send_window + CIRCUIT_WINDOW_INCREMENT > CIRCUIT_WINDOW_START {
                        warn!(
                            "{}: SENDME would raise send window past {} ({} now), dropped",
                            self.id, CIRCUIT_WINDOW_START, inner.send_window
                        );
                        return Ok(false);
                    }
                    inner.send_window += CIRCUIT_WINDOW_INCREMENT;
                    trace!("{}: send window now {}", self.id, inner.send_window);
                }
            }
            RelayCommand::Connected => {
                if !inner.streams.mark_connected(stream_id) {
                    warn!("{}: duplicate CONNECTED for stream {} dropped", self.id, stream_id);
                    return Ok(false);
                }
                if let Some(consumer) = consumer {
                    consumer.connected(stream_id);
                }
            }
            RelayCommand::Data => {
                inner.receive_window = inner.receive_window.saturating_sub(1);
                if let Some(consumer) = consumer {
                    consumer.data_arrived(stream_id, &cell.data);
                }

                if inner.receive_window < SENDME_THRESHOLD {
                    self.send_relay_locked(inner, RelayCommand::Sendme.code(), 0, &[], false)?;
                    inner.receive_window += CIRCUIT_WINDOW_INCREMENT;
                    trace!("{}: SENDME sent, receive window now {}", self.id, inner.receive_window);
                }
            }
            RelayCommand::End => {
                let reason = cell.data.first().copied().unwrap_or(EndReason::Misc.code());
                if reason != EndReason::Done.code() {
                    let target = inner.streams.target(stream_id).map(ToString::to_string).unwrap_or_default();
                    info!(
                        "{}: stream {} to {} closed by exit: {}",
                        self.id,
                        stream_id,
                        target,
                        EndReason::describe(reason)
                    );
                }
                if let Some(consumer) = inner.streams.remove(stream_id) {
                    consumer.disconnected(stream_id, Disconnect::Remote(reason));
                }
            }
            other => {
                warn!("{}: unexpected {} on a client circuit dropped", self.id, other);
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn handle_truncated(&self, inner: &mut CircuitInner, from_hop: usize, data: &[u8]) -> Result<bool> {
        let reason = DestroyReason::describe(data.first().copied().unwrap_or(0));
        let building = matches!(self.state(), CircuitState::Creating | CircuitState::Extending);
        let removed = inner.hops.len().saturating_sub(from_hop + 1);
        inner.hops.truncate(from_hop + 1);
        inner.pending = None;
        inner.to_build.clear();
        info!(
            "{}: TRUNCATED from hop {} ({}), {} hop(s) removed",
            self.id, from_hop, reason, removed
        );

        let policy = self
            .behavior
            .truncate_policy()
            .unwrap_or(self.config.truncate_policy);

        match policy {
            TruncatePolicy::Fatal => {
                error!("{}: circuit truncated at hop {}, tearing down", self.id, from_hop);
                if let Err(err) = self.destroy_locked(inner, DestroyReason::Requested) {
                    warn!("{}: could not send DESTROY: {}", self.id, err);
                }
                Err(OnionError::Truncated {
                    hop: from_hop,
                    reason,
                })
            }
            TruncatePolicy::Continue => {
                for (stream_id, consumer) in inner.streams.drain() {
                    consumer.disconnected(stream_id, Disconnect::CircuitClosed);
                }
                if building {
                    warn!("{}: build abandoned at hop {}", self.id, from_hop);
                    inner.failed_build = Some(FailedBuild {
                        epoch: inner.build_epoch,
                        hop: from_hop,
                        reason,
                    });
                }
                warn!("{}: continuing with {} hop(s)", self.id, inner.hops.len());
                self.set_state(CircuitState::Ready);
                Ok(true)
            }
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("behavior", &self.behavior.name())
            .finish_non_exhaustive()
    }
}
