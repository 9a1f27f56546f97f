use super::cell::{parse_versions, read_cell, Cell, CellCommand};
use super::RouterDirectory;
use crate::circuit::{
    Circuit, CircuitBehavior, CircuitBuilder, CircuitId, CircuitManager, DefaultBehavior, IdAllocator,
    OnionSkinSealer, SealedBox,
};
use onioncell_common::config::link::MIN_VERSION;
use onioncell_common::{ClientConfig, OnionError, Result, RouterDescriptor};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Authenticated link to the first hop, multiplexing many circuits.
///
/// The caller supplies an already-secured byte stream (TLS is not handled here).
pub struct Channel {
    link_version: u16,
    first_hop: RouterDescriptor,
    outbound: mpsc::UnboundedSender<Cell>,
    circuits: Arc<CircuitManager>,
    ids: Arc<IdAllocator>,
    directory: Arc<dyn RouterDirectory>,
    sealer: Arc<dyn OnionSkinSealer>,
    config: ClientConfig,
    ready: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
    reader: JoinHandle<Result<()>>,
    writer: JoinHandle<Result<()>>,
}

/// Highest version both sides offered
fn negotiate_version(ours: &[u16], theirs: &[u16]) -> Option<u16> {
    ours.iter().filter(|v| theirs.contains(v)).max().copied()
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl Channel {
    /// Exchange VERSIONS on `io`, then start the reader and writer tasks.
    ///
    /// Returns once a version is agreed; call [`Channel::wait_ready`] before
    /// creating circuits so the peer's NETINFO has been answered.
    pub async fn open<S>(
        io: S,
        first_hop: RouterDescriptor,
        directory: Arc<dyn RouterDirectory>,
        config: ClientConfig,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let (mut reader, mut writer) = tokio::io::split(io);

        let versions = Cell::versions(&config.link_versions);
        writer.write_all(&versions.encode(MIN_VERSION)?).await?;
        writer.flush().await?;

        let reply = read_cell(&mut reader, MIN_VERSION).await?;
        if reply.command != CellCommand::VERSIONS {
            return Err(OnionError::protocol(format!(
                "expected VERSIONS, got {}",
                reply.command
            )));
        }
        let offered = parse_versions(&reply.payload)?;
        let link_version = negotiate_version(&config.link_versions, &offered).ok_or_else(|| {
            OnionError::protocol(format!("no common link version in {:?}", offered))
        })?;
        info!("Link to {} using protocol version {}", first_hop, link_version);

        let (outbound, queue) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(false);
        let (stop, stopped) = watch::channel(false);
        let circuits = Arc::new(CircuitManager::new());

        let writer = tokio::spawn(write_loop(writer, queue, stopped, link_version));
        let reader = tokio::spawn(receive_loop(
            reader,
            link_version,
            circuits.clone(),
            outbound.clone(),
            first_hop.address,
            ready_tx,
        ));

        Ok(Self {
            link_version,
            first_hop,
            outbound,
            circuits,
            ids: Arc::new(IdAllocator::new()),
            directory,
            sealer: Arc::new(SealedBox),
            config,
            ready,
            stop,
            reader,
            writer,
        })
    }

    /// Use a different onion skin sealer for circuits created from now on
    pub fn with_sealer(mut self, sealer: Arc<dyn OnionSkinSealer>) -> Self {
        self.sealer = sealer;
        self
    }

    /// Resolves once NETINFO has been exchanged
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| OnionError::transport("channel closed before NETINFO"))?;
        Ok(())
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    pub fn first_hop(&self) -> &RouterDescriptor {
        &self.first_hop
    }

    pub fn circuits(&self) -> &Arc<CircuitManager> {
        &self.circuits
    }

    pub async fn circuit(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.circuits.get(id).await
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// New standard circuit through this channel's first hop
    pub async fn create_circuit(&self) -> Arc<Circuit> {
        self.create_circuit_with(Box::new(DefaultBehavior)).await
    }

    /// New circuit with custom behavior
    pub async fn create_circuit_with(&self, behavior: Box<dyn CircuitBehavior>) -> Arc<Circuit> {
        let id = self.ids.next_circuit_id(self.link_version);
        let circuit = CircuitBuilder::new(id, Arc::new(self.outbound.clone()))
            .first_hop(self.first_hop.clone())
            .directory(self.directory.clone())
            .sealer(self.sealer.clone())
            .behavior(behavior)
            .ids(self.ids.clone())
            .config(self.config.clone())
            .build();

        self.circuits.register(circuit.clone()).await;
        circuit
    }

    /// Stop reading, flush what is queued, and close the link.
    ///
    /// Circuits still held elsewhere get a transport error on their next send.
    pub async fn shutdown(self) -> Result<()> {
        self.reader.abort();
        self.stop.send_replace(true);

        match self.writer.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("channel writer task failed").into()),
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Cell>,
    mut stop: watch::Receiver<bool>,
    link_version: u16,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut stopping = false;
    loop {
        let cell = tokio::select! {
            cell = queue.recv() => cell,
            _ = stop.changed(), if !stopping => {
                // Refuse new cells but still write out the backlog
                stopping = true;
                queue.close();
                continue;
            }
        };
        let Some(cell) = cell else { break };

        let bytes = match cell.encode(link_version) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Dropping unencodable cell for {}: {}", cell.circuit_id, err);
                continue;
            }
        };
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }

    debug!("Channel writer finished");
    writer.shutdown().await?;
    Ok(())
}

async fn receive_loop<R>(
    mut reader: R,
    link_version: u16,
    circuits: Arc<CircuitManager>,
    outbound: mpsc::UnboundedSender<Cell>,
    peer: Ipv4Addr,
    ready: watch::Sender<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let cell = match read_cell(&mut reader, link_version).await {
            Ok(cell) => cell,
            Err(err) => {
                error!("Channel receive loop stopped: {}", err);
                return Err(err.into());
            }
        };

        match cell.command {
            CellCommand::NETINFO => {
                outbound
                    .send(Cell::netinfo(unix_time(), peer, Ipv4Addr::UNSPECIFIED))
                    .map_err(|_| OnionError::transport("channel writer closed"))?;
                ready.send_replace(true);
                debug!("NETINFO exchanged");
                continue;
            }
            CellCommand::CERTS | CellCommand::AUTH_CHALLENGE | CellCommand::VERSIONS => {
                debug!("Ignoring link cell {}", cell.command);
                continue;
            }
            CellCommand::PADDING | CellCommand::VPADDING if cell.circuit_id.as_u32() == 0 => {
                continue;
            }
            _ => {}
        }

        let circuit_id = cell.circuit_id;
        let command = cell.command;
        match circuits.dispatch(cell).await {
            Ok(true) => {}
            Ok(false) => debug!("Unhandled cell {} for {}", command, circuit_id),
            Err(err) => warn!("{} failed to handle {}: {}", circuit_id, command, err),
        }
    }
}
