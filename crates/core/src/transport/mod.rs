/// Link layer: cell framing, the channel to the first hop, and the seams the
/// circuit engine talks through.

mod cell;
mod channel;

pub use cell::{circuit_id_len, parse_versions, read_cell, Cell, CellCommand, CellError};
pub use channel::Channel;

use crate::circuit::CircuitId;
use onioncell_common::{OnionError, Result, RouterDescriptor};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Where circuits hand their outbound cells
pub trait CellSink: Send + Sync {
    fn send_cell(&self, circuit_id: CircuitId, command: CellCommand, payload: Vec<u8>) -> Result<()>;
}

impl CellSink for mpsc::UnboundedSender<Cell> {
    fn send_cell(&self, circuit_id: CircuitId, command: CellCommand, payload: Vec<u8>) -> Result<()> {
        let cell = Cell::new(circuit_id, command, payload);
        cell.check_payload()?;
        self.send(cell)
            .map_err(|_| OnionError::transport("channel writer closed"))
    }
}

/// Router lookup by nickname
pub trait RouterDirectory: Send + Sync {
    fn resolve_router(&self, name: &str) -> Result<RouterDescriptor>;
}

/// Fixed in-memory directory
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    routers: HashMap<String, RouterDescriptor>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, router: RouterDescriptor) {
        self.routers.insert(router.nickname.to_lowercase(), router);
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

impl FromIterator<RouterDescriptor> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = RouterDescriptor>>(iter: I) -> Self {
        let mut directory = Self::new();
        for router in iter {
            directory.insert(router);
        }
        directory
    }
}

impl RouterDirectory for StaticDirectory {
    // Nicknames are case-insensitive
    fn resolve_router(&self, name: &str) -> Result<RouterDescriptor> {
        self.routers
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| OnionError::RouterNotFound(name.to_string()))
    }
}
