/// Assembles a [`Circuit`] from its collaborators.
///
/// Only the id and the cell sink are required; everything else has a
/// sensible default:
/// 1. no first hop (use `create_to`)
/// 2. no directory (`create_route` fails)
/// 3. [`SealedBox`] for onion skins
/// 4. [`DefaultBehavior`]
/// 5. a private [`IdAllocator`]
/// 6. `ClientConfig::default()`

use super::behavior::{CircuitBehavior, DefaultBehavior};
use super::engine::Circuit;
use super::handshake::{OnionSkinSealer, SealedBox};
use super::types::{CircuitId, IdAllocator};
use crate::transport::{CellSink, RouterDirectory};
use onioncell_common::{ClientConfig, RouterDescriptor};
use std::sync::Arc;
use tracing::debug;

pub struct CircuitBuilder {
    id: CircuitId,
    sink: Arc<dyn CellSink>,
    first_hop: Option<RouterDescriptor>,
    directory: Option<Arc<dyn RouterDirectory>>,
    sealer: Arc<dyn OnionSkinSealer>,
    behavior: Box<dyn CircuitBehavior>,
    ids: Arc<IdAllocator>,
    config: ClientConfig,
}

impl CircuitBuilder {
    pub fn new(id: CircuitId, sink: Arc<dyn CellSink>) -> Self {
        Self {
            id,
            sink,
            first_hop: None,
            directory: None,
            sealer: Arc::new(SealedBox),
            behavior: Box::new(DefaultBehavior),
            ids: Arc::new(IdAllocator::new()),
            config: ClientConfig::default(),
        }
    }

    /// Router the channel is connected to
    pub fn first_hop(mut self, router: RouterDescriptor) -> Self {
        self.first_hop = Some(router);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn RouterDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn sealer(mut self, sealer: Arc<dyn OnionSkinSealer>) -> Self {
        self.sealer = sealer;
        self
    }

    pub fn behavior(mut self, behavior: Box<dyn CircuitBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Share stream id allocation with the owning channel
    pub fn ids(mut self, ids: Arc<IdAllocator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Circuit> {
        debug!(
            "Building {} with behavior {}",
            self.id,
            self.behavior.name()
        );

        Arc::new(Circuit::new(
            self.id,
            self.sink,
            self.first_hop,
            self.directory,
            self.sealer,
            self.behavior,
            self.ids,
            self.config,
        ))
    }
}
