use super::engine::Circuit;
use super::types::{CircuitId, CircuitState};
use crate::transport::Cell;
use onioncell_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Circuit table for one channel
pub struct CircuitManager {
    circuits: RwLock<HashMap<CircuitId, Arc<Circuit>>>,
}

impl CircuitManager {
    pub fn new() -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, circuit: Arc<Circuit>) {
        debug!("Registered {}", circuit.id());
        self.circuits.write().await.insert(circuit.id(), circuit);
    }

    pub async fn get(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.circuits.read().await.get(&id).cloned()
    }

    /// Route an inbound cell to its circuit.
    ///
    /// `Ok(false)` if no circuit has that id. The table lock is released
    /// before the circuit handles the cell.
    pub async fn dispatch(&self, cell: Cell) -> Result<bool> {
        let circuit = match self.get(cell.circuit_id).await {
            Some(circuit) => circuit,
            None => {
                trace!("No circuit for {} ({})", cell.circuit_id, cell.command);
                return Ok(false);
            }
        };
        circuit.handle_cell(cell).await
    }

    /// Drop destroyed circuits from the table; returns how many went
    pub async fn prune_destroyed(&self) -> usize {
        let mut circuits = self.circuits.write().await;
        let before = circuits.len();
        circuits.retain(|_, circuit| !circuit.is_destroyed());
        let removed = before - circuits.len();
        if removed > 0 {
            debug!("Pruned {} destroyed circuit(s)", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.circuits.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.circuits.read().await.is_empty()
    }

    pub async fn stats(&self) -> CircuitManagerStats {
        let circuits = self.circuits.read().await;
        let mut stats = CircuitManagerStats {
            total: circuits.len(),
            ..Default::default()
        };

        for circuit in circuits.values() {
            match circuit.state() {
                CircuitState::Destroyed => stats.destroyed += 1,
                CircuitState::None | CircuitState::Creating | CircuitState::Extending => stats.building += 1,
                _ => stats.usable += 1,
            }
        }

        stats
    }
}

impl Default for CircuitManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about circuits on a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitManagerStats {
    pub total: usize,
    pub building: usize,
    pub usable: usize,
    pub destroyed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBuilder;
    use crate::testing::{drive_build, recording_sink, SimulatedPath};
    use crate::transport::CellCommand;
    use onioncell_common::config::cell::PAYLOAD_LEN;

    #[tokio::test]
    async fn test_dispatch_unknown_circuit() {
        let manager = CircuitManager::new();
        let cell = Cell::new(CircuitId(77), CellCommand::RELAY, vec![0; PAYLOAD_LEN]);
        assert!(!manager.dispatch(cell).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_id() {
        let manager = CircuitManager::new();
        let mut path = SimulatedPath::new(1);
        let (sink, mut rx) = recording_sink();

        let circuit = CircuitBuilder::new(CircuitId(5), sink.clone())
            .first_hop(path.descriptor(0))
            .build();
        let idle = CircuitBuilder::new(CircuitId(6), sink).build();
        manager.register(circuit.clone()).await;
        manager.register(idle.clone()).await;

        circuit.create().await.unwrap();
        let create = rx.try_recv().unwrap();
        let reply = path.answer(0, &create.payload);
        assert!(manager
            .dispatch(Cell::new(CircuitId(5), CellCommand::CREATED, reply))
            .await
            .unwrap());

        assert_eq!(circuit.state(), CircuitState::Ready);
        assert_eq!(idle.state(), CircuitState::None);

        let stats = manager.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.usable, 1);
        assert_eq!(stats.building, 1);
    }

    #[tokio::test]
    async fn test_prune_destroyed() {
        let manager = CircuitManager::new();
        let mut path = SimulatedPath::new(1);
        let (sink, mut rx) = recording_sink();
        let circuit = CircuitBuilder::new(CircuitId(5), sink)
            .first_hop(path.descriptor(0))
            .build();
        manager.register(circuit.clone()).await;

        circuit.create().await.unwrap();
        drive_build(&circuit, &mut rx, &mut path).await;
        circuit.destroy().await.unwrap();

        assert_eq!(manager.stats().await.destroyed, 1);
        assert_eq!(manager.prune_destroyed().await, 1);
        assert!(manager.is_empty().await);
    }
}
