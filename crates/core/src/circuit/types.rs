use super::crypto::{HopCrypto, KeyMaterial};
use onioncell_common::config::link::{INITIATOR_CIRCUIT_ID_BIT, WIDE_CIRCUIT_ID_VERSION};
use onioncell_common::RouterDescriptor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Identifier of a circuit on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(pub u32);

impl CircuitId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit({:#x})", self.0)
    }
}

/// Lifecycle state of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Nothing sent yet
    None,

    /// Handshake request sent to the first hop
    Creating,

    /// EXTEND sent through the current last hop
    Extending,

    /// Usable
    Ready,

    /// Terminal
    Destroyed,

    /// ESTABLISH_RENDEZVOUS sent
    RendezvousWait,

    /// Rendezvous point acknowledged the cookie
    RendezvousEstablished,

    /// Hidden service joined the circuit
    RendezvousComplete,

    /// Introduction point acknowledged INTRODUCE1
    Introduced,
}

impl CircuitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// States in which relay cells may be sent end to end
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::RendezvousWait
                | Self::RendezvousEstablished
                | Self::RendezvousComplete
                | Self::Introduced
        )
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Creating => "CREATING",
            Self::Extending => "EXTENDING",
            Self::Ready => "READY",
            Self::Destroyed => "DESTROYED",
            Self::RendezvousWait => "RENDEZVOUS_WAIT",
            Self::RendezvousEstablished => "RENDEZVOUS_ESTABLISHED",
            Self::RendezvousComplete => "RENDEZVOUS_COMPLETE",
            Self::Introduced => "INTRODUCED",
        };
        f.write_str(name)
    }
}

/// One established hop: the relay and the symmetric state shared with it
pub struct Hop {
    pub(crate) index: usize,
    pub(crate) router: RouterDescriptor,
    pub(crate) crypto: HopCrypto,
}

impl Hop {
    pub fn new(index: usize, router: RouterDescriptor, keys: &KeyMaterial) -> Self {
        Self {
            index,
            router,
            crypto: HopCrypto::from_key_material(keys),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn router(&self) -> &RouterDescriptor {
        &self.router
    }
}

impl std::fmt::Debug for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hop")
            .field("index", &self.index)
            .field("router", &self.router.nickname)
            .finish_non_exhaustive()
    }
}

/// Hands out circuit and stream ids for one channel.
///
/// Shared between the channel and every circuit it creates.
#[derive(Debug)]
pub struct IdAllocator {
    next_circuit: AtomicU32,
    next_stream: AtomicU16,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_circuit: AtomicU32::new(1),
            next_stream: AtomicU16::new(1),
        }
    }

    /// Next circuit id for the negotiated link version.
    ///
    /// Versions below 4 get a nonzero 16-bit id; later versions get a 31-bit
    /// counter with the initiator bit set.
    pub fn next_circuit_id(&self, link_version: u16) -> CircuitId {
        loop {
            let raw = self.next_circuit.fetch_add(1, Ordering::Relaxed);

            if link_version >= WIDE_CIRCUIT_ID_VERSION {
                let low = raw & !INITIATOR_CIRCUIT_ID_BIT;
                if low != 0 {
                    return CircuitId(low | INITIATOR_CIRCUIT_ID_BIT);
                }
            } else {
                let narrow = raw & 0xFFFF;
                if narrow != 0 {
                    return CircuitId(narrow);
                }
            }
        }
    }

    /// Next nonzero stream id; wraps after 65535
    pub fn next_stream_id(&self) -> u16 {
        loop {
            let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_wide_circuit_ids_have_initiator_bit() {
        let ids = IdAllocator::new();
        let first = ids.next_circuit_id(4);
        let second = ids.next_circuit_id(4);

        assert_eq!(first.as_u32(), 0x8000_0001);
        assert_eq!(second.as_u32(), 0x8000_0002);
    }

    #[test]
    fn test_narrow_circuit_ids_skip_zero() {
        let ids = IdAllocator {
            next_circuit: AtomicU32::new(0xFFFF),
            next_stream: AtomicU16::new(1),
        };

        assert_eq!(ids.next_circuit_id(3).as_u32(), 0xFFFF);
        assert_eq!(ids.next_circuit_id(3).as_u32(), 1);
    }

    #[test]
    fn test_stream_ids_skip_zero_on_wrap() {
        let ids = IdAllocator {
            next_circuit: AtomicU32::new(1),
            next_stream: AtomicU16::new(u16::MAX),
        };

        assert_eq!(ids.next_stream_id(), u16::MAX);
        assert_eq!(ids.next_stream_id(), 1);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.next_stream_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::RendezvousWait.to_string(), "RENDEZVOUS_WAIT");
        assert!(CircuitState::Destroyed.is_terminal());
        assert!(!CircuitState::Creating.is_usable());
    }
}
