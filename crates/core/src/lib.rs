pub mod circuit;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export circuit types
pub use circuit::{
    Circuit, CircuitBehavior, CircuitBuilder, CircuitId, CircuitManager, CircuitManagerStats,
    CircuitState, CircuitStats, CryptoError, DefaultBehavior, DestroyReason, Disconnect,
    Disposition, EndReason, RelayCell, RelayCommand, RelayError, StreamEvent, StreamEventSender,
    StreamEvents,
};

// Re-export transport types
pub use transport::{
    Cell, CellCommand, CellError, CellSink, Channel, RouterDirectory, StaticDirectory,
};

pub use onioncell_common::{ClientConfig, OnionError, Result, RouterDescriptor, TruncatePolicy};
