mod behavior;
mod builder;
pub(crate) mod crypto;
mod engine;
pub(crate) mod handshake;
mod manager;
pub(crate) mod relay;
mod state;
mod stream;
mod types;

pub use behavior::{CircuitBehavior, DefaultBehavior, Disposition};
pub use builder::CircuitBuilder;
pub use crypto::{kdf_tor, Aes128Ctr, CryptoError, DigestState, HopCrypto, KeyMaterial};
pub use engine::{Circuit, CircuitStats};
pub use handshake::{begin_handshake, complete_handshake, OnionSkinSealer, PendingHandshake, SealedBox};
pub use manager::{CircuitManager, CircuitManagerStats};
pub use relay::{
    build_relay, verify_digest, DestroyReason, EndReason, ExtendPayload, RelayCell, RelayCommand,
    RelayError,
};
pub use state::{StateWaiter, StateWatch};
pub use stream::{begin_payload, Disconnect, StreamEvent, StreamEventSender, StreamEvents, StreamTarget};
pub use types::{CircuitId, CircuitState, Hop, IdAllocator};
