//! Simulated relays for exercising circuits without a network.
//!
//! The relay side here is written independently of the client engine and only
//! shares the primitive codecs, so round trips actually check the layering.

use crate::circuit::crypto::{CryptoError, HopCrypto, KeyMaterial};
use crate::circuit::handshake::SealedBox;
use crate::circuit::relay::{build_relay, verify_digest, ExtendPayload, RelayCell, RelayCommand};
use crate::circuit::{Circuit, CircuitId};
use crate::transport::{Cell, CellCommand, CellSink, StaticDirectory};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use onioncell_common::config::crypto::{DH_LEN, HANDSHAKE_REPLY_LEN};
use onioncell_common::{Fingerprint, OnionError, Result, RouterDescriptor};
use rand::rngs::OsRng;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// A relay's long-term onion key
pub(crate) struct OnionSecretKey(StaticSecret);

impl OnionSecretKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *PublicKey::from(&self.0).as_bytes()
    }
}

/// Open a [`SealedBox`] addressed to `secret`
pub(crate) fn open_sealed(secret: &OnionSecretKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < DH_LEN + SealedBox::TAG_LEN {
        return Err(CryptoError::MalformedSkin(sealed.len()));
    }

    let (ephemeral, ciphertext) = sealed.split_at(DH_LEN);
    let mut ephemeral_bytes = [0u8; DH_LEN];
    ephemeral_bytes.copy_from_slice(ephemeral);

    let shared = secret.0.diffie_hellman(&PublicKey::from(ephemeral_bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let key = SealedBox::derive_key(shared.as_bytes(), &ephemeral_bytes, &secret.public_bytes());
    ChaCha20Poly1305::new(&key.into())
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// What a relay does with a CREATE / EXTEND body: open it, answer `g^y | KH`
pub(crate) fn answer_handshake(
    onion_key: &OnionSecretKey,
    request: &[u8],
) -> Result<(Vec<u8>, KeyMaterial), CryptoError> {
    let opened = open_sealed(onion_key, request)?;
    if opened.len() != DH_LEN {
        return Err(CryptoError::MalformedSkin(opened.len()));
    }
    let mut client_public = [0u8; DH_LEN];
    client_public.copy_from_slice(&opened);

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(client_public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let keys = KeyMaterial::expand(shared.as_bytes());
    let mut reply = Vec::with_capacity(HANDSHAKE_REPLY_LEN);
    reply.extend_from_slice(public.as_bytes());
    reply.extend_from_slice(&keys.verifier);
    Ok((reply, keys))
}

pub(crate) fn recording_sink() -> (Arc<dyn CellSink>, mpsc::UnboundedReceiver<Cell>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Sink that can be told to refuse cells
pub(crate) struct FlakySink {
    tx: mpsc::UnboundedSender<Cell>,
    failing: AtomicBool,
}

impl FlakySink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Cell>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx,
            failing: AtomicBool::new(false),
        });
        (sink, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl CellSink for FlakySink {
    fn send_cell(&self, circuit_id: CircuitId, command: CellCommand, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OnionError::transport("link down"));
        }
        self.tx.send_cell(circuit_id, command, payload)
    }
}

pub(crate) struct SimulatedRelay {
    descriptor: RouterDescriptor,
    onion_key: OnionSecretKey,
    keys: Option<HopCrypto>,
}

impl SimulatedRelay {
    fn new(index: usize) -> Self {
        let onion_key = OnionSecretKey::generate();
        let octet = index as u8 + 1;
        let descriptor = RouterDescriptor::new(
            format!("relay{}", index),
            Ipv4Addr::new(10, 0, 0, octet),
            9000 + index as u16,
            Fingerprint::from_bytes([octet; 20]),
            onion_key.public_bytes(),
        );

        Self {
            descriptor,
            onion_key,
            keys: None,
        }
    }
}

/// A chain of relays that a circuit builds through, in hop order
pub(crate) struct SimulatedPath {
    relays: Vec<SimulatedRelay>,
}

impl SimulatedPath {
    pub fn new(hops: usize) -> Self {
        Self {
            relays: (0..hops).map(SimulatedRelay::new).collect(),
        }
    }

    pub fn descriptor(&self, index: usize) -> RouterDescriptor {
        self.relays[index].descriptor.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.relays.iter().map(|relay| relay.descriptor.nickname.clone()).collect()
    }

    pub fn directory(&self) -> StaticDirectory {
        self.relays.iter().map(|relay| relay.descriptor.clone()).collect()
    }

    /// Relay `index` answers a handshake request and keeps the keys
    pub fn answer(&mut self, index: usize, request: &[u8]) -> Vec<u8> {
        let relay = &mut self.relays[index];
        let (reply, keys) = answer_handshake(&relay.onion_key, request).unwrap();
        relay.keys = Some(HopCrypto::from_key_material(&keys));
        reply
    }

    /// Run an outbound relay payload through the relays until one recognises it
    pub fn peel(&mut self, payload: &[u8]) -> Option<(usize, RelayCell)> {
        let mut cell = payload.to_vec();
        for (index, relay) in self.relays.iter_mut().enumerate() {
            let keys = relay.keys.as_mut()?;
            keys.apply_forward(&mut cell);
            if let Some(digest) = verify_digest(keys.forward_digest(), &cell) {
                keys.forward_digest = digest;
                return Some((index, RelayCell::parse(&cell).unwrap()));
            }
        }
        None
    }

    /// Relay `from` sends a relay cell back toward the client
    pub fn originate(&mut self, from: usize, command: RelayCommand, stream_id: u16, data: &[u8]) -> Vec<u8> {
        let keys = self.relays[from].keys.as_mut().unwrap();
        let (mut cell, digest) = build_relay(keys.backward_digest(), command.code(), stream_id, data).unwrap();
        keys.backward_digest = digest;

        for relay in self.relays[..=from].iter_mut().rev() {
            relay.keys.as_mut().unwrap().apply_backward(&mut cell);
        }
        cell.to_vec()
    }
}

/// Answer every CREATE and EXTEND the circuit has queued, until it stops sending
pub(crate) async fn drive_build(circuit: &Circuit, rx: &mut mpsc::UnboundedReceiver<Cell>, path: &mut SimulatedPath) {
    while let Ok(cell) = rx.try_recv() {
        let reply = match cell.command {
            CellCommand::CREATE => {
                let reply = path.answer(0, &cell.payload);
                Cell::new(circuit.id(), CellCommand::CREATED, reply)
            }
            CellCommand::RELAY_EARLY => {
                let (hop, relay) = path.peel(&cell.payload).unwrap();
                assert_eq!(relay.relay_command(), Some(RelayCommand::Extend));
                let extend = ExtendPayload::parse(&relay.data).unwrap();
                let reply = path.answer(hop + 1, &extend.onion_skin);
                let payload = path.originate(hop, RelayCommand::Extended, 0, &reply);
                Cell::new(circuit.id(), CellCommand::RELAY, payload)
            }
            other => panic!("unexpected cell during build: {}", other),
        };
        circuit.handle_cell(reply).await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_path_names_and_directory() {
        let path = SimulatedPath::new(3);
        assert_eq!(path.names(), vec!["relay0", "relay1", "relay2"]);
        assert_eq!(path.directory().len(), 3);
    }

    #[tokio::test]
    async fn test_flaky_sink_toggles() {
        let (sink, mut rx) = FlakySink::new();
        sink.set_failing(true);
        assert!(sink.send_cell(CircuitId(1), CellCommand::RELAY, vec![]).is_err());
        sink.set_failing(false);
        sink.send_cell(CircuitId(1), CellCommand::RELAY, vec![]).unwrap();
        assert!(rx.recv().await.is_some());
    }
}
