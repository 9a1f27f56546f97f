use super::crypto::{CryptoError, KeyMaterial};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use onioncell_common::config::crypto::{DH_LEN, HANDSHAKE_REPLY_LEN, HASH_LEN};
use onioncell_common::RouterDescriptor;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Seals the client's handshake request to a relay's onion key
pub trait OnionSkinSealer: Send + Sync {
    fn seal(&self, router: &RouterDescriptor, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Anonymous sealed box: ephemeral X25519 to the recipient key, a keyed
/// BLAKE3 derivation, then ChaCha20-Poly1305.
///
/// Output layout: `ephemeral public (32) | ciphertext | tag (16)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedBox;

impl SealedBox {
    const DOMAIN: &'static [u8] = b"onioncell onion skin v1";
    pub(crate) const TAG_LEN: usize = 16;

    pub(crate) fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(shared);
        hasher.update(Self::DOMAIN);
        hasher.update(ephemeral);
        hasher.update(recipient);
        *hasher.finalize().as_bytes()
    }

    /// Seal `plaintext` so only the holder of `recipient`'s secret can read it
    pub fn seal_to(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let key = Self::derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient);
        let cipher = ChaCha20Poly1305::new(&key.into());
        // A fresh key per box, so a fixed nonce never repeats under one key
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
            .map_err(|_| CryptoError::SealFailed)?;

        let mut out = Vec::with_capacity(DH_LEN + ciphertext.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl OnionSkinSealer for SealedBox {
    fn seal(&self, router: &RouterDescriptor, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Self::seal_to(&router.onion_key, plaintext)
    }
}

/// Client side of a handshake that has been sent but not answered
pub struct PendingHandshake {
    secret: EphemeralSecret,
    router: RouterDescriptor,
}

impl PendingHandshake {
    pub fn router(&self) -> &RouterDescriptor {
        &self.router
    }
}

impl std::fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("router", &self.router.nickname)
            .finish_non_exhaustive()
    }
}

/// Generate an ephemeral key pair and seal `g^x` to the router's onion key.
///
/// Returns the pending state and the request bytes to send.
pub fn begin_handshake(
    sealer: &dyn OnionSkinSealer,
    router: &RouterDescriptor,
) -> Result<(PendingHandshake, Vec<u8>), CryptoError> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let request = sealer.seal(router, public.as_bytes())?;

    Ok((
        PendingHandshake {
            secret,
            router: router.clone(),
        },
        request,
    ))
}

/// Finish a handshake from the `g^y | KH` reply.
///
/// With `strict` set, the derived verification hash must equal the KH the
/// relay sent. Trailing bytes after the reply (cell padding) are ignored.
pub fn complete_handshake(
    pending: PendingHandshake,
    reply: &[u8],
    strict: bool,
) -> Result<(RouterDescriptor, KeyMaterial), CryptoError> {
    if reply.len() < HANDSHAKE_REPLY_LEN {
        return Err(CryptoError::MalformedReply {
            expected: HANDSHAKE_REPLY_LEN,
            actual: reply.len(),
        });
    }

    let mut peer_public = [0u8; DH_LEN];
    peer_public.copy_from_slice(&reply[..DH_LEN]);
    let claimed = &reply[DH_LEN..DH_LEN + HASH_LEN];

    let shared = pending.secret.diffie_hellman(&PublicKey::from(peer_public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let keys = KeyMaterial::expand(shared.as_bytes());
    if strict && !bool::from(keys.verifier.ct_eq(claimed)) {
        return Err(CryptoError::VerificationFailed);
    }

    Ok((pending.router, keys))
}
