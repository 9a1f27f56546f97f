use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use onioncell_common::config::crypto::{HASH_LEN, KEY_LEN, KEY_MATERIAL_LEN};
use onioncell_common::OnionError;
use sha1::{Digest, Sha1};

/// AES-128 in counter mode, big-endian counter, as every hop layer uses
pub type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// KDF-TOR: `SHA1(K0 | 0) | SHA1(K0 | 1) | ...` truncated to `len` bytes
pub fn kdf_tor(secret: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + HASH_LEN);
    let mut counter: u8 = 0;

    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }

    out.truncate(len);
    out
}

/// Key material derived from one completed handshake.
///
/// Layout of the expanded block: `KH | Df | Db | Kf | Kb`. `KH` is the
/// verification hash the peer echoes back; the other four seed the hop state.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub verifier: [u8; HASH_LEN],
    pub forward_digest: [u8; HASH_LEN],
    pub backward_digest: [u8; HASH_LEN],
    pub forward_key: [u8; KEY_LEN],
    pub backward_key: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Expand a shared secret into the fixed-order key block
    pub fn expand(shared_secret: &[u8]) -> Self {
        let block = kdf_tor(shared_secret, KEY_MATERIAL_LEN);
        let mut keys = Self {
            verifier: [0u8; HASH_LEN],
            forward_digest: [0u8; HASH_LEN],
            backward_digest: [0u8; HASH_LEN],
            forward_key: [0u8; KEY_LEN],
            backward_key: [0u8; KEY_LEN],
        };

        let (verifier, rest) = block.split_at(HASH_LEN);
        let (forward_digest, rest) = rest.split_at(HASH_LEN);
        let (backward_digest, rest) = rest.split_at(HASH_LEN);
        let (forward_key, backward_key) = rest.split_at(KEY_LEN);

        keys.verifier.copy_from_slice(verifier);
        keys.forward_digest.copy_from_slice(forward_digest);
        keys.backward_digest.copy_from_slice(backward_digest);
        keys.forward_key.copy_from_slice(forward_key);
        keys.backward_key.copy_from_slice(backward_key);
        keys
    }
}

// Key bytes stay out of logs
impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("verifier", &hex::encode(self.verifier))
            .finish_non_exhaustive()
    }
}

/// Running SHA-1 over every relay cell exchanged with one hop in one direction.
///
/// `snapshot` yields a tentative copy; assigning the copy back commits it.
#[derive(Clone)]
pub struct DigestState(Sha1);

impl DigestState {
    pub fn seeded(seed: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        Self(hasher)
    }

    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn absorb(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// First four bytes of the digest so far, without consuming the state
    pub fn prefix(&self) -> [u8; 4] {
        let digest = self.0.clone().finalize();
        [digest[0], digest[1], digest[2], digest[3]]
    }
}

impl std::fmt::Debug for DigestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DigestState({})", hex::encode(self.prefix()))
    }
}

/// Symmetric state for one hop: a cipher and a digest per direction
#[derive(Clone)]
pub struct HopCrypto {
    pub(crate) forward_cipher: Aes128Ctr,
    pub(crate) backward_cipher: Aes128Ctr,
    pub(crate) forward_digest: DigestState,
    pub(crate) backward_digest: DigestState,
}

impl HopCrypto {
    /// Ciphers start from a zero IV; digests are seeded with Df / Db
    pub fn from_key_material(keys: &KeyMaterial) -> Self {
        let iv = [0u8; 16];

        Self {
            forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&iv).into()),
            backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&iv).into()),
            forward_digest: DigestState::seeded(&keys.forward_digest),
            backward_digest: DigestState::seeded(&keys.backward_digest),
        }
    }

    /// Apply this hop's outbound keystream in place
    pub fn apply_forward(&mut self, data: &mut [u8]) {
        self.forward_cipher.apply_keystream(data);
    }

    /// Apply this hop's inbound keystream in place
    pub fn apply_backward(&mut self, data: &mut [u8]) {
        self.backward_cipher.apply_keystream(data);
    }

    pub fn forward_digest(&self) -> &DigestState {
        &self.forward_digest
    }

    pub fn backward_digest(&self) -> &DigestState {
        &self.backward_digest
    }
}

impl std::fmt::Debug for HopCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopCrypto")
            .field("forward_digest", &self.forward_digest)
            .field("backward_digest", &self.backward_digest)
            .field("ciphers", &"<AES-128-CTR>")
            .finish()
    }
}

/// Cryptographic errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Failed to seal onion skin")]
    SealFailed,

    #[error("Failed to open onion skin")]
    OpenFailed,

    #[error("Onion skin too short: {0} bytes")]
    MalformedSkin(usize),

    #[error("Handshake reply too short: expected {expected} bytes, got {actual}")]
    MalformedReply { expected: usize, actual: usize },

    #[error("Peer public value is not contributory")]
    InvalidPublicKey,

    #[error("Handshake verification hash mismatch")]
    VerificationFailed,
}

impl From<CryptoError> for OnionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::MalformedReply { .. }
            | CryptoError::InvalidPublicKey
            | CryptoError::VerificationFailed => OnionError::Handshake(err.to_string()),
            _ => OnionError::Crypto(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_tor_blocks() {
        let secret = b"shared secret";
        let out = kdf_tor(secret, 45);
        assert_eq!(out.len(), 45);

        let mut first = Sha1::new();
        first.update(secret);
        first.update([0u8]);
        assert_eq!(&out[..20], first.finalize().as_slice());

        let mut third = Sha1::new();
        third.update(secret);
        third.update([2u8]);
        assert_eq!(&out[40..45], &third.finalize()[..5]);
    }

    #[test]
    fn test_key_material_split_order() {
        let secret = [42u8; 32];
        let block = kdf_tor(&secret, KEY_MATERIAL_LEN);
        let keys = KeyMaterial::expand(&secret);

        assert_eq!(&block[0..20], &keys.verifier);
        assert_eq!(&block[20..40], &keys.forward_digest);
        assert_eq!(&block[40..60], &keys.backward_digest);
        assert_eq!(&block[60..76], &keys.forward_key);
        assert_eq!(&block[76..92], &keys.backward_key);
    }

    #[test]
    fn test_digest_snapshot_does_not_commit() {
        let state = DigestState::seeded(b"seed");
        let before = state.prefix();

        let mut tentative = state.snapshot();
        tentative.absorb(b"cell");

        assert_eq!(state.prefix(), before);
        assert_ne!(tentative.prefix(), before);
    }

    #[test]
    fn test_digest_determinism() {
        let mut a = DigestState::seeded(b"df");
        let mut b = DigestState::seeded(b"df");

        for cell in [&b"one"[..], b"two", b"three"] {
            a.absorb(cell);
            b.absorb(cell);
            assert_eq!(a.prefix(), b.prefix());
        }
    }

    #[test]
    fn test_ctr_layers_are_symmetric() {
        let keys = KeyMaterial::expand(b"hop secret");
        let mut client = HopCrypto::from_key_material(&keys);
        let mut relay = HopCrypto::from_key_material(&keys);

        let original = b"relay cell body".to_vec();
        let mut data = original.clone();
        client.apply_forward(&mut data);
        assert_ne!(data, original);

        relay.apply_forward(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_key_material_debug_hides_keys() {
        let keys = KeyMaterial::expand(b"secret");
        let rendered = format!("{:?}", keys);
        assert!(!rendered.contains(&hex::encode(keys.forward_key)));
    }
}
