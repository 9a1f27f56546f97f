use crate::{DomainError, Fingerprint};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};

/// What the client knows about a relay: where it listens and which keys it holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDescriptor {
    /// Directory nickname
    pub nickname: String,

    /// IPv4 address of the OR port
    pub address: Ipv4Addr,

    /// OR port
    pub or_port: u16,

    /// Identity fingerprint, carried in EXTEND cells
    pub identity: Fingerprint,

    /// X25519 onion key used to seal handshake requests
    pub onion_key: [u8; 32],
}

impl RouterDescriptor {
    pub fn new(
        nickname: impl Into<String>,
        address: Ipv4Addr,
        or_port: u16,
        identity: Fingerprint,
        onion_key: [u8; 32],
    ) -> Self {
        Self {
            nickname: nickname.into(),
            address,
            or_port,
            identity,
            onion_key,
        }
    }

    /// Build a descriptor from the textual forms a directory hands out
    pub fn parse(
        nickname: &str,
        address: Ipv4Addr,
        or_port: u16,
        identity_hex: &str,
        onion_key_hex: &str,
    ) -> Result<Self, DomainError> {
        let identity = Fingerprint::from_hex(identity_hex)?;
        let key_bytes = hex::decode(onion_key_hex)
            .map_err(|err| DomainError::InvalidFingerprintHex(err.to_string()))?;
        let onion_key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| DomainError::InvalidOnionKey(key_bytes.len()))?;

        Ok(Self::new(nickname, address, or_port, identity, onion_key))
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.or_port)
    }
}

impl std::fmt::Display for RouterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.nickname, self.socket_addr())
    }
}
