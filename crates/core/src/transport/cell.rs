use crate::circuit::CircuitId;
use onioncell_common::config::cell::{PAYLOAD_LEN, VARIABLE_LENGTH_THRESHOLD, VERSIONS_COMMAND};
use onioncell_common::config::link::WIDE_CIRCUIT_ID_VERSION;
use onioncell_common::OnionError;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Outer cell command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCommand(pub u8);

impl CellCommand {
    pub const PADDING: Self = Self(0);
    pub const CREATE: Self = Self(1);
    pub const CREATED: Self = Self(2);
    pub const RELAY: Self = Self(3);
    pub const DESTROY: Self = Self(4);
    pub const CREATE_FAST: Self = Self(5);
    pub const CREATED_FAST: Self = Self(6);
    pub const VERSIONS: Self = Self(VERSIONS_COMMAND);
    pub const NETINFO: Self = Self(8);
    pub const RELAY_EARLY: Self = Self(9);
    pub const CREATE2: Self = Self(10);
    pub const CREATED2: Self = Self(11);
    pub const VPADDING: Self = Self(128);
    pub const CERTS: Self = Self(129);
    pub const AUTH_CHALLENGE: Self = Self(130);
    pub const AUTHENTICATE: Self = Self(131);

    /// VERSIONS and everything from 128 up carry a length prefix
    pub fn is_variable_length(self) -> bool {
        self == Self::VERSIONS || self.0 >= VARIABLE_LENGTH_THRESHOLD
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PADDING => "PADDING",
            Self::CREATE => "CREATE",
            Self::CREATED => "CREATED",
            Self::RELAY => "RELAY",
            Self::DESTROY => "DESTROY",
            Self::CREATE_FAST => "CREATE_FAST",
            Self::CREATED_FAST => "CREATED_FAST",
            Self::VERSIONS => "VERSIONS",
            Self::NETINFO => "NETINFO",
            Self::RELAY_EARLY => "RELAY_EARLY",
            Self::CREATE2 => "CREATE2",
            Self::CREATED2 => "CREATED2",
            Self::VPADDING => "VPADDING",
            Self::CERTS => "CERTS",
            Self::AUTH_CHALLENGE => "AUTH_CHALLENGE",
            Self::AUTHENTICATE => "AUTHENTICATE",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for CellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// One link-level cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circuit_id: CircuitId,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

/// Width of the circuit id field for a link version
pub fn circuit_id_len(link_version: u16) -> usize {
    if link_version < WIDE_CIRCUIT_ID_VERSION {
        2
    } else {
        4
    }
}

impl Cell {
    pub fn new(circuit_id: CircuitId, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// VERSIONS listing the given link versions
    pub fn versions(versions: &[u16]) -> Self {
        let payload = versions.iter().flat_map(|v| v.to_be_bytes()).collect();
        Self::new(CircuitId(0), CellCommand::VERSIONS, payload)
    }

    /// NETINFO: timestamp, the peer's address as we see it, then our own
    /// addresses (we advertise one unspecified IPv4 address)
    pub fn netinfo(timestamp: u32, peer: Ipv4Addr, ours: Ipv4Addr) -> Self {
        let mut payload = Vec::with_capacity(4 + 6 + 1 + 6);
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload.extend_from_slice(&[4, 4]);
        payload.extend_from_slice(&peer.octets());
        payload.extend_from_slice(&[1, 4, 4]);
        payload.extend_from_slice(&ours.octets());
        Self::new(CircuitId(0), CellCommand::NETINFO, payload)
    }

    /// Reject payloads that cannot be framed
    pub fn check_payload(&self) -> Result<(), CellError> {
        if self.command.is_variable_length() {
            if self.payload.len() > u16::MAX as usize {
                return Err(CellError::PayloadTooLarge {
                    command: self.command.0,
                    len: self.payload.len(),
                });
            }
        } else if self.payload.len() > PAYLOAD_LEN {
            return Err(CellError::PayloadTooLarge {
                command: self.command.0,
                len: self.payload.len(),
            });
        }
        Ok(())
    }

    /// Serialise for the wire. VERSIONS always uses a 2-byte circuit id;
    /// fixed-size payloads are zero-padded to 509 bytes.
    pub fn encode(&self, link_version: u16) -> Result<Vec<u8>, CellError> {
        self.check_payload()?;

        let id_len = if self.command == CellCommand::VERSIONS {
            2
        } else {
            circuit_id_len(link_version)
        };

        let mut out = Vec::with_capacity(id_len + 3 + PAYLOAD_LEN);
        if id_len == 2 {
            let id = u16::try_from(self.circuit_id.as_u32())
                .map_err(|_| CellError::CircuitIdOverflow(self.circuit_id.as_u32()))?;
            out.extend_from_slice(&id.to_be_bytes());
        } else {
            out.extend_from_slice(&self.circuit_id.as_u32().to_be_bytes());
        }
        out.push(self.command.0);

        if self.command.is_variable_length() {
            out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.payload);
        } else {
            out.extend_from_slice(&self.payload);
            out.resize(id_len + 1 + PAYLOAD_LEN, 0);
        }

        Ok(out)
    }
}

/// Read one cell. Pass a version below 4 for the initial VERSIONS exchange.
pub async fn read_cell<R>(reader: &mut R, link_version: u16) -> Result<Cell, CellError>
where
    R: AsyncRead + Unpin,
{
    let circuit_id = if circuit_id_len(link_version) == 2 {
        reader.read_u16().await? as u32
    } else {
        reader.read_u32().await?
    };
    let command = CellCommand(reader.read_u8().await?);

    let len = if command.is_variable_length() {
        reader.read_u16().await? as usize
    } else {
        PAYLOAD_LEN
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Cell::new(CircuitId(circuit_id), command, payload))
}

/// Parse a VERSIONS payload into its list of versions
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>, CellError> {
    if payload.len() % 2 != 0 {
        return Err(CellError::Malformed(format!(
            "VERSIONS payload has odd length {}",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Cell framing errors
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload of {len} bytes too large for command {command}")]
    PayloadTooLarge { command: u8, len: usize },

    #[error("Circuit id {0:#x} does not fit in 2 bytes")]
    CircuitIdOverflow(u32),

    #[error("Malformed cell: {0}")]
    Malformed(String),
}

impl From<CellError> for OnionError {
    fn from(err: CellError) -> Self {
        match err {
            CellError::Io(e) => OnionError::Io(e),
            other => OnionError::InvalidCell(other.to_string()),
        }
    }
}
