use super::crypto::DigestState;
use onioncell_common::config::cell::{PAYLOAD_LEN, RELAY_DATA_MAX, RELAY_HEADER_LEN};
use onioncell_common::{OnionError, RouterDescriptor};
use std::net::Ipv4Addr;

const RECOGNIZED: std::ops::Range<usize> = 1..3;
const STREAM_ID: std::ops::Range<usize> = 3..5;
const DIGEST: std::ops::Range<usize> = 5..9;
const LENGTH: std::ops::Range<usize> = 9..11;

/// Relay sub-commands carried inside RELAY / RELAY_EARLY cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    EstablishIntro = 32,
    EstablishRendezvous = 33,
    Introduce1 = 34,
    Introduce2 = 35,
    Rendezvous1 = 36,
    Rendezvous2 = 37,
    IntroEstablished = 38,
    RendezvousEstablished = 39,
    IntroduceAck = 40,
}

impl RelayCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        let command = match value {
            1 => Self::Begin,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Connected,
            5 => Self::Sendme,
            6 => Self::Extend,
            7 => Self::Extended,
            8 => Self::Truncate,
            9 => Self::Truncated,
            10 => Self::Drop,
            11 => Self::Resolve,
            12 => Self::Resolved,
            13 => Self::BeginDir,
            32 => Self::EstablishIntro,
            33 => Self::EstablishRendezvous,
            34 => Self::Introduce1,
            35 => Self::Introduce2,
            36 => Self::Rendezvous1,
            37 => Self::Rendezvous2,
            38 => Self::IntroEstablished,
            39 => Self::RendezvousEstablished,
            40 => Self::IntroduceAck,
            _ => return None,
        };
        Some(command)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Commands that only make sense on a nonzero stream id
    pub fn is_stream_scoped(self) -> bool {
        matches!(
            self,
            Self::Begin
                | Self::Data
                | Self::End
                | Self::Connected
                | Self::Resolve
                | Self::Resolved
                | Self::BeginDir
        )
    }
}

impl std::fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Begin => "RELAY_BEGIN",
            Self::Data => "RELAY_DATA",
            Self::End => "RELAY_END",
            Self::Connected => "RELAY_CONNECTED",
            Self::Sendme => "RELAY_SENDME",
            Self::Extend => "RELAY_EXTEND",
            Self::Extended => "RELAY_EXTENDED",
            Self::Truncate => "RELAY_TRUNCATE",
            Self::Truncated => "RELAY_TRUNCATED",
            Self::Drop => "RELAY_DROP",
            Self::Resolve => "RELAY_RESOLVE",
            Self::Resolved => "RELAY_RESOLVED",
            Self::BeginDir => "RELAY_BEGIN_DIR",
            Self::EstablishIntro => "RELAY_COMMAND_ESTABLISH_INTRO",
            Self::EstablishRendezvous => "RELAY_COMMAND_ESTABLISH_RENDEZVOUS",
            Self::Introduce1 => "RELAY_COMMAND_INTRODUCE1",
            Self::Introduce2 => "RELAY_COMMAND_INTRODUCE2",
            Self::Rendezvous1 => "RELAY_COMMAND_RENDEZVOUS1",
            Self::Rendezvous2 => "RELAY_COMMAND_RENDEZVOUS2",
            Self::IntroEstablished => "RELAY_COMMAND_INTRO_ESTABLISHED",
            Self::RendezvousEstablished => "RELAY_COMMAND_RENDEZVOUS_ESTABLISHED",
            Self::IntroduceAck => "RELAY_COMMAND_INTRODUCE_ACK",
        };
        f.write_str(name)
    }
}

/// Reason carried in DESTROY cells and RELAY_TRUNCATED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DestroyReason {
    None = 0,
    Protocol = 1,
    Internal = 2,
    Requested = 3,
    Hibernating = 4,
    ResourceLimit = 5,
    ConnectFailed = 6,
    OrIdentity = 7,
    OrConnClosed = 8,
    Finished = 9,
    Timeout = 10,
    Destroyed = 11,
    NoSuchService = 12,
}

impl DestroyReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        let reason = match value {
            0 => Self::None,
            1 => Self::Protocol,
            2 => Self::Internal,
            3 => Self::Requested,
            4 => Self::Hibernating,
            5 => Self::ResourceLimit,
            6 => Self::ConnectFailed,
            7 => Self::OrIdentity,
            8 => Self::OrConnClosed,
            9 => Self::Finished,
            10 => Self::Timeout,
            11 => Self::Destroyed,
            12 => Self::NoSuchService,
            _ => return None,
        };
        Some(reason)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Protocol => "PROTOCOL",
            Self::Internal => "INTERNAL",
            Self::Requested => "REQUESTED",
            Self::Hibernating => "HIBERNATING",
            Self::ResourceLimit => "RESOURCELIMIT",
            Self::ConnectFailed => "CONNECTFAILED",
            Self::OrIdentity => "OR_IDENTITY",
            Self::OrConnClosed => "OR_CONN_CLOSED",
            Self::Finished => "FINISHED",
            Self::Timeout => "TIMEOUT",
            Self::Destroyed => "DESTROYED",
            Self::NoSuchService => "NOSUCHSERVICE",
        }
    }

    /// Human-readable name for a raw code, unknown codes included
    pub fn describe(code: u8) -> String {
        match Self::from_u8(code) {
            Some(reason) => reason.name().to_string(),
            None => format!("UNKNOWN({})", code),
        }
    }
}

/// Reason carried in RELAY_END
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectRefused = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
    NoRoute = 8,
    Hibernating = 9,
    Internal = 10,
    ResourceLimit = 11,
    ConnReset = 12,
    TorProtocol = 13,
    NotDirectory = 14,
}

impl EndReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        let reason = match value {
            1 => Self::Misc,
            2 => Self::ResolveFailed,
            3 => Self::ConnectRefused,
            4 => Self::ExitPolicy,
            5 => Self::Destroy,
            6 => Self::Done,
            7 => Self::Timeout,
            8 => Self::NoRoute,
            9 => Self::Hibernating,
            10 => Self::Internal,
            11 => Self::ResourceLimit,
            12 => Self::ConnReset,
            13 => Self::TorProtocol,
            14 => Self::NotDirectory,
            _ => return None,
        };
        Some(reason)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Misc => "MISC",
            Self::ResolveFailed => "RESOLVEFAILED",
            Self::ConnectRefused => "CONNECTREFUSED",
            Self::ExitPolicy => "EXITPOLICY",
            Self::Destroy => "DESTROY",
            Self::Done => "DONE",
            Self::Timeout => "TIMEOUT",
            Self::NoRoute => "NOROUTE",
            Self::Hibernating => "HIBERNATING",
            Self::Internal => "INTERNAL",
            Self::ResourceLimit => "RESOURCELIMIT",
            Self::ConnReset => "CONNRESET",
            Self::TorProtocol => "TORPROTOCOL",
            Self::NotDirectory => "NOTDIRECTORY",
        }
    }

    pub fn describe(code: u8) -> String {
        match Self::from_u8(code) {
            Some(reason) => reason.name().to_string(),
            None => format!("UNKNOWN({})", code),
        }
    }
}

/// A decrypted, recognised relay cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Raw command byte; see [`RelayCell::relay_command`]
    pub command: u8,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Parse a plaintext relay payload
    pub fn parse(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() != PAYLOAD_LEN {
            return Err(RelayError::WrongSize(buf.len()));
        }
        if !has_zero_recognized(buf) {
            return Err(RelayError::NotRecognized);
        }

        let length = u16::from_be_bytes([buf[LENGTH.start], buf[LENGTH.start + 1]]);
        if length as usize > RELAY_DATA_MAX {
            return Err(RelayError::BadLength(length));
        }

        let mut digest = [0u8; 4];
        digest.copy_from_slice(&buf[DIGEST]);

        Ok(Self {
            command: buf[0],
            stream_id: u16::from_be_bytes([buf[STREAM_ID.start], buf[STREAM_ID.start + 1]]),
            digest,
            data: buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length as usize].to_vec(),
        })
    }

    pub fn relay_command(&self) -> Option<RelayCommand> {
        RelayCommand::from_u8(self.command)
    }

    pub fn command_name(&self) -> String {
        match self.relay_command() {
            Some(command) => command.to_string(),
            None => format!("UNKNOWN({})", self.command),
        }
    }
}

/// Lay out a relay payload and stamp its digest.
///
/// The digest is computed over the full payload with the digest field zeroed,
/// using a snapshot of `digest`. The advanced snapshot is returned and must be
/// assigned back to the hop only once the cell has gone out.
pub fn build_relay(
    digest: &DigestState,
    command: u8,
    stream_id: u16,
    data: &[u8],
) -> Result<([u8; PAYLOAD_LEN], DigestState), RelayError> {
    if data.len() > RELAY_DATA_MAX {
        return Err(RelayError::PayloadTooLarge(data.len()));
    }

    let mut cell = [0u8; PAYLOAD_LEN];
    cell[0] = command;
    cell[STREAM_ID].copy_from_slice(&stream_id.to_be_bytes());
    cell[LENGTH].copy_from_slice(&(data.len() as u16).to_be_bytes());
    cell[RELAY_HEADER_LEN..RELAY_HEADER_LEN + data.len()].copy_from_slice(data);

    let mut next = digest.snapshot();
    next.absorb(&cell);
    cell[DIGEST].copy_from_slice(&next.prefix());

    Ok((cell, next))
}

/// Whether the two recognized bytes are zero
pub fn has_zero_recognized(buf: &[u8]) -> bool {
    buf.len() >= RELAY_HEADER_LEN && buf[RECOGNIZED].iter().all(|b| *b == 0)
}

/// Check a decrypted payload against one hop's running digest.
///
/// On a match the advanced digest state is returned for the caller to commit;
/// `digest` itself is never touched.
pub fn verify_digest(digest: &DigestState, buf: &[u8]) -> Option<DigestState> {
    if buf.len() != PAYLOAD_LEN || !has_zero_recognized(buf) {
        return None;
    }

    let mut carried = [0u8; 4];
    carried.copy_from_slice(&buf[DIGEST]);

    let mut stripped = [0u8; PAYLOAD_LEN];
    stripped.copy_from_slice(buf);
    stripped[DIGEST].fill(0);

    let mut next = digest.snapshot();
    next.absorb(&stripped);

    if next.prefix() == carried {
        Some(next)
    } else {
        None
    }
}

/// Body of RELAY_EXTEND: `ipv4 | port | onion skin | identity fingerprint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendPayload {
    pub address: Ipv4Addr,
    pub port: u16,
    pub onion_skin: Vec<u8>,
    pub identity: [u8; 20],
}

impl ExtendPayload {
    const FIXED_LEN: usize = 4 + 2 + 20;

    pub fn new(router: &RouterDescriptor, onion_skin: Vec<u8>) -> Self {
        Self {
            address: router.address,
            port: router.or_port,
            onion_skin,
            identity: *router.identity.as_bytes(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.onion_skin.len());
        out.extend_from_slice(&self.address.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.onion_skin);
        out.extend_from_slice(&self.identity);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() <= Self::FIXED_LEN {
            return Err(RelayError::MalformedExtend(buf.len()));
        }

        let skin_end = buf.len() - 20;
        let mut identity = [0u8; 20];
        identity.copy_from_slice(&buf[skin_end..]);

        Ok(Self {
            address: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            port: u16::from_be_bytes([buf[4], buf[5]]),
            onion_skin: buf[6..skin_end].to_vec(),
            identity,
        })
    }
}

/// Relay cell errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Relay cell has wrong size: {0} bytes")]
    WrongSize(usize),

    #[error("Relay cell not recognized")]
    NotRecognized,

    #[error("Relay length field out of range: {0}")]
    BadLength(u16),

    #[error("Malformed EXTEND payload: {0} bytes")]
    MalformedExtend(usize),
}

impl From<RelayError> for OnionError {
    fn from(err: RelayError) -> Self {
        OnionError::InvalidCell(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncell_common::Fingerprint;

    #[test]
    fn test_header_layout() {
        let digest = DigestState::seeded(b"df");
        let (cell, _) = build_relay(&digest, RelayCommand::Data.code(), 0x1234, b"hello").unwrap();

        assert_eq!(cell[0], 2);
        assert_eq!(&cell[1..3], &[0, 0]);
        assert_eq!(&cell[3..5], &[0x12, 0x34]);
        assert_eq!(&cell[9..11], &[0, 5]);
        assert_eq!(&cell[11..16], b"hello");
        assert!(cell[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_build_then_parse() {
        let digest = DigestState::seeded(b"df");
        let (cell, _) = build_relay(&digest, RelayCommand::Begin.code(), 7, b"example.com:80\0").unwrap();
        let parsed = RelayCell::parse(&cell).unwrap();

        assert_eq!(parsed.relay_command(), Some(RelayCommand::Begin));
        assert_eq!(parsed.stream_id, 7);
        assert_eq!(parsed.data, b"example.com:80\0");
    }

    #[test]
    fn test_digest_field_matches_sha1_chain() {
        use sha1::{Digest, Sha1};

        let seed = b"forward digest seed";
        let digest = DigestState::seeded(seed);
        let (cell, next) = build_relay(&digest, 2, 5, b"hello").unwrap();

        let parsed = RelayCell::parse(&cell).unwrap();
        assert_eq!(parsed.command, 2);
        assert_eq!(parsed.stream_id, 5);
        assert_eq!(parsed.data, b"hello");

        let mut zeroed = cell;
        zeroed[5..9].fill(0);
        let expected = Sha1::new().chain_update(seed).chain_update(zeroed).finalize();
        assert_eq!(&cell[5..9], &expected[..4]);
        assert_eq!(&next.prefix()[..], &cell[5..9]);

        // second cell continues the same chain
        let (second, _) = build_relay(&next, 2, 5, b"world").unwrap();
        let mut second_zeroed = second;
        second_zeroed[5..9].fill(0);
        let expected = Sha1::new()
            .chain_update(seed)
            .chain_update(zeroed)
            .chain_update(second_zeroed)
            .finalize();
        assert_eq!(&second[5..9], &expected[..4]);
    }

    #[test]
    fn test_build_does_not_commit_digest() {
        let digest = DigestState::seeded(b"df");
        let before = digest.prefix();
        let (_, next) = build_relay(&digest, 2, 1, b"x").unwrap();

        assert_eq!(digest.prefix(), before);
        assert_ne!(next.prefix(), before);
    }

    #[test]
    fn test_verify_matches_peer_digest() {
        let sender = DigestState::seeded(b"db");
        let receiver = DigestState::seeded(b"db");
        let (cell, sender_next) = build_relay(&sender, RelayCommand::Data.code(), 3, b"payload").unwrap();

        let receiver_next = verify_digest(&receiver, &cell).unwrap();
        assert_eq!(receiver_next.prefix(), sender_next.prefix());
    }

    #[test]
    fn test_verify_rejects_other_hop() {
        let sender = DigestState::seeded(b"hop one");
        let other = DigestState::seeded(b"hop two");
        let (cell, _) = build_relay(&sender, RelayCommand::Data.code(), 3, b"payload").unwrap();

        assert!(verify_digest(&other, &cell).is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let digest = DigestState::seeded(b"df");
        let data = vec![0u8; RELAY_DATA_MAX + 1];
        assert_eq!(
            build_relay(&digest, 2, 1, &data).unwrap_err(),
            RelayError::PayloadTooLarge(RELAY_DATA_MAX + 1)
        );
        assert!(build_relay(&digest, 2, 1, &data[..RELAY_DATA_MAX]).is_ok());
    }

    #[test]
    fn test_parse_rejects_nonzero_recognized() {
        let mut cell = [0u8; PAYLOAD_LEN];
        cell[2] = 1;
        assert_eq!(RelayCell::parse(&cell).unwrap_err(), RelayError::NotRecognized);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let mut cell = [0u8; PAYLOAD_LEN];
        cell[9..11].copy_from_slice(&499u16.to_be_bytes());
        assert_eq!(RelayCell::parse(&cell).unwrap_err(), RelayError::BadLength(499));
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(RelayCommand::from_u8(40), Some(RelayCommand::IntroduceAck));
        assert_eq!(RelayCommand::from_u8(14), None);
        assert_eq!(RelayCommand::EstablishRendezvous.code(), 33);
        assert_eq!(DestroyReason::describe(3), "REQUESTED");
        assert_eq!(DestroyReason::describe(200), "UNKNOWN(200)");
        assert_eq!(EndReason::from_u8(6), Some(EndReason::Done));
    }

    #[test]
    fn test_extend_payload_layout() {
        let router = RouterDescriptor::new(
            "middle",
            Ipv4Addr::new(10, 1, 2, 3),
            9001,
            Fingerprint::from_bytes([0xAB; 20]),
            [0u8; 32],
        );
        let payload = ExtendPayload::new(&router, vec![5u8; 80]);
        let encoded = payload.encode();

        assert_eq!(encoded.len(), 106);
        assert_eq!(&encoded[..4], &[10, 1, 2, 3]);
        assert_eq!(&encoded[4..6], &9001u16.to_be_bytes());
        assert_eq!(&encoded[86..], &[0xAB; 20]);
        assert_eq!(ExtendPayload::parse(&encoded).unwrap(), payload);
    }
}
