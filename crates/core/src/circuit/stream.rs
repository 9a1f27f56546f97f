/// Stream bookkeeping for one circuit.
///
/// The circuit owns the table; consumers only see the callbacks in
/// [`StreamEvents`].

use super::types::IdAllocator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why a stream went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The exit sent RELAY_END with this reason code
    Remote(u8),

    /// We closed it
    Local,

    /// The circuit under it was destroyed or truncated
    CircuitClosed,
}

/// Consumer of events for one stream
pub trait StreamEvents: Send + Sync {
    fn connected(&self, _stream_id: u16) {}

    fn data_arrived(&self, stream_id: u16, data: &[u8]);

    fn disconnected(&self, _stream_id: u16, _reason: Disconnect) {}
}

/// Stream events as plain values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Connected { stream_id: u16 },
    Data { stream_id: u16, data: Vec<u8> },
    Disconnected { stream_id: u16, reason: Disconnect },
}

/// [`StreamEvents`] adapter that forwards everything to an mpsc channel
#[derive(Debug, Clone)]
pub struct StreamEventSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEventSender {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: StreamEvent) {
        // Receiver gone means nobody cares any more
        let _ = self.tx.send(event);
    }
}

impl StreamEvents for StreamEventSender {
    fn connected(&self, stream_id: u16) {
        self.forward(StreamEvent::Connected { stream_id });
    }

    fn data_arrived(&self, stream_id: u16, data: &[u8]) {
        self.forward(StreamEvent::Data {
            stream_id,
            data: data.to_vec(),
        });
    }

    fn disconnected(&self, stream_id: u16, reason: Disconnect) {
        self.forward(StreamEvent::Disconnected { stream_id, reason });
    }
}

/// Where a stream was opened to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Tcp { host: String, port: u16 },
    Directory,
}

impl std::fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Directory => f.write_str("directory"),
        }
    }
}

struct StreamEntry {
    consumer: Arc<dyn StreamEvents>,
    target: StreamTarget,
    connected: bool,
}

/// Stream id -> consumer
#[derive(Default)]
pub(crate) struct StreamTable {
    streams: BTreeMap<u16, StreamEntry>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick an id from the shared allocator that is free on this circuit
    pub fn allocate(&self, ids: &IdAllocator) -> Option<u16> {
        (0..u16::MAX)
            .map(|_| ids.next_stream_id())
            .find(|id| !self.streams.contains_key(id))
    }

    pub fn insert(&mut self, stream_id: u16, target: StreamTarget, consumer: Arc<dyn StreamEvents>) {
        self.streams.insert(
            stream_id,
            StreamEntry {
                consumer,
                target,
                connected: false,
            },
        );
    }

    pub fn get(&self, stream_id: u16) -> Option<Arc<dyn StreamEvents>> {
        self.streams.get(&stream_id).map(|entry| entry.consumer.clone())
    }

    pub fn contains(&self, stream_id: u16) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn target(&self, stream_id: u16) -> Option<&StreamTarget> {
        self.streams.get(&stream_id).map(|entry| &entry.target)
    }

    /// False if the stream is unknown or was already connected
    pub fn mark_connected(&mut self, stream_id: u16) -> bool {
        match self.streams.get_mut(&stream_id) {
            Some(entry) if !entry.connected => {
                entry.connected = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, stream_id: u16) -> Option<Arc<dyn StreamEvents>> {
        self.streams.remove(&stream_id).map(|entry| entry.consumer)
    }

    pub fn drain(&mut self) -> Vec<(u16, Arc<dyn StreamEvents>)> {
        std::mem::take(&mut self.streams)
            .into_iter()
            .map(|(id, entry)| (id, entry.consumer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Body of RELAY_BEGIN: `host:port` NUL, then four zero flag bytes
pub fn begin_payload(host: &str, port: u16) -> Vec<u8> {
    let target = format!("{}:{}", host, port);
    let mut payload = Vec::with_capacity(target.len() + 5);
    payload.extend_from_slice(target.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&[0u8; 4]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_payload() {
        let payload = begin_payload("example.com", 80);
        assert_eq!(payload, b"example.com:80\0\0\0\0\0");
    }

    #[test]
    fn test_table_allocate_skips_taken_ids() {
        let ids = IdAllocator::new();
        let (sender, _rx) = StreamEventSender::channel();
        let mut table = StreamTable::new();

        table.insert(2, StreamTarget::Directory, sender);
        assert_eq!(table.allocate(&ids), Some(1));
        assert_eq!(table.allocate(&ids), Some(3));
    }

    #[test]
    fn test_table_lifecycle() {
        let (sender, _rx) = StreamEventSender::channel();
        let mut table = StreamTable::new();
        table.insert(
            5,
            StreamTarget::Tcp {
                host: "example.com".into(),
                port: 443,
            },
            sender,
        );

        assert!(table.mark_connected(5));
        assert!(!table.mark_connected(5));
        assert!(!table.mark_connected(6));
        assert_eq!(table.target(5).map(ToString::to_string).as_deref(), Some("example.com:443"));

        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
        assert!(table.remove(5).is_none());
    }

    #[tokio::test]
    async fn test_event_sender_forwards() {
        let (sender, mut rx) = StreamEventSender::channel();
        sender.connected(3);
        sender.data_arrived(3, b"abc");
        sender.disconnected(3, Disconnect::Remote(6));

        assert_eq!(rx.recv().await, Some(StreamEvent::Connected { stream_id: 3 }));
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Data {
                stream_id: 3,
                data: b"abc".to_vec()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Disconnected {
                stream_id: 3,
                reason: Disconnect::Remote(6)
            })
        );
    }
}
