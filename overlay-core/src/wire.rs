//! The framed, type-tagged messages exchanged between the registry and the
//! overlay nodes.
//!
//! Every message on a stream is a 4-byte big-endian length followed by that
//! many bytes of payload. The first field of the payload is a [`MessageKind`]
//! tag. All integers are big-endian, strings carry an `i32` byte count
//! followed by UTF-8, and sequences carry an `i32` element count.

use crate::{
    routing::{RoutingEntry, RoutingError, RoutingTable},
    utility::BytesExt,
    NodeId, PeerAddress,
};
use std::fmt::{self, Display, Formatter};
use thiserror::Error as ThisError;

/// The number of bytes in the length prefix of a frame.
pub const LENGTH_OCTETS: usize = 4;

/// The largest payload a connection will accept unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// The status value carried by a failed registration, deregistration, or
/// setup report.
pub const FAILURE_STATUS: i32 = -1;

/// The largest packet count or counter value a message can carry. Counts
/// travel as non-negative `i32`s.
pub const MAX_COUNT: u32 = i32::MAX as u32;

/// The tag identifying each kind of message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    NodeRegisters = 2,
    RegistrationStatus = 3,
    NodeDeregisters = 4,
    DeregistrationStatus = 5,
    NodeManifest = 6,
    OverlaySetupStatus = 7,
    TaskInitiate = 8,
    DataPacket = 9,
    TaskFinished = 10,
    TrafficSummaryRequest = 11,
    TrafficSummaryReport = 12,
}

impl TryFrom<i32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Ok(match value {
            2 => NodeRegisters,
            3 => RegistrationStatus,
            4 => NodeDeregisters,
            5 => DeregistrationStatus,
            6 => NodeManifest,
            7 => OverlaySetupStatus,
            8 => TaskInitiate,
            9 => DataPacket,
            10 => TaskFinished,
            11 => TrafficSummaryRequest,
            12 => TrafficSummaryReport,
            tag => Err(ProtocolError::UnknownTag(tag))?,
        })
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A node's traffic counters at the moment it answered a summary request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSummary {
    pub id: NodeId,
    pub sent: u32,
    pub relayed: u32,
    pub sent_sum: i64,
    pub received: u32,
    pub received_sum: i64,
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A node asks to join the overlay, advertising where it listens.
    NodeRegisters { address: PeerAddress },
    /// The assigned ID, or [`FAILURE_STATUS`].
    RegistrationStatus { status: i32, info: String },
    NodeDeregisters { address: PeerAddress, id: NodeId },
    /// The removed ID, or [`FAILURE_STATUS`].
    DeregistrationStatus { status: i32, info: String },
    /// A node's finger table plus every ID currently in the overlay.
    NodeManifest {
        routing_table: RoutingTable,
        node_ids: Vec<NodeId>,
    },
    /// The reporting node's ID, or [`FAILURE_STATUS`].
    OverlaySetupStatus { status: i32, info: String },
    TaskInitiate { count: u32 },
    DataPacket {
        dst: NodeId,
        src: NodeId,
        payload: i32,
        trace: Vec<NodeId>,
    },
    TaskFinished { address: PeerAddress, id: NodeId },
    TrafficSummaryRequest,
    TrafficSummaryReport(TrafficSummary),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::NodeRegisters { .. } => MessageKind::NodeRegisters,
            Message::RegistrationStatus { .. } => MessageKind::RegistrationStatus,
            Message::NodeDeregisters { .. } => MessageKind::NodeDeregisters,
            Message::DeregistrationStatus { .. } => MessageKind::DeregistrationStatus,
            Message::NodeManifest { .. } => MessageKind::NodeManifest,
            Message::OverlaySetupStatus { .. } => MessageKind::OverlaySetupStatus,
            Message::TaskInitiate { .. } => MessageKind::TaskInitiate,
            Message::DataPacket { .. } => MessageKind::DataPacket,
            Message::TaskFinished { .. } => MessageKind::TaskFinished,
            Message::TrafficSummaryRequest => MessageKind::TrafficSummaryRequest,
            Message::TrafficSummaryReport(_) => MessageKind::TrafficSummaryReport,
        }
    }

    /// Serializes the payload: the tag followed by the message's fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Encoder::default();
        out.put_i32(self.kind() as i32);
        match self {
            Message::NodeRegisters { address } => out.put_address(address),
            Message::RegistrationStatus { status, info }
            | Message::DeregistrationStatus { status, info }
            | Message::OverlaySetupStatus { status, info } => {
                out.put_i32(*status);
                out.put_string(info);
            }
            Message::NodeDeregisters { address, id } | Message::TaskFinished { address, id } => {
                out.put_address(address);
                out.put_id(*id);
            }
            Message::NodeManifest {
                routing_table,
                node_ids,
            } => {
                out.put_len(routing_table.len());
                for entry in routing_table.entries() {
                    out.put_id(entry.id);
                    out.put_address(&entry.address);
                }
                out.put_ids(node_ids);
            }
            Message::TaskInitiate { count } => out.put_count(*count),
            Message::DataPacket {
                dst,
                src,
                payload,
                trace,
            } => {
                out.put_id(*dst);
                out.put_id(*src);
                out.put_i32(*payload);
                out.put_ids(trace);
            }
            Message::TrafficSummaryRequest => {}
            Message::TrafficSummaryReport(summary) => {
                out.put_id(summary.id);
                out.put_count(summary.sent);
                out.put_count(summary.relayed);
                out.put_i64(summary.sent_sum);
                out.put_count(summary.received);
                out.put_i64(summary.received_sum);
            }
        }
        out.0
    }

    /// Serializes the message with its length prefix, ready to be written to
    /// a stream.
    pub fn frame(&self) -> Vec<u8> {
        let payload = self.encode();
        let mut out = Vec::with_capacity(LENGTH_OCTETS + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Parses a payload produced by [`Message::encode`]. The whole payload
    /// must be consumed.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        const T: ProtocolError = ProtocolError::Truncated;

        let mut bytes = payload.iter().cloned();
        let kind = MessageKind::try_from(bytes.next_i32_be().ok_or(T)?)?;
        let message = match kind {
            MessageKind::NodeRegisters => Message::NodeRegisters {
                address: read_address(&mut bytes)?,
            },
            MessageKind::RegistrationStatus => Message::RegistrationStatus {
                status: bytes.next_i32_be().ok_or(T)?,
                info: read_string(&mut bytes)?,
            },
            MessageKind::NodeDeregisters => Message::NodeDeregisters {
                address: read_address(&mut bytes)?,
                id: read_id(&mut bytes)?,
            },
            MessageKind::DeregistrationStatus => Message::DeregistrationStatus {
                status: bytes.next_i32_be().ok_or(T)?,
                info: read_string(&mut bytes)?,
            },
            MessageKind::NodeManifest => {
                let entries = read_len(&mut bytes)?;
                let mut routing_table = RoutingTable::new();
                for _ in 0..entries {
                    let id = read_id(&mut bytes)?;
                    let address = read_address(&mut bytes)?;
                    routing_table.push(RoutingEntry::new(id, address))?;
                }
                Message::NodeManifest {
                    routing_table,
                    node_ids: read_ids(&mut bytes)?,
                }
            }
            MessageKind::OverlaySetupStatus => Message::OverlaySetupStatus {
                status: bytes.next_i32_be().ok_or(T)?,
                info: read_string(&mut bytes)?,
            },
            MessageKind::TaskInitiate => Message::TaskInitiate {
                count: read_count(&mut bytes)?,
            },
            MessageKind::DataPacket => Message::DataPacket {
                dst: read_id(&mut bytes)?,
                src: read_id(&mut bytes)?,
                payload: bytes.next_i32_be().ok_or(T)?,
                trace: read_ids(&mut bytes)?,
            },
            MessageKind::TaskFinished => Message::TaskFinished {
                address: read_address(&mut bytes)?,
                id: read_id(&mut bytes)?,
            },
            MessageKind::TrafficSummaryRequest => Message::TrafficSummaryRequest,
            MessageKind::TrafficSummaryReport => Message::TrafficSummaryReport(TrafficSummary {
                id: read_id(&mut bytes)?,
                sent: read_count(&mut bytes)?,
                relayed: read_count(&mut bytes)?,
                sent_sum: bytes.next_i64_be().ok_or(T)?,
                received: read_count(&mut bytes)?,
                received_sum: bytes.next_i64_be().ok_or(T)?,
            }),
        };

        let leftover = bytes.count();
        if leftover != 0 {
            Err(ProtocolError::TrailingBytes(leftover))?
        }
        Ok(message)
    }
}

/// Reads the payload length out of a frame's prefix, rejecting lengths
/// larger than `max`.
pub fn frame_length(prefix: [u8; LENGTH_OCTETS], max: usize) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        Err(ProtocolError::FrameTooLarge { len, max })?
    }
    Ok(len)
}

#[derive(Default)]
struct Encoder(Vec<u8>);

impl Encoder {
    fn put_i32(&mut self, n: i32) {
        self.0.extend_from_slice(&n.to_be_bytes());
    }

    /// Counts above [`MAX_COUNT`] do not fit the wire and are sent as
    /// [`MAX_COUNT`].
    fn put_count(&mut self, n: u32) {
        self.put_i32(n.min(MAX_COUNT) as i32);
    }

    fn put_i64(&mut self, n: i64) {
        self.0.extend_from_slice(&n.to_be_bytes());
    }

    fn put_len(&mut self, len: usize) {
        self.put_i32(len as i32);
    }

    fn put_id(&mut self, id: NodeId) {
        self.put_i32(id.as_status());
    }

    fn put_ids(&mut self, ids: &[NodeId]) {
        self.put_len(ids.len());
        for id in ids {
            self.put_id(*id);
        }
    }

    fn put_string(&mut self, s: &str) {
        self.put_len(s.len());
        self.0.extend_from_slice(s.as_bytes());
    }

    fn put_address(&mut self, address: &PeerAddress) {
        self.put_string(&address.host);
        self.put_i32(address.port as i32);
    }
}

fn read_len(bytes: &mut impl Iterator<Item = u8>) -> Result<usize, ProtocolError> {
    let len = bytes.next_i32_be().ok_or(ProtocolError::Truncated)?;
    usize::try_from(len).map_err(|_| ProtocolError::NegativeLength(len))
}

fn read_count(bytes: &mut impl Iterator<Item = u8>) -> Result<u32, ProtocolError> {
    let count = bytes.next_i32_be().ok_or(ProtocolError::Truncated)?;
    u32::try_from(count).map_err(|_| ProtocolError::NegativeCount(count))
}

fn read_id(bytes: &mut impl Iterator<Item = u8>) -> Result<NodeId, ProtocolError> {
    let raw = bytes.next_i32_be().ok_or(ProtocolError::Truncated)?;
    NodeId::try_from(raw).map_err(|_| ProtocolError::InvalidNodeId(raw))
}

fn read_ids(bytes: &mut impl Iterator<Item = u8>) -> Result<Vec<NodeId>, ProtocolError> {
    let len = read_len(bytes)?;
    // the count is untrusted, so only reserve what a sane trace could need
    let mut ids = Vec::with_capacity(len.min(crate::RING_SIZE as usize));
    for _ in 0..len {
        ids.push(read_id(bytes)?);
    }
    Ok(ids)
}

fn read_string(bytes: &mut impl Iterator<Item = u8>) -> Result<String, ProtocolError> {
    let len = read_len(bytes)?;
    let raw = bytes.next_bytes(len).ok_or(ProtocolError::Truncated)?;
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
}

fn read_address(bytes: &mut impl Iterator<Item = u8>) -> Result<PeerAddress, ProtocolError> {
    let host = read_string(bytes)?;
    let port = bytes.next_i32_be().ok_or(ProtocolError::Truncated)?;
    let port = u16::try_from(port).map_err(|_| ProtocolError::InvalidPort(port))?;
    Ok(PeerAddress::new(host, port))
}

/// A frame that could not be turned into a [`Message`]. The connection that
/// produced it is dropped.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown message tag {0}")]
    UnknownTag(i32),
    #[error("The payload ended before the message was complete")]
    Truncated,
    #[error("{0} bytes were left over after the message")]
    TrailingBytes(usize),
    #[error("A string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("A length field was negative: {0}")]
    NegativeLength(i32),
    #[error("A count field was negative: {0}")]
    NegativeCount(i32),
    #[error("{0} is not a valid node ID")]
    InvalidNodeId(i32),
    #[error("{0} is not a valid port")]
    InvalidPort(i32),
    #[error("The routing table is malformed: {0}")]
    RoutingTable(#[from] RoutingError),
    #[error("A frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}
