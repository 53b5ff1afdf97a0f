use std::fmt::Display;
use thiserror::Error as ThisError;

/// The number of identifiers on the ring. IDs are drawn from `0..RING_SIZE`.
pub const RING_SIZE: u32 = 128;

/// A node's position on the identifier ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a node ID, checking that it lies on the ring.
    pub const fn new(id: u32) -> Result<Self, NodeIdError> {
        if id < RING_SIZE {
            Ok(Self(id))
        } else {
            Err(NodeIdError::OffRing(id as i64))
        }
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u32 {
        self.0
    }

    /// The value carried in signed status fields on the wire.
    pub fn as_status(self) -> i32 {
        self.0 as i32
    }
}

impl TryFrom<i32> for NodeId {
    type Error = NodeIdError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match u32::try_from(value) {
            Ok(id) => Self::new(id),
            Err(_) => Err(NodeIdError::OffRing(value as i64)),
        }
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("{0} is not an identifier on the ring of size {RING_SIZE}")]
    OffRing(i64),
}
