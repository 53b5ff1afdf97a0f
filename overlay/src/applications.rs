//! The two kinds of process that make up an overlay.

pub mod registry;
pub use registry::{ExperimentPhase, Registry};

pub mod overlay_node;
pub use overlay_node::{NodeState, OverlayNode};
