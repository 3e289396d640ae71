//! Native handle ownership
//!
//! Every native resource the engine hands out is wrapped in a typed handle and
//! tracked in a [`HandleRegistry`]. The registry records each handle's parent
//! at creation and is the place release-order violations are reported.

mod handle;
mod registry;

pub use handle::{ChannelHandle, SessionHandle};
pub use registry::{HandleEntry, HandleEvent, HandleId, HandleKind, HandleRegistry, OrderingPolicy};
