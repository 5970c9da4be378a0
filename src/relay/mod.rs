//! Per-connection TCP relaying: queues, sessions, liveness and the
//! listener/registry glue that ties inbound connections to sessions.

pub mod heartbeat;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod session;

pub use listener::{ClientLink, ConnectionEvents};
pub use queue::{PacketQueue, Push};
pub use registry::{Registry, RegistryHandle};
pub use session::{Lifecycle, RelaySession};

/// Identifier the listener assigns to an inbound connection. Allocated from
/// a counter, so it is never reused while the process runs.
pub type ConnectionId = u64;

pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;
