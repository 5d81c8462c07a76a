//! ot/mod.rs
//!
//! The operational-transformation boundary.
//!
//! - **op**: json0-style operations and how they apply to a snapshot.
//! - **transport**: the contract an OT engine fulfils for a document.
//! - **memory**: an in-process engine hosting authoritative documents,
//!   used by tests and the demo.

pub mod memory;
pub mod op;
pub mod transport;

pub use memory::{MemoryBackend, MemoryClient, MemoryTransport};
pub use op::{key_path, Op, Path, PathSegment};
pub use transport::{ChangeOrigin, FocusTarget, Transport, TransportDoc, TransportEvent};
