//! Peer-to-peer directory sync with content-addressed indices.

pub mod block;
pub mod broker;
pub mod index;
pub mod io;
pub mod peer;
pub mod proto;
pub mod scanner;
pub mod summary;

pub use block::{block_count, fingerprint, slice_file, Block, BLOCK_SIZE};
pub use broker::{Contact, Roster, RosterError};
pub use index::{merge, Comparison, Index, IndexError, MergeError};
pub use peer::{Peer, RequestedFile, TransferError};
pub use proto::{FrameError, Message, MessageReader, RecvError};
pub use scanner::{load_index, scan, store_index, ScanError, Scanner};
pub use summary::Summary;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
