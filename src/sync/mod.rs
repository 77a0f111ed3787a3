//! Durable replay of mutating operations.
//!
//! - `log`: the write-ahead queue of pending operations
//! - `coordinator`: page-side sync cycles (delegate or drain by hand)
//! - `background`: the dispatcher task that replays without a page
//! - `connectivity`: the shared online/offline signal

mod background;
mod connectivity;
mod coordinator;
mod events;
mod log;
mod operation;
mod replay;

pub use background::{BackgroundDispatcher, BackgroundHandle};
pub use connectivity::{restored, Connectivity};
pub use coordinator::SyncCoordinator;
pub use events::{RejectedOperation, SyncEvent, SyncPhase, SyncReport};
pub use log::OperationLog;
pub use operation::{sync_tag_for, OperationIntent, PendingOperation};
pub(crate) use replay::mirror_result;
pub use replay::{ReplayOutcome, Replayer};
