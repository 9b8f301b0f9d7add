//! Message Streaming Module
//!
//! Pushes every committed message to the live subscribers of its channel
//! without polling. Delivery is best effort: a receiver that falls behind, or
//! misses events while the notifier is detached, is expected to catch up from
//! the message store.

mod manager;
mod types;

pub use manager::ChangeNotifier;
pub use types::ChangeEvent;
