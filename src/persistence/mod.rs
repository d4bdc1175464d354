//! Durable storage of the document store.

mod queue;
pub(crate) mod writer;

pub use queue::{SaveError, SaveQueue, SaveResult};
pub use writer::{AtomicWriter, PersistError, WriteStep};
