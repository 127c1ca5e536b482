pub mod blob;
pub mod event_log;
pub mod index;
pub mod results;

pub use blob::{BlobStore, FilesystemBlobStore};
pub use event_log::JsonlEventLog;
pub use index::{IndexStore, RedbIndexStore};
pub use results::ResultStore;
