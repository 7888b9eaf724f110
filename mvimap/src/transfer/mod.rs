//! Transfer engine: shared cursor, change listener and batch pipeline

pub mod listener;
pub mod pipeline;
pub mod tracker;

pub use listener::{ListenerHandle, NotificationListener};
pub use pipeline::{BatchReport, TransferPipeline};
pub use tracker::{CursorWatch, MailboxTracker, TransferCursor};
