//! Outbound delivery pipeline.
//!
//! [`Outbox`] is the entry point: it queues while disconnected and, once
//! connected, picks a [`DeliveryPlan`] per message. Short text goes out as a
//! single message; long text is published as a Drive document with a link
//! back to the chat, falling back to `[i/N]`-prefixed chunks when publishing
//! fails. Everything network-facing goes through [`LarkTransport`] and
//! [`LarkSession`], so the pipeline runs unchanged against in-memory fakes.

pub mod chunker;
pub mod folders;
pub mod outbox;
pub mod publisher;
pub mod queue;
pub mod title;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use chunker::{chunk_text, compact_paragraphs, label_chunks, send_in_chunks};
pub use folders::{chat_folder_name, FolderResolver};
pub use outbox::{ConnectionState, DeliveryPlan, Outbox, SendStatus};
pub use publisher::{DocumentPublisher, PublishOutcome, PublishedDocument};
pub use queue::{DeadLetter, DeliveryQueue, PendingDelivery};
pub use title::{extract_title, extract_title_at, MAX_TITLE_CHARS};
pub use transport::{
    DriveEntry, DriveEntryKind, GrantTarget, LarkSession, LarkTransport, PermissionLevel,
};

/// Why the document path gave up. Each variant triggers the chunked fallback.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to write document artifact: {0}")]
    Artifact(#[from] std::io::Error),
    #[error("failed to upload document: {0:#}")]
    Upload(anyhow::Error),
    #[error("failed to announce document link: {0:#}")]
    Announce(anyhow::Error),
}

/// A delivery attempt that left nothing in the chat. The outbox requeues these.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport send failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("{publish}; chunked fallback also failed: {fallback:#}")]
    Publish {
        publish: PublishError,
        fallback: anyhow::Error,
    },
}
