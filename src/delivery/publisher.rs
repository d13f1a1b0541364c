//! Publish long content as a Drive document and post its link to the chat.
//!
//! The body is written to a temporary `.md` file that is removed when the
//! publish attempt ends, whichever way it ends. Any failure on the document
//! path falls back to chunked text over the original content.

use super::chunker::{compact_paragraphs, send_in_chunks};
use super::folders::FolderResolver;
use super::title::extract_title;
use super::transport::{GrantTarget, LarkTransport, PermissionLevel};
use super::{DeliveryError, PublishError};
use crate::config::{DeliveryConfig, DocumentConfig};
use crate::util::{char_len, sanitize_name, take_chars};
use chrono::{DateTime, Local, TimeZone};
use std::sync::Arc;
use std::time::Duration;

/// File names keep at most this many characters of the title.
const FILE_STEM_MAX_CHARS: usize = 50;
const ARTIFACT_PREFIX: &str = "lark-courier-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDocument {
    pub file_name: String,
    pub token: String,
    pub link: String,
    /// `None` when the document landed in the default Drive location.
    pub folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Document(PublishedDocument),
    /// The document path failed and the content went out as `chunks` messages.
    Chunked { chunks: usize, reason: String },
}

/// `{sanitized title, at most 50 chars}_{yyyyMMddHHmmss}.md`
pub fn document_file_name<Tz: TimeZone>(title: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let sanitized = sanitize_name(title);
    let stem = take_chars(&sanitized, FILE_STEM_MAX_CHARS).trim();
    let stem = if stem.is_empty() { "document" } else { stem };
    format!("{stem}_{}.md", now.format("%Y%m%d%H%M%S"))
}

fn announcement(doc: &PublishedDocument, content_chars: usize) -> String {
    format!(
        "📄 Long reply ({content_chars} chars) saved as a document: {}\n{}",
        doc.file_name, doc.link
    )
}

pub struct DocumentPublisher {
    transport: Arc<dyn LarkTransport>,
    folders: FolderResolver,
    chunk_max_length: usize,
    chunk_delay: Duration,
    title_fallback_label: String,
    compact_paragraphs: bool,
}

impl DocumentPublisher {
    pub fn new(
        transport: Arc<dyn LarkTransport>,
        delivery: &DeliveryConfig,
        documents: &DocumentConfig,
    ) -> Self {
        let folders = FolderResolver::new(
            Arc::clone(&transport),
            documents.parent_folder_name.clone(),
            documents.admin_open_id.clone(),
        );
        Self {
            transport,
            folders,
            chunk_max_length: delivery.chunk_max_length,
            chunk_delay: delivery.chunk_delay(),
            title_fallback_label: documents.title_fallback_label.clone(),
            compact_paragraphs: documents.compact_paragraphs,
        }
    }

    pub fn folders(&self) -> &FolderResolver {
        &self.folders
    }

    /// Publish `content` as a document, or chunk it if that fails.
    ///
    /// Errors only when nothing reached the chat: the document path failed
    /// and the chunked fallback failed too.
    pub async fn publish(
        &self,
        chat_id: &str,
        content: &str,
    ) -> Result<PublishOutcome, DeliveryError> {
        match self.publish_document(chat_id, content).await {
            Ok(doc) => {
                tracing::info!(
                    chat_id,
                    length = char_len(content),
                    file_name = %doc.file_name,
                    "Published long message as document"
                );
                Ok(PublishOutcome::Document(doc))
            }
            Err(publish) => {
                tracing::warn!(chat_id, "Document publish failed, sending in chunks: {publish}");
                let reason = publish.to_string();
                match self.send_chunked(chat_id, content).await {
                    Ok(chunks) => Ok(PublishOutcome::Chunked { chunks, reason }),
                    Err(fallback) => Err(DeliveryError::Publish { publish, fallback }),
                }
            }
        }
    }

    pub async fn send_chunked(&self, chat_id: &str, content: &str) -> anyhow::Result<usize> {
        send_in_chunks(
            self.transport.as_ref(),
            chat_id,
            content,
            self.chunk_max_length,
            self.chunk_delay,
        )
        .await
    }

    async fn publish_document(
        &self,
        chat_id: &str,
        content: &str,
    ) -> Result<PublishedDocument, PublishError> {
        let folder = self.folders.resolve_chat_folder(chat_id).await;
        let title = extract_title(content, &self.title_fallback_label);
        let file_name = document_file_name(&title, &Local::now());

        let body = if self.compact_paragraphs {
            compact_paragraphs(content)
        } else {
            content.to_string()
        };

        // Removed on drop, so every return below cleans it up.
        let artifact = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .suffix(".md")
            .tempfile()?;
        tokio::fs::write(artifact.path(), body.as_bytes()).await?;

        let token = self
            .transport
            .upload_file(
                folder.as_deref(),
                &file_name,
                body.len() as u64,
                artifact.path(),
            )
            .await
            .map_err(PublishError::Upload)?;
        drop(artifact);

        self.folders
            .grant_admin(&token, GrantTarget::File, PermissionLevel::Edit)
            .await;

        let doc = PublishedDocument {
            link: self.transport.file_link(&token),
            file_name,
            token,
            folder,
        };
        self.transport
            .send_text(chat_id, &announcement(&doc, char_len(content)))
            .await
            .map_err(PublishError::Announce)?;

        Ok(doc)
    }
}
