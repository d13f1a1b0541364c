//! Collaborator interfaces the delivery pipeline depends on.
//!
//! [`LarkTransport`] covers the REST calls (messages, Drive, permissions,
//! chat metadata); [`LarkSession`] covers the long connection and exposes
//! its liveness as a watch signal. `LarkChannel` implements both against
//! the real API; tests substitute in-memory recorders.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::watch;

/// Kind of a Drive entry as reported by the folder listing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEntryKind {
    Folder,
    File,
    Doc,
    Other(String),
}

impl DriveEntryKind {
    pub fn from_api(kind: &str) -> Self {
        match kind {
            "folder" => Self::Folder,
            "file" => Self::File,
            "doc" | "docx" => Self::Doc,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One entry of a Drive folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEntry {
    pub name: String,
    pub kind: DriveEntryKind,
    pub token: String,
    pub parent_token: Option<String>,
}

/// What a permission grant targets. Maps to the `type` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantTarget {
    Folder,
    File,
}

impl GrantTarget {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::File => "file",
        }
    }
}

/// Permission level for a grant. Maps to the `perm` body field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    View,
    Edit,
    FullAccess,
}

impl PermissionLevel {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::FullAccess => "full_access",
        }
    }
}

/// REST operations against the chat platform.
#[async_trait]
pub trait LarkTransport: Send + Sync {
    /// Send one plain-text message to a chat.
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;

    /// Upload the file at `path` as `file_name`; `None` parent means the default location.
    /// Returns the new file token.
    async fn upload_file(
        &self,
        parent: Option<&str>,
        file_name: &str,
        size: u64,
        path: &Path,
    ) -> anyhow::Result<String>;

    /// Create a folder under `parent`, returning its token.
    async fn create_folder(&self, parent: &str, name: &str) -> anyhow::Result<String>;

    async fn list_folder(&self, parent: &str) -> anyhow::Result<Vec<DriveEntry>>;

    /// Grant `principal` (an open_id) access to `target`. Repeat grants may fail.
    async fn grant_access(
        &self,
        target: &str,
        kind: GrantTarget,
        principal: &str,
        level: PermissionLevel,
    ) -> anyhow::Result<()>;

    async fn chat_display_name(&self, chat_id: &str) -> anyhow::Result<String>;

    /// Entries at the default Drive location; only used to discover the workspace root.
    async fn list_root_entries(&self) -> anyhow::Result<Vec<DriveEntry>>;

    /// Browser link for an uploaded file token.
    fn file_link(&self, token: &str) -> String;
}

/// The long-lived event connection.
#[async_trait]
pub trait LarkSession: Send + Sync {
    /// Start establishing the connection. The returned receiver turns `true`
    /// once the session is live and back to `false` when it drops.
    async fn open(&self) -> anyhow::Result<watch::Receiver<bool>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_entry_kind_maps_api_strings() {
        assert_eq!(DriveEntryKind::from_api("folder"), DriveEntryKind::Folder);
        assert_eq!(DriveEntryKind::from_api("file"), DriveEntryKind::File);
        assert_eq!(DriveEntryKind::from_api("docx"), DriveEntryKind::Doc);
        assert_eq!(
            DriveEntryKind::from_api("bitable"),
            DriveEntryKind::Other("bitable".into())
        );
    }

    #[test]
    fn grant_enums_render_api_values() {
        assert_eq!(GrantTarget::Folder.as_api_str(), "folder");
        assert_eq!(GrantTarget::File.as_api_str(), "file");
        assert_eq!(PermissionLevel::FullAccess.as_api_str(), "full_access");
        assert_eq!(PermissionLevel::Edit.as_api_str(), "edit");
    }
}
