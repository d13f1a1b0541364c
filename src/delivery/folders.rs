//! Per-chat Drive folders under one shared parent, with process-lifetime caches.
//!
//! Layout: `{workspace root}/{parent_folder_name}/{chat name}_{last 6 of chat id}`.
//! Resolution never fails loudly: any error degrades to `None`, meaning the
//! document goes to the default location instead.
//!
//! The name and folder caches are never evicted. Their size is bounded by the
//! number of distinct chats this process delivers to.

use super::transport::{DriveEntryKind, GrantTarget, LarkTransport, PermissionLevel};
use crate::util::{last_chars, sanitize_name};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Chat ids are disambiguated by this many trailing characters.
const CHAT_SUFFIX_CHARS: usize = 6;

/// `{sanitized name}_{last 6 chars of chat id}`.
pub fn chat_folder_name(display_name: &str, chat_id: &str) -> String {
    format!(
        "{}_{}",
        sanitize_name(display_name),
        last_chars(chat_id, CHAT_SUFFIX_CHARS)
    )
}

pub struct FolderResolver {
    transport: Arc<dyn LarkTransport>,
    parent_folder_name: String,
    admin_open_id: Option<String>,
    group_names: Mutex<HashMap<String, String>>,
    folders: Mutex<HashMap<String, String>>,
    parent_token: OnceCell<String>,
    /// Serializes lookup-or-create so a chat never gets two folders.
    resolving: tokio::sync::Mutex<()>,
}

impl FolderResolver {
    pub fn new(
        transport: Arc<dyn LarkTransport>,
        parent_folder_name: impl Into<String>,
        admin_open_id: Option<String>,
    ) -> Self {
        Self {
            transport,
            parent_folder_name: parent_folder_name.into(),
            admin_open_id: admin_open_id.filter(|id| !id.trim().is_empty()),
            group_names: Mutex::new(HashMap::new()),
            folders: Mutex::new(HashMap::new()),
            parent_token: OnceCell::new(),
            resolving: tokio::sync::Mutex::new(()),
        }
    }

    /// Folder token for `chat_id`, or `None` to use the default location.
    pub async fn resolve_chat_folder(&self, chat_id: &str) -> Option<String> {
        if let Some(token) = self.cached_folder(chat_id) {
            return Some(token);
        }

        let _guard = self.resolving.lock().await;
        // Another caller may have finished while we waited.
        if let Some(token) = self.cached_folder(chat_id) {
            return Some(token);
        }

        match self.lookup_or_create(chat_id).await {
            Ok(token) => {
                self.folders
                    .lock()
                    .insert(chat_id.to_string(), token.clone());
                Some(token)
            }
            Err(err) => {
                tracing::warn!(chat_id, "Folder resolution failed, using default location: {err:#}");
                None
            }
        }
    }

    pub fn cached_folder(&self, chat_id: &str) -> Option<String> {
        self.folders.lock().get(chat_id).cloned()
    }

    /// Shared parent token once resolved.
    pub fn parent_token(&self) -> Option<&str> {
        self.parent_token.get().map(String::as_str)
    }

    /// Display name for a chat; the chat id suffix when the lookup fails.
    pub async fn group_name(&self, chat_id: &str) -> String {
        if let Some(name) = self.group_names.lock().get(chat_id).cloned() {
            return name;
        }

        match self.transport.chat_display_name(chat_id).await {
            Ok(name) if !name.trim().is_empty() => {
                self.group_names
                    .lock()
                    .insert(chat_id.to_string(), name.clone());
                name
            }
            Ok(_) => last_chars(chat_id, CHAT_SUFFIX_CHARS).to_string(),
            Err(err) => {
                tracing::debug!(chat_id, "Chat name lookup failed: {err:#}");
                last_chars(chat_id, CHAT_SUFFIX_CHARS).to_string()
            }
        }
    }

    /// Best-effort grant to the configured admin. Failures usually mean the
    /// grant already exists and are not retried.
    pub async fn grant_admin(&self, target: &str, kind: GrantTarget, level: PermissionLevel) {
        let Some(admin) = self.admin_open_id.as_deref() else {
            return;
        };
        if let Err(err) = self
            .transport
            .grant_access(target, kind, admin, level)
            .await
        {
            tracing::debug!(
                target,
                kind = kind.as_api_str(),
                "Permission grant skipped (likely already granted): {err:#}"
            );
        }
    }

    async fn lookup_or_create(&self, chat_id: &str) -> anyhow::Result<String> {
        let display_name = self.group_name(chat_id).await;
        let folder_name = chat_folder_name(&display_name, chat_id);
        let parent = self.resolve_parent().await?;

        let existing = self
            .transport
            .list_folder(&parent)
            .await
            .context("listing shared parent folder")?
            .into_iter()
            .find(|entry| entry.kind == DriveEntryKind::Folder && entry.name == folder_name);

        let token = match existing {
            Some(entry) => {
                tracing::debug!(chat_id, folder = %folder_name, "Reusing chat folder");
                entry.token
            }
            None => {
                let token = self
                    .transport
                    .create_folder(&parent, &folder_name)
                    .await
                    .with_context(|| format!("creating chat folder {folder_name}"))?;
                tracing::info!(chat_id, folder = %folder_name, "Created chat folder");
                token
            }
        };

        self.grant_admin(&token, GrantTarget::Folder, PermissionLevel::FullAccess)
            .await;
        Ok(token)
    }

    /// Memoized on success only; a failed discovery is retried next time.
    async fn resolve_parent(&self) -> anyhow::Result<String> {
        self.parent_token
            .get_or_try_init(|| self.discover_parent())
            .await
            .cloned()
    }

    async fn discover_parent(&self) -> anyhow::Result<String> {
        let root = self
            .transport
            .list_root_entries()
            .await
            .context("listing default Drive location")?
            .into_iter()
            .next()
            .and_then(|entry| entry.parent_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow::anyhow!("could not determine the Drive root folder"))?;

        let existing = self
            .transport
            .list_folder(&root)
            .await
            .context("listing Drive root folder")?
            .into_iter()
            .find(|entry| {
                entry.kind == DriveEntryKind::Folder && entry.name == self.parent_folder_name
            });

        match existing {
            Some(entry) => Ok(entry.token),
            None => {
                let token = self
                    .transport
                    .create_folder(&root, &self.parent_folder_name)
                    .await
                    .with_context(|| format!("creating shared folder {}", self.parent_folder_name))?;
                tracing::info!(folder = %self.parent_folder_name, "Created shared parent folder");
                Ok(token)
            }
        }
    }
}
