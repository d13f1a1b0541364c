//! In-memory transport and session used by the delivery unit tests.

use super::transport::{
    DriveEntry, DriveEntryKind, GrantTarget, LarkSession, LarkTransport, PermissionLevel,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub const ROOT_TOKEN: &str = "fld_root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SendText {
        chat_id: String,
        text: String,
    },
    Upload {
        parent: Option<String>,
        file_name: String,
        size: u64,
        body: String,
        path: PathBuf,
    },
    CreateFolder {
        parent: String,
        name: String,
    },
    ListFolder {
        parent: String,
    },
    Grant {
        target: String,
        kind: GrantTarget,
        principal: String,
        level: PermissionLevel,
    },
    ChatName {
        chat_id: String,
    },
    ListRoot,
}

/// When `send_text` should fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    Never,
    Always,
    /// Fail the next N calls, then succeed.
    Next(u32),
    /// Fail any text containing the needle.
    WhenContains(String),
}

#[derive(Debug, Clone, Default)]
pub struct Failures {
    pub upload: bool,
    pub create_folder: bool,
    pub list_folder: bool,
    pub grant: bool,
    pub chat_name: bool,
    pub list_root: bool,
}

pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    send_failure: Mutex<SendFailure>,
    send_delay: Mutex<Duration>,
    failures: Mutex<Failures>,
    chat_names: Mutex<HashMap<String, String>>,
    root_entries: Mutex<Vec<DriveEntry>>,
    folders: Mutex<HashMap<String, Vec<DriveEntry>>>,
    next_token: AtomicUsize,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    /// A transport whose Drive root already holds one file, so root discovery works.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            send_failure: Mutex::new(SendFailure::Never),
            send_delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(Failures::default()),
            chat_names: Mutex::new(HashMap::new()),
            root_entries: Mutex::new(vec![DriveEntry {
                name: "readme.md".into(),
                kind: DriveEntryKind::File,
                token: "file_readme".into(),
                parent_token: Some(ROOT_TOKEN.into()),
            }]),
            folders: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
        }
    }

    pub fn with_chat_name(self, chat_id: &str, name: &str) -> Self {
        self.chat_names
            .lock()
            .insert(chat_id.to_string(), name.to_string());
        self
    }

    pub fn with_folder(self, parent: &str, name: &str, token: &str) -> Self {
        self.folders
            .lock()
            .entry(parent.to_string())
            .or_default()
            .push(DriveEntry {
                name: name.to_string(),
                kind: DriveEntryKind::Folder,
                token: token.to_string(),
                parent_token: Some(parent.to_string()),
            });
        self
    }

    pub fn with_empty_root(self) -> Self {
        self.root_entries.lock().clear();
        self
    }

    pub fn set_send_failure(&self, failure: SendFailure) {
        *self.send_failure.lock() = failure;
    }

    /// Delay every `send_text` after recording it, to simulate a slow network.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    pub fn set_failures(&self, failures: Failures) {
        *self.failures.lock() = failures;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::SendText { chat_id, text } => Some((chat_id.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Upload { .. }))
            .cloned()
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| pred(call)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn mint(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.next_token.fetch_add(1, Ordering::SeqCst))
    }

    fn send_should_fail(&self, text: &str) -> bool {
        let mut failure = self.send_failure.lock();
        match &mut *failure {
            SendFailure::Never => false,
            SendFailure::Always => true,
            SendFailure::Next(remaining) => {
                if *remaining == 0 {
                    false
                } else {
                    *remaining -= 1;
                    true
                }
            }
            SendFailure::WhenContains(needle) => text.contains(needle.as_str()),
        }
    }
}

#[async_trait]
impl LarkTransport for RecordingTransport {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.record(Call::SendText {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.send_should_fail(text) {
            anyhow::bail!("send_text rejected by test transport");
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        parent: Option<&str>,
        file_name: &str,
        size: u64,
        path: &Path,
    ) -> anyhow::Result<String> {
        let body = tokio::fs::read_to_string(path).await?;
        self.record(Call::Upload {
            parent: parent.map(str::to_string),
            file_name: file_name.to_string(),
            size,
            body,
            path: path.to_path_buf(),
        });
        if self.failures.lock().upload {
            anyhow::bail!("upload rejected by test transport");
        }
        Ok(self.mint("file"))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> anyhow::Result<String> {
        self.record(Call::CreateFolder {
            parent: parent.to_string(),
            name: name.to_string(),
        });
        if self.failures.lock().create_folder {
            anyhow::bail!("create_folder rejected by test transport");
        }
        let token = self.mint("fld");
        self.folders
            .lock()
            .entry(parent.to_string())
            .or_default()
            .push(DriveEntry {
                name: name.to_string(),
                kind: DriveEntryKind::Folder,
                token: token.clone(),
                parent_token: Some(parent.to_string()),
            });
        Ok(token)
    }

    async fn list_folder(&self, parent: &str) -> anyhow::Result<Vec<DriveEntry>> {
        self.record(Call::ListFolder {
            parent: parent.to_string(),
        });
        if self.failures.lock().list_folder {
            anyhow::bail!("list_folder rejected by test transport");
        }
        Ok(self.folders.lock().get(parent).cloned().unwrap_or_default())
    }

    async fn grant_access(
        &self,
        target: &str,
        kind: GrantTarget,
        principal: &str,
        level: PermissionLevel,
    ) -> anyhow::Result<()> {
        self.record(Call::Grant {
            target: target.to_string(),
            kind,
            principal: principal.to_string(),
            level,
        });
        if self.failures.lock().grant {
            anyhow::bail!("member already exists");
        }
        Ok(())
    }

    async fn chat_display_name(&self, chat_id: &str) -> anyhow::Result<String> {
        self.record(Call::ChatName {
            chat_id: chat_id.to_string(),
        });
        if self.failures.lock().chat_name {
            anyhow::bail!("chat lookup rejected by test transport");
        }
        self.chat_names
            .lock()
            .get(chat_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown chat {chat_id}"))
    }

    async fn list_root_entries(&self) -> anyhow::Result<Vec<DriveEntry>> {
        self.record(Call::ListRoot);
        if self.failures.lock().list_root {
            anyhow::bail!("root listing rejected by test transport");
        }
        Ok(self.root_entries.lock().clone())
    }

    fn file_link(&self, token: &str) -> String {
        format!("https://drive.test/file/{token}")
    }
}

/// Session whose liveness is driven by the test through `live`.
pub struct ManualSession {
    live: watch::Sender<bool>,
    pub fire_on_open: bool,
}

impl ManualSession {
    pub fn new(fire_on_open: bool) -> Self {
        let (live, _) = watch::channel(false);
        Self { live, fire_on_open }
    }

    pub fn set_live(&self, live: bool) {
        self.live.send_replace(live);
    }
}

#[async_trait]
impl LarkSession for ManualSession {
    async fn open(&self) -> anyhow::Result<watch::Receiver<bool>> {
        let rx = self.live.subscribe();
        if self.fire_on_open {
            self.live.send_replace(true);
        }
        Ok(rx)
    }
}
