//! Lark / Feishu client.
//!
//! One [`LarkChannel`] serves three roles: the inbound [`Channel`], the REST
//! [`LarkTransport`] the delivery pipeline talks to, and the [`LarkSession`]
//! whose readiness signal drives the outbox.

mod events;
mod frame;
mod ws;

use super::traits::{Channel, ChannelMessage, SendMessage};
use crate::config::{build_http_client, LarkConfig};
use crate::delivery::transport::{
    DriveEntry, DriveEntryKind, GrantTarget, LarkSession, LarkTransport, PermissionLevel,
};
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

const FEISHU_BASE_URL: &str = "https://open.feishu.cn/open-apis";
const LARK_BASE_URL: &str = "https://open.larksuite.com/open-apis";
const FEISHU_WEB_BASE_URL: &str = "https://www.feishu.cn";
const LARK_WEB_BASE_URL: &str = "https://www.larksuite.com";

/// Refresh tenant token this many seconds before the announced expiry.
const LARK_TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(120);
/// Fallback tenant token TTL when `expire`/`expires_in` is absent.
const LARK_DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7200);
/// Feishu/Lark API business code for expired/invalid tenant access token.
const LARK_INVALID_ACCESS_TOKEN_CODE: i64 = 99_991_663;
const DRIVE_PAGE_SIZE: u32 = 200;
/// Inbound messages buffered for a session opened without a listener.
const SESSION_INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LarkPlatform {
    Lark,
    Feishu,
}

impl LarkPlatform {
    fn api_base(self) -> &'static str {
        match self {
            Self::Lark => LARK_BASE_URL,
            Self::Feishu => FEISHU_BASE_URL,
        }
    }

    fn web_base(self) -> &'static str {
        match self {
            Self::Lark => LARK_WEB_BASE_URL,
            Self::Feishu => FEISHU_WEB_BASE_URL,
        }
    }

    fn locale_header(self) -> &'static str {
        match self {
            Self::Lark => "en",
            Self::Feishu => "zh",
        }
    }

    fn channel_name(self) -> &'static str {
        match self {
            Self::Lark => "lark",
            Self::Feishu => "feishu",
        }
    }
}

#[derive(Debug, Clone)]
struct CachedTenantToken {
    value: String,
    refresh_after: Instant,
}

fn extract_lark_response_code(body: &serde_json::Value) -> Option<i64> {
    body.get("code").and_then(serde_json::Value::as_i64)
}

fn is_lark_invalid_access_token(body: &serde_json::Value) -> bool {
    extract_lark_response_code(body) == Some(LARK_INVALID_ACCESS_TOKEN_CODE)
}

fn should_refresh_lark_tenant_token(status: reqwest::StatusCode, body: &serde_json::Value) -> bool {
    status == reqwest::StatusCode::UNAUTHORIZED || is_lark_invalid_access_token(body)
}

fn extract_lark_token_ttl_seconds(body: &serde_json::Value) -> u64 {
    let ttl = body
        .get("expire")
        .or_else(|| body.get("expires_in"))
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_i64().and_then(|v| u64::try_from(v).ok()))
        })
        .unwrap_or(LARK_DEFAULT_TOKEN_TTL.as_secs());
    ttl.max(1)
}

fn next_token_refresh_deadline(now: Instant, ttl_seconds: u64) -> Instant {
    let ttl = Duration::from_secs(ttl_seconds.max(1));
    let refresh_in = ttl
        .checked_sub(LARK_TOKEN_REFRESH_SKEW)
        .unwrap_or(Duration::from_secs(1));
    now + refresh_in
}

fn ensure_lark_success(
    status: reqwest::StatusCode,
    body: &serde_json::Value,
    context: &str,
) -> anyhow::Result<()> {
    if !status.is_success() {
        anyhow::bail!("Lark {context} failed: status={status}, body={body}");
    }

    let code = extract_lark_response_code(body).unwrap_or(0);
    if code != 0 {
        anyhow::bail!("Lark {context} failed: code={code}, body={body}");
    }

    Ok(())
}

/// `ou_` ids address a user directly; everything else is a chat.
fn receive_id_type(recipient: &str) -> &'static str {
    if recipient.starts_with("ou_") {
        "open_id"
    } else {
        "chat_id"
    }
}

fn parse_drive_entries(body: &serde_json::Value) -> Vec<DriveEntry> {
    body.pointer("/data/files")
        .and_then(|f| f.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|file| {
                    let field = |key: &str| file.get(key).and_then(|v| v.as_str());
                    Some(DriveEntry {
                        name: field("name")?.to_string(),
                        kind: DriveEntryKind::from_api(field("type").unwrap_or_default()),
                        token: field("token")?.to_string(),
                        parent_token: field("parent_token")
                            .filter(|t| !t.is_empty())
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn data_str(body: &serde_json::Value, pointer: &str, context: &str) -> anyhow::Result<String> {
    body.pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Lark {context}: missing {pointer} in response {body}"))
}

/// Lark/Feishu channel over the open-apis REST surface and the event long connection.
#[derive(Clone)]
pub struct LarkChannel {
    app_id: String,
    app_secret: String,
    allowed_users: Vec<String>,
    platform: LarkPlatform,
    api_base: String,
    web_base: String,
    http: reqwest::Client,
    /// Cached tenant access token
    tenant_token: Arc<RwLock<Option<CachedTenantToken>>>,
    /// Message ids seen in the last 30 min, to prevent double-dispatch
    seen_messages: Arc<parking_lot::Mutex<events::SeenMessages>>,
    /// Long-connection liveness
    live: Arc<watch::Sender<bool>>,
    /// Connection loop started by [`LarkSession::open`]
    session_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl LarkChannel {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        allowed_users: Vec<String>,
        use_feishu: bool,
    ) -> Self {
        let platform = if use_feishu {
            LarkPlatform::Feishu
        } else {
            LarkPlatform::Lark
        };
        let (live, _) = watch::channel(false);
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            allowed_users,
            platform,
            api_base: platform.api_base().to_string(),
            web_base: platform.web_base().to_string(),
            http: reqwest::Client::new(),
            tenant_token: Arc::new(RwLock::new(None)),
            seen_messages: Arc::new(parking_lot::Mutex::new(events::SeenMessages::default())),
            live: Arc::new(live),
            session_task: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn from_config(config: &LarkConfig) -> Self {
        let mut channel = Self::new(
            config.app_id.clone(),
            config.app_secret.clone(),
            config.allowed_users.clone(),
            config.use_feishu,
        );
        channel.http = build_http_client(config);
        if let Some(api_base) = config.api_base.as_deref() {
            channel = channel.with_api_base(api_base);
        }
        if let Some(web_base) = config.web_base.as_deref() {
            channel = channel.with_web_base(web_base);
        }
        channel
    }

    /// Point REST calls at another open-apis base (a proxy or a test server).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_web_base(mut self, web_base: &str) -> Self {
        self.web_base = web_base.trim_end_matches('/').to_string();
        self
    }

    /// Whether `id` is a Lark chat (`oc_`) or user (`ou_`) id.
    pub fn owns_chat(id: &str) -> bool {
        id.starts_with("oc_") || id.starts_with("ou_")
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    fn channel_name(&self) -> &'static str {
        self.platform.channel_name()
    }

    /// Host of `/callback/ws/endpoint`: the api base without `/open-apis`.
    fn ws_base(&self) -> &str {
        self.api_base
            .strip_suffix("/open-apis")
            .unwrap_or(&self.api_base)
    }

    fn tenant_access_token_url(&self) -> String {
        format!("{}/auth/v3/tenant_access_token/internal", self.api_base)
    }

    /// Check if a user open_id is allowed
    fn is_user_allowed(&self, open_id: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == open_id)
    }

    /// Parse an event envelope, applying the sender allowlist and dedup.
    pub fn accept_event(&self, payload: &serde_json::Value) -> Option<ChannelMessage> {
        let message = events::parse_message_event(payload, self.channel_name())?;
        if !self.is_user_allowed(&message.sender) {
            tracing::warn!("Lark: ignoring message from unauthorized user: {}", message.sender);
            return None;
        }
        if !self
            .seen_messages
            .lock()
            .first_sighting(&message.id, Instant::now())
        {
            tracing::debug!("Lark: duplicate message {}", message.id);
            return None;
        }
        Some(message)
    }

    /// Get or refresh tenant access token
    async fn get_tenant_access_token(&self) -> anyhow::Result<String> {
        {
            let cached = self.tenant_token.read().await;
            if let Some(ref token) = *cached {
                if Instant::now() < token.refresh_after {
                    return Ok(token.value.clone());
                }
            }
        }

        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let resp = self
            .http
            .post(self.tenant_access_token_url())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let data: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            anyhow::bail!("Lark tenant_access_token request failed: status={status}, body={data}");
        }

        let code = extract_lark_response_code(&data).unwrap_or(-1);
        if code != 0 {
            let msg = data
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            anyhow::bail!("Lark tenant_access_token failed: {msg}");
        }

        let token = data
            .get("tenant_access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing tenant_access_token in response"))?
            .to_string();

        let ttl_seconds = extract_lark_token_ttl_seconds(&data);
        *self.tenant_token.write().await = Some(CachedTenantToken {
            value: token.clone(),
            refresh_after: next_token_refresh_deadline(Instant::now(), ttl_seconds),
        });

        Ok(token)
    }

    /// Invalidate cached token (called when API reports an expired tenant token).
    async fn invalidate_token(&self) {
        *self.tenant_token.write().await = None;
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<(reqwest::StatusCode, serde_json::Value)> {
        let resp = request.send().await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<serde_json::Value>(&raw)
            .unwrap_or_else(|_| serde_json::json!({ "raw": raw }));
        Ok((status, parsed))
    }

    /// Authorized call with one retry after a token refresh.
    /// `build` is invoked per attempt since request bodies are consumed.
    async fn call_api<F>(&self, context: &str, build: F) -> anyhow::Result<serde_json::Value>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.get_tenant_access_token().await?;
        let (status, body) = self.execute(build().bearer_auth(&token)).await?;

        if should_refresh_lark_tenant_token(status, &body) {
            self.invalidate_token().await;
            let token = self.get_tenant_access_token().await?;
            let (retry_status, retry_body) = self.execute(build().bearer_auth(&token)).await?;

            if should_refresh_lark_tenant_token(retry_status, &retry_body) {
                anyhow::bail!(
                    "Lark {context} failed after token refresh: status={retry_status}, body={retry_body}"
                );
            }
            ensure_lark_success(retry_status, &retry_body, context)?;
            return Ok(retry_body);
        }

        ensure_lark_success(status, &body, context)?;
        Ok(body)
    }

    /// Token of the app's Drive root ("My Space").
    async fn root_folder_token(&self) -> anyhow::Result<String> {
        let url = format!("{}/drive/explorer/v2/root_folder/meta", self.api_base);
        let body = self
            .call_api("root folder lookup", || self.http.get(&url))
            .await?;
        data_str(&body, "/data/token", "root folder lookup")
    }
}

#[async_trait]
impl LarkTransport for LarkChannel {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/im/v1/messages?receive_id_type={}",
            self.api_base,
            receive_id_type(chat_id)
        );
        let body = serde_json::json!({
            "receive_id": chat_id,
            "msg_type": "text",
            "content": serde_json::json!({ "text": text }).to_string(),
        });
        self.call_api("send message", || {
            self.http
                .post(&url)
                .header("Content-Type", "application/json; charset=utf-8")
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        parent: Option<&str>,
        file_name: &str,
        size: u64,
        path: &Path,
    ) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let parent_node = match parent {
            Some(token) => token.to_string(),
            None => self.root_folder_token().await?,
        };
        let url = format!("{}/drive/v1/files/upload_all", self.api_base);

        let body = self
            .call_api("file upload", || {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.to_string());
                let form = reqwest::multipart::Form::new()
                    .text("file_name", file_name.to_string())
                    .text("parent_type", "explorer")
                    .text("parent_node", parent_node.clone())
                    .text("size", size.to_string())
                    .part("file", part);
                self.http.post(&url).multipart(form)
            })
            .await?;
        data_str(&body, "/data/file_token", "file upload")
    }

    async fn create_folder(&self, parent: &str, name: &str) -> anyhow::Result<String> {
        let url = format!("{}/drive/v1/files/create_folder", self.api_base);
        let body = serde_json::json!({ "name": name, "folder_token": parent });
        let resp = self
            .call_api("create folder", || self.http.post(&url).json(&body))
            .await?;
        data_str(&resp, "/data/token", "create folder")
    }

    async fn list_folder(&self, parent: &str) -> anyhow::Result<Vec<DriveEntry>> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/drive/v1/files?folder_token={}&page_size={DRIVE_PAGE_SIZE}",
                self.api_base,
                urlencoding::encode(parent)
            );
            if let Some(page) = &page_token {
                url.push_str(&format!("&page_token={}", urlencoding::encode(page)));
            }
            let body = self
                .call_api("list folder", || self.http.get(&url))
                .await?;
            entries.extend(parse_drive_entries(&body));

            let has_more = body
                .pointer("/data/has_more")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            page_token = body
                .pointer("/data/next_page_token")
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if !has_more || page_token.is_none() {
                return Ok(entries);
            }
        }
    }

    async fn grant_access(
        &self,
        target: &str,
        kind: GrantTarget,
        principal: &str,
        level: PermissionLevel,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/drive/v1/permissions/{}/members?type={}&need_notification=false",
            self.api_base,
            urlencoding::encode(target),
            kind.as_api_str()
        );
        let body = serde_json::json!({
            "member_type": "openid",
            "member_id": principal,
            "perm": level.as_api_str(),
        });
        self.call_api("grant permission", || self.http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn chat_display_name(&self, chat_id: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/im/v1/chats/{}",
            self.api_base,
            urlencoding::encode(chat_id)
        );
        let body = self
            .call_api("chat lookup", || self.http.get(&url))
            .await?;
        data_str(&body, "/data/name", "chat lookup")
    }

    async fn list_root_entries(&self) -> anyhow::Result<Vec<DriveEntry>> {
        let url = format!("{}/drive/v1/files", self.api_base);
        let body = self
            .call_api("list root", || self.http.get(&url))
            .await?;
        Ok(parse_drive_entries(&body))
    }

    fn file_link(&self, token: &str) -> String {
        format!("{}/file/{token}", self.web_base)
    }
}

#[async_trait]
impl LarkSession for LarkChannel {
    /// Start the long connection in the background unless it already runs.
    /// Inbound messages are only logged; use [`Channel::listen`] to consume them.
    async fn open(&self) -> anyhow::Result<watch::Receiver<bool>> {
        if self.app_id.is_empty() || self.app_secret.is_empty() {
            anyhow::bail!("Lark app_id and app_secret must be configured");
        }
        let live = self.live.subscribe();

        let mut task = self.session_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(live);
        }

        let (tx, mut inbox) = mpsc::channel::<ChannelMessage>(SESSION_INBOX_CAPACITY);
        let channel = self.clone();
        *task = Some(tokio::spawn(async move {
            let drain = tokio::spawn(async move {
                while let Some(message) = inbox.recv().await {
                    tracing::debug!(chat_id = %message.chat_id, "Lark: inbound message with no listener");
                }
            });
            if let Err(e) = channel.run_long_connection(tx).await {
                tracing::error!("Lark: long connection stopped: {e:#}");
            }
            drain.abort();
        }));
        Ok(live)
    }
}

#[async_trait]
impl Channel for LarkChannel {
    fn name(&self) -> &str {
        self.channel_name()
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        self.send_text(&message.recipient, &message.content).await
    }

    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        self.run_long_connection(tx).await
    }

    async fn health_check(&self) -> bool {
        self.get_tenant_access_token().await.is_ok()
    }
}
