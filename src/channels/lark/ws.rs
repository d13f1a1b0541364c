//! Long-connection event loop with reconnect backoff.
//!
//! The loop publishes its liveness on `LarkChannel::live`: `true` once the
//! socket is connected and the first ping went out, `false` whenever a
//! connection attempt ends.

use super::frame::{
    service_id_from_url, FragmentAssembler, PbFrame, WsClientConfig, METHOD_CONTROL, METHOD_DATA,
};
use super::LarkChannel;
use crate::channels::traits::ChannelMessage;
use futures_util::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMsg;

/// No binary frame (pong or event) within this window means the link is dead.
/// Must be larger than the ping interval (default 120 s).
const WS_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_PING_SECS: u64 = 120;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Frames that prove the server is still there.
fn should_refresh_last_recv(msg: &WsMsg) -> bool {
    matches!(msg, WsMsg::Binary(_) | WsMsg::Ping(_) | WsMsg::Pong(_))
}

/// Exponential reconnect delay: 1 s, doubling, capped at 60 s.
pub(super) struct ReconnectBackoff {
    next: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            next: INITIAL_RECONNECT_DELAY,
        }
    }
}

impl ReconnectBackoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(MAX_RECONNECT_DELAY);
        delay
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_RECONNECT_DELAY;
    }
}

/// POST /callback/ws/endpoint response
#[derive(Debug, serde::Deserialize)]
struct WsEndpointResp {
    code: i32,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<WsEndpoint>,
}

#[derive(Debug, serde::Deserialize)]
struct WsEndpoint {
    #[serde(rename = "URL")]
    url: String,
    #[serde(rename = "ClientConfig")]
    client_config: Option<WsClientConfig>,
}

impl LarkChannel {
    /// Keep a long connection up until `tx` is closed, reconnecting with backoff.
    pub(super) async fn run_long_connection(
        &self,
        tx: mpsc::Sender<ChannelMessage>,
    ) -> anyhow::Result<()> {
        let mut backoff = ReconnectBackoff::default();
        loop {
            let result = self.listen_ws(&tx).await;
            let was_live = self.live.send_replace(false);

            if tx.is_closed() {
                tracing::info!("Lark: inbound receiver closed, stopping long connection");
                return Ok(());
            }
            match result {
                Ok(()) => tracing::warn!("Lark: long connection ended"),
                Err(e) => tracing::error!("Lark: long connection error: {e:#}"),
            }
            if was_live {
                backoff.reset();
            }

            let delay = backoff.next_delay();
            tracing::info!(delay_secs = delay.as_secs(), "Lark: reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// POST /callback/ws/endpoint → (wss_url, client_config)
    async fn get_ws_endpoint(&self) -> anyhow::Result<(String, WsClientConfig)> {
        let resp = self
            .http
            .post(format!("{}/callback/ws/endpoint", self.ws_base()))
            .header("locale", self.platform.locale_header())
            .json(&serde_json::json!({
                "AppID": self.app_id,
                "AppSecret": self.app_secret,
            }))
            .send()
            .await?
            .json::<WsEndpointResp>()
            .await?;
        if resp.code != 0 {
            anyhow::bail!(
                "Lark WS endpoint failed: code={} msg={}",
                resp.code,
                resp.msg.as_deref().unwrap_or("(none)")
            );
        }
        let ep = resp
            .data
            .ok_or_else(|| anyhow::anyhow!("Lark WS endpoint: empty data"))?;
        Ok((ep.url, ep.client_config.unwrap_or_default()))
    }

    /// One connection's lifetime. Returns `Ok(())` when the socket closes.
    async fn listen_ws(&self, tx: &mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let (wss_url, client_config) = self.get_ws_endpoint().await?;
        let service_id = service_id_from_url(&wss_url);
        tracing::info!("Lark: connecting to {wss_url}");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&wss_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let mut ping_secs = client_config
            .ping_interval
            .unwrap_or(DEFAULT_PING_SECS)
            .max(10);
        let mut hb_interval = tokio::time::interval(Duration::from_secs(ping_secs));
        let mut timeout_check = tokio::time::interval(Duration::from_secs(10));
        hb_interval.tick().await; // consume immediate tick

        let mut seq: u64 = 1;
        let mut last_recv = Instant::now();
        let mut fragments = FragmentAssembler::default();

        // First ping right away so the server starts answering with pongs.
        if write
            .send(WsMsg::Binary(PbFrame::ping(seq, service_id).encode_to_vec().into()))
            .await
            .is_err()
        {
            anyhow::bail!("Lark: initial ping failed");
        }
        self.live.send_replace(true);
        tracing::info!(service_id, "Lark: long connection ready");

        loop {
            tokio::select! {
                biased;

                () = tx.closed() => break,

                _ = hb_interval.tick() => {
                    seq = seq.wrapping_add(1);
                    let ping = PbFrame::ping(seq, service_id);
                    if write.send(WsMsg::Binary(ping.encode_to_vec().into())).await.is_err() {
                        tracing::warn!("Lark: ping failed, reconnecting");
                        break;
                    }
                    fragments.evict_stale();
                }

                _ = timeout_check.tick() => {
                    if last_recv.elapsed() > WS_HEARTBEAT_TIMEOUT {
                        tracing::warn!("Lark: heartbeat timeout, reconnecting");
                        break;
                    }
                }

                msg = read.next() => {
                    let raw = match msg {
                        Some(Ok(ws_msg)) => {
                            if should_refresh_last_recv(&ws_msg) {
                                last_recv = Instant::now();
                            }
                            match ws_msg {
                                WsMsg::Binary(b) => b,
                                WsMsg::Ping(d) => { let _ = write.send(WsMsg::Pong(d)).await; continue; }
                                WsMsg::Close(_) => { tracing::info!("Lark: WS closed, reconnecting"); break; }
                                _ => continue,
                            }
                        }
                        None => { tracing::info!("Lark: WS closed, reconnecting"); break; }
                        Some(Err(e)) => { tracing::error!("Lark: WS read error: {e}"); break; }
                    };

                    let frame = match PbFrame::decode(&raw[..]) {
                        Ok(f) => f,
                        Err(e) => { tracing::error!("Lark: proto decode: {e}"); continue; }
                    };

                    if frame.method == METHOD_CONTROL {
                        if frame.is_pong() {
                            if let Some(secs) = frame.announced_ping_interval() {
                                if secs != ping_secs {
                                    ping_secs = secs;
                                    hb_interval = tokio::time::interval(Duration::from_secs(ping_secs));
                                    tracing::info!("Lark: ping_interval → {ping_secs}s");
                                }
                            }
                        }
                        continue;
                    }
                    if frame.method != METHOD_DATA {
                        continue;
                    }

                    let _ = write.send(WsMsg::Binary(frame.ack().encode_to_vec().into())).await;

                    let Some(payload) = fragments.accept(&frame) else { continue };
                    if frame.header_value("type") != "event" {
                        continue;
                    }

                    let event: serde_json::Value = match serde_json::from_slice(&payload) {
                        Ok(v) => v,
                        Err(e) => { tracing::error!("Lark: event JSON: {e}"); continue; }
                    };
                    let Some(message) = self.accept_event(&event) else { continue };

                    tracing::debug!(chat_id = %message.chat_id, "Lark: inbound message");
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
