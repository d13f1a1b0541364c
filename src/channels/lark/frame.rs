// ─────────────────────────────────────────────────────────────────────────────
// Long-connection wire format: pbbp2.proto frame codec
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `method` of a control frame (ping/pong).
pub(super) const METHOD_CONTROL: i32 = 0;
/// `method` of a data frame (events).
pub(super) const METHOD_DATA: i32 = 1;

/// Partial messages older than this are discarded.
const FRAGMENT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, PartialEq, prost::Message)]
pub(super) struct PbHeader {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// One WebSocket binary frame.
#[derive(Clone, PartialEq, prost::Message)]
pub(super) struct PbFrame {
    #[prost(uint64, tag = "1")]
    pub seq_id: u64,
    #[prost(uint64, tag = "2")]
    pub log_id: u64,
    #[prost(int32, tag = "3")]
    pub service: i32,
    #[prost(int32, tag = "4")]
    pub method: i32,
    #[prost(message, repeated, tag = "5")]
    pub headers: Vec<PbHeader>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub payload: Option<Vec<u8>>,
}

impl PbFrame {
    pub fn ping(seq_id: u64, service: i32) -> Self {
        Self {
            seq_id,
            log_id: 0,
            service,
            method: METHOD_CONTROL,
            headers: vec![PbHeader {
                key: "type".into(),
                value: "ping".into(),
            }],
            payload: None,
        }
    }

    /// The acknowledgement the server expects for a data frame (within 3 s).
    pub fn ack(&self) -> Self {
        let mut ack = self.clone();
        ack.payload = Some(br#"{"code":200,"headers":{},"data":[]}"#.to_vec());
        ack.headers.push(PbHeader {
            key: "biz_rt".into(),
            value: "0".into(),
        });
        ack
    }

    pub fn header_value<'a>(&'a self, key: &str) -> &'a str {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map_or("", |h| h.value.as_str())
    }

    pub fn is_pong(&self) -> bool {
        self.method == METHOD_CONTROL && self.header_value("type") == "pong"
    }

    /// Ping interval announced in a pong payload, clamped to at least 10 s.
    pub fn announced_ping_interval(&self) -> Option<u64> {
        let payload = self.payload.as_deref()?;
        serde_json::from_slice::<WsClientConfig>(payload)
            .ok()?
            .ping_interval
            .map(|secs| secs.max(10))
    }
}

/// Server-sent client settings (endpoint response and pong payloads).
#[derive(Debug, serde::Deserialize, Default, Clone)]
pub(super) struct WsClientConfig {
    #[serde(rename = "PingInterval")]
    pub ping_interval: Option<u64>,
}

/// Parse `service_id` out of the WebSocket URL query string.
pub(super) fn service_id_from_url(url: &str) -> i32 {
    url.split_once('?')
        .and_then(|(_, query)| {
            query
                .split('&')
                .find_map(|kv| kv.strip_prefix("service_id="))
                .and_then(|v| v.parse::<i32>().ok())
        })
        .unwrap_or(0)
}

/// Reassembles data frames split into `sum` parts keyed by `message_id`.
#[derive(Default)]
pub(super) struct FragmentAssembler {
    pending: HashMap<String, (Vec<Option<Vec<u8>>>, Instant)>,
}

impl FragmentAssembler {
    /// Feed a data frame. Returns the full payload once every part arrived.
    pub fn accept(&mut self, frame: &PbFrame) -> Option<Vec<u8>> {
        let message_id = frame.header_value("message_id");
        let sum = frame
            .header_value("sum")
            .parse::<usize>()
            .unwrap_or(1)
            .max(1);
        let seq = frame.header_value("seq").parse::<usize>().unwrap_or(0);

        if sum == 1 || message_id.is_empty() || seq >= sum {
            return Some(frame.payload.clone().unwrap_or_default());
        }

        let entry = self
            .pending
            .entry(message_id.to_string())
            .or_insert_with(|| (vec![None; sum], Instant::now()));
        if entry.0.len() != sum {
            *entry = (vec![None; sum], Instant::now());
        }
        entry.0[seq] = frame.payload.clone();

        if !entry.0.iter().all(Option::is_some) {
            return None;
        }
        let (parts, _) = self.pending.remove(message_id)?;
        Some(parts.into_iter().flatten().flatten().collect())
    }

    /// Drop partial messages that never completed.
    pub fn evict_stale(&mut self) {
        self.pending
            .retain(|_, (_, started)| started.elapsed() < FRAGMENT_TTL);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
