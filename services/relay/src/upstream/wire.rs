//! Upstream hub-protocol frame types.
//!
//! The upstream speaks a legacy hub protocol: an HTTP negotiate/start
//! handshake bracketing a WebSocket transport.  Inbound frames are JSON
//! objects; `M` carries hub invocations, `C` updates the connection id,
//! `S` marks the session initialized.  Outbound calls are `{H, M, A, I}`
//! with a monotonically increasing string counter `I`.

use f1_protocol::FeedFrame;
use serde::Deserialize;
use serde_json::{Value, json};

/// Protocol version sent in every handshake query.
pub const CLIENT_PROTOCOL: &str = "1.5";

// ---------------------------------------------------------------------------
// Negotiate / start responses
// ---------------------------------------------------------------------------

/// Body of the `/negotiate` response.  Field names are upstream-exact.
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiateResponse {
    #[serde(rename = "ConnectionToken")]
    pub connection_token: String,
    #[serde(rename = "ConnectionId")]
    pub connection_id: String,
    /// Seconds; converted to a duration by the client.
    #[serde(rename = "KeepAliveTimeout")]
    pub keep_alive_timeout: Option<f64>,
}

/// Body of the `/start` response; success is exactly `Response == "started"`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    #[serde(rename = "Response")]
    pub response: String,
}

/// The URL-encoded connection data JSON: `[{"name": "<hub>"}]`.
pub fn connection_data(hub_name: &str) -> String {
    json!([{ "name": hub_name }]).to_string()
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// One hub invocation inside an inbound `M` array.
#[derive(Debug, Clone, Deserialize)]
pub struct HubInvocation {
    #[serde(rename = "H", default)]
    pub hub: String,
    #[serde(rename = "M", default)]
    pub method: String,
    #[serde(rename = "A", default)]
    pub args: Vec<Value>,
}

/// An inbound transport frame.  All fields optional: keep-alives are empty
/// objects and control frames may carry any subset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "C")]
    pub connection_id: Option<String>,
    #[serde(rename = "M")]
    pub invocations: Option<Vec<HubInvocation>>,
    #[serde(rename = "S")]
    pub initialized: Option<i64>,
}

impl InboundFrame {
    /// Extract the feed frames this transport frame carries.
    ///
    /// `feed` invocations become `{A[0], A[1], A[2]}`; `heartbeat`
    /// invocations become Heartbeat frames carrying `A[0]`.  Anything else
    /// is ignored.
    pub fn feed_frames(&self) -> Vec<FeedFrame> {
        let Some(invocations) = &self.invocations else {
            return Vec::new();
        };
        let mut frames = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            match invocation.method.as_str() {
                "feed" => {
                    let Some(name) = invocation.args.first().and_then(Value::as_str) else {
                        continue;
                    };
                    frames.push(FeedFrame {
                        feed_name: name.to_owned(),
                        payload: invocation.args.get(1).cloned().unwrap_or(Value::Null),
                        timestamp: invocation
                            .args
                            .get(2)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                    });
                }
                "heartbeat" => {
                    let payload = invocation.args.first().cloned().unwrap_or(Value::Null);
                    let timestamp = payload
                        .get("Utc")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    frames.push(FeedFrame {
                        feed_name: "Heartbeat".to_owned(),
                        payload,
                        timestamp,
                    });
                }
                _ => {}
            }
        }
        frames
    }
}

/// Parse an inbound text frame.  The empty string is a keep-alive and
/// parses to the empty frame.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(InboundFrame::default());
    }
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Outbound calls
// ---------------------------------------------------------------------------

/// Build an outbound hub call `{H, M, A, I}`.
pub fn hub_call(hub: &str, method: &str, args: Vec<Value>, invocation_id: u64) -> String {
    json!({
        "H": hub,
        "M": method,
        "A": args,
        "I": invocation_id.to_string(),
    })
    .to_string()
}

/// Build a `Subscribe` call: the feed-name array is a single positional
/// argument.
pub fn subscribe_call(hub: &str, feeds: &[&str], invocation_id: u64) -> String {
    hub_call(hub, "Subscribe", vec![json!(feeds)], invocation_id)
}

/// Build an `Unsubscribe` call, same argument shape as `Subscribe`.
pub fn unsubscribe_call(hub: &str, feeds: &[&str], invocation_id: u64) -> String {
    hub_call(hub, "Unsubscribe", vec![json!(feeds)], invocation_id)
}
