//! Upstream streaming client.
//!
//! Maintains a single logical subscription to the upstream hub and delivers
//! a sequence of [`FeedFrame`]s in arrival order.
//!
//! # Protocol
//! 1. HTTP GET `/negotiate` — capture `ConnectionToken`, `ConnectionId`,
//!    `KeepAliveTimeout` and the `Set-Cookie` pairs
//! 2. Open a WebSocket to the wss variant of the same host at `/connect`
//!    with the negotiated token, the captured cookies and an Origin header
//! 3. HTTP GET `/start` — success is exactly `Response == "started"`
//! 4. Send an empty text frame every `KeepAliveTimeout / 2` while connected
//!
//! # State machine
//! ```text
//! Disconnected → Negotiating → Opening → Starting → Connected
//! Connected → Reconnecting (on close/error) → Negotiating
//! Any → Disconnected (on stop, or reconnect budget exhausted)
//! ```
//! Backoff doubles from the configured base per attempt, capped at 30 s,
//! and resets once Connected.  Parse failures on inbound frames are logged
//! and skipped; they never tear down the connection.

pub mod wire;

use crate::config::UpstreamConfig;
use f1_protocol::{FeedFrame, FeedKind};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// Connection lifecycle state, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Negotiating,
    Opening,
    Starting,
    Connected,
    Reconnecting,
}

impl UpstreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamState::Disconnected => "disconnected",
            UpstreamState::Negotiating => "negotiating",
            UpstreamState::Opening => "opening",
            UpstreamState::Starting => "starting",
            UpstreamState::Connected => "connected",
            UpstreamState::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("negotiate failed (status {status:?}): {message}")]
    Negotiation { status: Option<u16>, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("start failed (status {status:?}): {message}")]
    Start { status: Option<u16>, message: String },
    #[error("reconnect budget exhausted after {0} attempts")]
    MaxRetries(u32),
    #[error("frame parse: {0}")]
    Parse(String),
    #[error("cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Subscribe {
        feeds: Vec<FeedKind>,
        reply: oneshot::Sender<Result<(), UpstreamError>>,
    },
    Unsubscribe {
        feed: FeedKind,
        reply: oneshot::Sender<Result<(), UpstreamError>>,
    },
}

/// Cheap cloneable handle for controlling a running [`UpstreamClient`].
///
/// Subscription changes travel over a command channel and are acked per
/// call; stop is a separate watch signal so it also preempts in-flight
/// handshake work.
#[derive(Clone)]
pub struct UpstreamHandle {
    commands: mpsc::UnboundedSender<Command>,
    stop: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<UpstreamState>,
}

impl UpstreamHandle {
    /// Subscribe to feeds.  Idempotent; the hub call is sent once the
    /// session is Connected and deferred until then otherwise.  Fails
    /// with [`UpstreamError::Cancelled`] when [`UpstreamHandle::stop`]
    /// preempts the call.
    pub async fn subscribe(&self, feeds: Vec<FeedKind>) -> Result<(), UpstreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Subscribe {
            feeds,
            reply: reply_tx,
        };
        if self.commands.send(command).is_err() {
            return Err(UpstreamError::Cancelled);
        }
        reply_rx.await.unwrap_or(Err(UpstreamError::Cancelled))
    }

    /// Idempotent unsubscribe, with the same cancellation semantics as
    /// [`UpstreamHandle::subscribe`].
    pub async fn unsubscribe(&self, feed: FeedKind) -> Result<(), UpstreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Unsubscribe {
            feed,
            reply: reply_tx,
        };
        if self.commands.send(command).is_err() {
            return Err(UpstreamError::Cancelled);
        }
        reply_rx.await.unwrap_or(Err(UpstreamError::Cancelled))
    }

    /// Cancel current work and close the transport.  Safe to call in any
    /// state: an in-flight negotiate/connect/start is abandoned, and
    /// pending subscribe calls fail with a cancelled error.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn state(&self) -> UpstreamState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<UpstreamState> {
        self.state_rx.clone()
    }
}

// ---------------------------------------------------------------------------
// UpstreamClient
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

enum SessionEnd {
    Stopped,
    Closed(String),
}

struct NegotiatedSession {
    token: String,
    connection_id: String,
    keep_alive: Duration,
    cookies: String,
}

/// The upstream client task.  Create with [`UpstreamClient::new`], then
/// drive with [`UpstreamClient::run`]; frames arrive on the returned
/// receiver, state on the watch channel.
pub struct UpstreamClient {
    cfg: UpstreamConfig,
    http: reqwest::Client,
    frames_tx: mpsc::UnboundedSender<FeedFrame>,
    state_tx: watch::Sender<UpstreamState>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    stop_rx: watch::Receiver<bool>,
    /// Feeds to (re-)subscribe whenever a session reaches Connected.
    desired: BTreeSet<FeedKind>,
    next_invocation: u64,
    reached_connected_last_session: bool,
    /// Session connection id; seeded by negotiate, updated by `C` frames.
    connection_id: Option<String>,
}

impl UpstreamClient {
    pub fn new(
        cfg: UpstreamConfig,
    ) -> (
        Self,
        UpstreamHandle,
        mpsc::UnboundedReceiver<FeedFrame>,
        watch::Receiver<UpstreamState>,
    ) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(UpstreamState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let http = reqwest::Client::builder()
            .timeout(cfg.connect_timeout)
            .build()
            .unwrap_or_default();
        let handle = UpstreamHandle {
            commands: commands_tx,
            stop: Arc::new(stop_tx),
            state_rx: state_rx.clone(),
        };
        let client = UpstreamClient {
            cfg,
            http,
            frames_tx,
            state_tx,
            commands_rx,
            stop_rx,
            desired: BTreeSet::new(),
            next_invocation: 0,
            reached_connected_last_session: false,
            connection_id: None,
        };
        (client, handle, frames_rx, state_rx)
    }

    /// The connection id of the current session, if one was established.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Run the connect/reconnect loop until stopped or the reconnect budget
    /// is exhausted.
    pub async fn run(mut self) -> Result<(), UpstreamError> {
        let mut attempts: u32 = 0;
        loop {
            match self.connect_and_serve().await {
                Ok(SessionEnd::Stopped) => {
                    self.set_state(UpstreamState::Disconnected);
                    info!("upstream client stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Closed(reason)) => {
                    warn!(reason = %reason, "upstream session closed");
                }
                Err(UpstreamError::Cancelled) => {
                    self.set_state(UpstreamState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "upstream session failed");
                }
            }

            // A session that reached Connected resets the attempt counter.
            if self.reached_connected_last_session {
                attempts = 0;
            }
            attempts += 1;
            if attempts > self.cfg.reconnect_max_attempts {
                self.set_state(UpstreamState::Disconnected);
                return Err(UpstreamError::MaxRetries(attempts - 1));
            }
            self.set_state(UpstreamState::Reconnecting);
            let delay = backoff_delay(self.cfg.reconnect_base, attempts);
            info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
            if self.sleep_or_stop(delay).await {
                self.set_state(UpstreamState::Disconnected);
                return Ok(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // One session: handshake + serve loop
    // -----------------------------------------------------------------------

    async fn connect_and_serve(&mut self) -> Result<SessionEnd, UpstreamError> {
        self.reached_connected_last_session = false;
        // One receiver per session: a stop raised mid-step cancels the
        // in-flight HTTP or WebSocket work; one raised earlier trips the
        // check below before any work starts.
        let mut stop = self.stop_rx.clone();
        if *stop.borrow() {
            return Err(UpstreamError::Cancelled);
        }

        self.set_state(UpstreamState::Negotiating);
        let session = cancel_on_stop(&mut stop, self.negotiate()).await?;

        self.set_state(UpstreamState::Opening);
        let mut ws = cancel_on_stop(&mut stop, self.open_transport(&session)).await?;

        self.set_state(UpstreamState::Starting);
        cancel_on_stop(&mut stop, self.start(&session)).await?;

        self.set_state(UpstreamState::Connected);
        self.reached_connected_last_session = true;
        self.connection_id = Some(session.connection_id.clone());
        info!(connection_id = %session.connection_id, "upstream connected");

        // Re-issue the desired subscriptions for the fresh session.
        if !self.desired.is_empty() {
            let invocation_id = self.next_id();
            let feeds: Vec<&str> = self.desired.iter().map(|f| f.as_str()).collect();
            let call = wire::subscribe_call(&self.cfg.hub_name, &feeds, invocation_id);
            ws.send(Message::Text(call.into()))
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        }

        self.serve(ws, session.keep_alive, stop).await
    }

    async fn serve(
        &mut self,
        mut ws: WsStream,
        keep_alive: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> Result<SessionEnd, UpstreamError> {
        let period = (keep_alive / 2).max(Duration::from_secs(1));
        let mut keep_alive_tick = tokio::time::interval(period);
        keep_alive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
                command = self.commands_rx.recv() => {
                    match command {
                        // All handles dropped; nobody can resubscribe.
                        None => {
                            let _ = ws.send(Message::Close(None)).await;
                            return Ok(SessionEnd::Stopped);
                        }
                        Some(Command::Subscribe { feeds, reply }) => {
                            let fresh: Vec<FeedKind> =
                                feeds.into_iter().filter(|f| self.desired.insert(*f)).collect();
                            let result = if fresh.is_empty() {
                                Ok(())
                            } else {
                                let invocation_id = self.next_id();
                                let names: Vec<&str> = fresh.iter().map(|f| f.as_str()).collect();
                                let call =
                                    wire::subscribe_call(&self.cfg.hub_name, &names, invocation_id);
                                ws.send(Message::Text(call.into()))
                                    .await
                                    .map_err(|e| UpstreamError::Transport(e.to_string()))
                            };
                            let failed = result.is_err();
                            let _ = reply.send(result);
                            if failed {
                                return Ok(SessionEnd::Closed("subscribe send failed".to_owned()));
                            }
                        }
                        Some(Command::Unsubscribe { feed, reply }) => {
                            let result = if self.desired.remove(&feed) {
                                let invocation_id = self.next_id();
                                let call = wire::unsubscribe_call(
                                    &self.cfg.hub_name,
                                    &[feed.as_str()],
                                    invocation_id,
                                );
                                ws.send(Message::Text(call.into()))
                                    .await
                                    .map_err(|e| UpstreamError::Transport(e.to_string()))
                            } else {
                                Ok(())
                            };
                            let failed = result.is_err();
                            let _ = reply.send(result);
                            if failed {
                                return Ok(SessionEnd::Closed("unsubscribe send failed".to_owned()));
                            }
                        }
                    }
                }
                _ = keep_alive_tick.tick() => {
                    if ws.send(Message::Text(String::new().into())).await.is_err() {
                        return Ok(SessionEnd::Closed("keep-alive send failed".to_owned()));
                    }
                }
                frame = ws.next() => {
                    match frame {
                        None => return Ok(SessionEnd::Closed("stream ended".to_owned())),
                        Some(Err(e)) => return Ok(SessionEnd::Closed(e.to_string())),
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(reason))) => {
                            return Ok(SessionEnd::Closed(format!("close frame: {reason:?}")));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        match wire::parse_inbound(text) {
            Ok(frame) => {
                if let Some(id) = &frame.connection_id {
                    debug!(connection_id = %id, "connection id updated");
                    self.connection_id = Some(id.clone());
                }
                if frame.initialized.is_some() {
                    debug!("session initialized");
                }
                for feed_frame in frame.feed_frames() {
                    let _ = self.frames_tx.send(feed_frame);
                }
            }
            // Malformed inbound frames are logged and skipped.
            Err(e) => warn!(error = %UpstreamError::Parse(e.to_string()), "skipping frame"),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake steps
    // -----------------------------------------------------------------------

    async fn negotiate(&self) -> Result<NegotiatedSession, UpstreamError> {
        let connection_data = wire::connection_data(&self.cfg.hub_name);
        let url = format!(
            "{}/negotiate?clientProtocol={}&connectionData={}",
            self.cfg.url.trim_end_matches('/'),
            wire::CLIENT_PROTOCOL,
            urlencoding::encode(&connection_data),
        );
        let response = self.http.get(&url).send().await.map_err(|e| {
            UpstreamError::Negotiation {
                status: None,
                message: e.to_string(),
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Negotiation {
                status: Some(status.as_u16()),
                message: "non-2xx negotiate response".to_owned(),
            });
        }
        let cookies = collect_cookies(response.headers());
        let body: wire::NegotiateResponse =
            response
                .json()
                .await
                .map_err(|e| UpstreamError::Negotiation {
                    status: Some(status.as_u16()),
                    message: format!("negotiate body: {e}"),
                })?;
        let keep_alive = self.cfg.keep_alive_override.unwrap_or_else(|| {
            body.keep_alive_timeout
                .map_or(Duration::from_secs(20), Duration::from_secs_f64)
        });
        Ok(NegotiatedSession {
            token: body.connection_token,
            connection_id: body.connection_id,
            keep_alive,
            cookies,
        })
    }

    async fn open_transport(
        &self,
        session: &NegotiatedSession,
    ) -> Result<WsStream, UpstreamError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let connection_data = wire::connection_data(&self.cfg.hub_name);
        let ws_url = format!(
            "{}/connect?transport=webSockets&clientProtocol={}&connectionToken={}&connectionData={}&tid=10",
            websocket_base(&self.cfg.url),
            wire::CLIENT_PROTOCOL,
            urlencoding::encode(&session.token),
            urlencoding::encode(&connection_data),
        );
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Transport(format!("invalid URL '{ws_url}': {e}")))?;
        let headers = request.headers_mut();
        if !session.cookies.is_empty() {
            if let Ok(value) = session.cookies.parse() {
                headers.insert("Cookie", value);
            }
        }
        if let Ok(origin) = origin_of(&self.cfg.url).parse() {
            headers.insert("Origin", origin);
        }
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(ws)
    }

    async fn start(&self, session: &NegotiatedSession) -> Result<(), UpstreamError> {
        let connection_data = wire::connection_data(&self.cfg.hub_name);
        let url = format!(
            "{}/start?transport=webSockets&clientProtocol={}&connectionToken={}&connectionData={}",
            self.cfg.url.trim_end_matches('/'),
            wire::CLIENT_PROTOCOL,
            urlencoding::encode(&session.token),
            urlencoding::encode(&connection_data),
        );
        let response = self
            .http
            .get(&url)
            .header("Cookie", &session.cookies)
            .send()
            .await
            .map_err(|e| UpstreamError::Start {
                status: None,
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Start {
                status: Some(status.as_u16()),
                message: "non-2xx start response".to_owned(),
            });
        }
        let body: wire::StartResponse =
            response.json().await.map_err(|e| UpstreamError::Start {
                status: Some(status.as_u16()),
                message: format!("start body: {e}"),
            })?;
        if body.response != "started" {
            return Err(UpstreamError::Start {
                status: Some(status.as_u16()),
                message: format!("unexpected start marker: {}", body.response),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Small helpers
    // -----------------------------------------------------------------------

    fn set_state(&self, state: UpstreamState) {
        let _ = self.state_tx.send(state);
    }

    fn next_id(&mut self) -> u64 {
        self.next_invocation += 1;
        self.next_invocation
    }

    /// Sleep for `delay`, returning true if the stop signal fired first.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        let mut stop = self.stop_rx.clone();
        if *stop.borrow() {
            return true;
        }
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return false,
                _ = stop.changed() => return true,
                command = self.commands_rx.recv() => match command {
                    None => return true,
                    // Subscription changes while down just update the
                    // desired set; they are sent on the next Connected.
                    Some(Command::Subscribe { feeds, reply }) => {
                        self.desired.extend(feeds);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Unsubscribe { feed, reply }) => {
                        self.desired.remove(&feed);
                        let _ = reply.send(Ok(()));
                    }
                },
            }
        }
    }
}

/// Race an in-flight handshake step against the stop signal.  The losing
/// HTTP or WebSocket future is dropped, which aborts its request.
async fn cancel_on_stop<T, F>(
    stop: &mut watch::Receiver<bool>,
    operation: F,
) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    tokio::select! {
        biased;
        _ = stop.changed() => Err(UpstreamError::Cancelled),
        result = operation => result,
    }
}

/// Exponential backoff: `base × 2^(attempt−1)`, capped at 30 s.
/// Attempts count from 1.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    const CAP: Duration = Duration::from_secs(30);
    let factor = 1u32 << (attempt - 1).min(15);
    (base * factor).min(CAP)
}

/// The wss/ws variant of the upstream base URL.
fn websocket_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_owned()
    }
}

/// `scheme://host` of the upstream base URL, for the Origin header.
fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{scheme}://{host}:{port}"),
                (Some(host), None) => format!("{scheme}://{host}"),
                _ => url.to_owned(),
            }
        }
        Err(_) => url.to_owned(),
    }
}

/// Concatenate `Set-Cookie` name=value pairs for replay on later requests.
fn collect_cookies(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps_at_thirty_seconds() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 20), Duration::from_secs(30));
    }

    #[test]
    fn websocket_base_swaps_scheme() {
        assert_eq!(
            websocket_base("https://livetiming.example.com/signalr/"),
            "wss://livetiming.example.com/signalr"
        );
        assert_eq!(websocket_base("http://127.0.0.1:8080/hub"), "ws://127.0.0.1:8080/hub");
    }

    #[test]
    fn origin_is_scheme_and_host() {
        assert_eq!(
            origin_of("https://livetiming.example.com/signalr"),
            "https://livetiming.example.com"
        );
        assert_eq!(origin_of("http://127.0.0.1:8080/hub"), "http://127.0.0.1:8080");
    }

    #[test]
    fn cookies_concatenate_name_value_pairs() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            "GCLB=abc; path=/; HttpOnly".parse().unwrap(),
        );
        headers.append(reqwest::header::SET_COOKIE, "session=xyz".parse().unwrap());
        assert_eq!(collect_cookies(&headers), "GCLB=abc; session=xyz");
    }

    fn test_client() -> (
        UpstreamClient,
        UpstreamHandle,
        watch::Receiver<UpstreamState>,
    ) {
        let cfg = UpstreamConfig {
            url: "https://livetiming.example.com/signalr".to_owned(),
            hub_name: "Streaming".to_owned(),
            reconnect_base: Duration::from_millis(1),
            reconnect_max_attempts: 1,
            connect_timeout: Duration::from_millis(10),
            keep_alive_override: None,
        };
        let (client, handle, _frames, state) = UpstreamClient::new(cfg);
        (client, handle, state)
    }

    #[tokio::test]
    async fn handle_defers_subscriptions_until_connected() {
        let (mut client, handle, state) = test_client();
        // The down-state loop acks subscription changes and folds them
        // into the desired set for the next Connected session.  The stop
        // raised after the last ack ends the wait.
        let (subscribed, stopped) = tokio::join!(
            async {
                let result = async {
                    handle
                        .subscribe(vec![FeedKind::TimingData, FeedKind::Weather])
                        .await?;
                    handle.subscribe(vec![FeedKind::TimingData]).await?;
                    handle.unsubscribe(FeedKind::Weather).await
                }
                .await;
                handle.stop();
                result
            },
            client.sleep_or_stop(Duration::from_secs(30)),
        );
        assert!(subscribed.is_ok());
        assert!(stopped, "the stop raised after the acks should end the wait");
        assert_eq!(
            client.desired.iter().copied().collect::<Vec<_>>(),
            vec![FeedKind::TimingData]
        );
        assert_eq!(*state.borrow(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn stop_preempts_the_down_state_wait() {
        let (mut client, handle, _state) = test_client();
        handle.stop();
        assert!(client.sleep_or_stop(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn stop_cancels_an_in_flight_handshake_step() {
        let (stop_tx, mut stop) = watch::channel(false);
        stop_tx.send(true).unwrap();
        // The step never completes; only the stop signal can win.
        let result = cancel_on_stop(
            &mut stop,
            std::future::pending::<Result<(), UpstreamError>>(),
        )
        .await;
        assert!(matches!(result, Err(UpstreamError::Cancelled)));
    }

    #[tokio::test]
    async fn stopped_handshake_reports_cancelled_before_any_work() {
        let (mut client, handle, _state) = test_client();
        handle.stop();
        let result = client.connect_and_serve().await;
        assert!(matches!(result, Err(UpstreamError::Cancelled)));
    }

    #[tokio::test]
    async fn pending_subscribe_fails_cancelled_when_the_client_goes_away() {
        let (client, handle, _state) = test_client();

        // Queued but never processed: the client is dropped first.
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.subscribe(vec![FeedKind::CarData]).await }
        });
        tokio::task::yield_now().await;
        drop(client);
        assert!(matches!(
            pending.await.unwrap(),
            Err(UpstreamError::Cancelled)
        ));

        // Sent after the client is gone: fails immediately.
        assert!(matches!(
            handle.subscribe(vec![FeedKind::Weather]).await,
            Err(UpstreamError::Cancelled)
        ));
        assert!(matches!(
            handle.unsubscribe(FeedKind::Weather).await,
            Err(UpstreamError::Cancelled)
        ));
    }
}
