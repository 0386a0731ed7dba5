// Push channel
// A background task owns the WebSocket; the runtime talks to it through two
// unbounded queues. Requests emitted while disconnected are dropped: the
// session manager re-asserts its subscription on every `Connected`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::session::protocol::{decode_frame, encode_frame, ChannelNotification, ChannelRequest};
use crate::session::reducer::Event;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What the channel reports to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Notification(ChannelNotification),
}

impl From<ChannelEvent> for Event {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::Connected => Event::ChannelConnected,
            ChannelEvent::Disconnected => Event::ChannelDisconnected,
            ChannelEvent::Notification(n) => Event::Remote(n),
        }
    }
}

/// Runtime side of a channel. Dropping it stops the channel task.
#[derive(Debug)]
pub struct ChannelHandle {
    pub requests: mpsc::UnboundedSender<ChannelRequest>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Transport side of a channel
#[derive(Debug)]
pub struct ChannelPeer {
    pub requests: mpsc::UnboundedReceiver<ChannelRequest>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelHandle {
    /// A connected pair of queues with no transport behind it
    pub fn detached() -> (ChannelHandle, ChannelPeer) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            ChannelHandle {
                requests: req_tx,
                events: ev_rx,
            },
            ChannelPeer {
                requests: req_rx,
                events: ev_tx,
            },
        )
    }

    /// Queue a request; returns false if the channel task is gone
    pub fn send(&self, request: ChannelRequest) -> bool {
        self.requests.send(request).is_ok()
    }
}

/// Opens one channel per signed-in session
pub trait ChannelConnector: Send + Sync {
    /// Must be called from within a tokio runtime
    fn open(&self, token: &str) -> ChannelHandle;
}

/// WebSocket transport speaking JSON `{event, data}` text frames
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl ChannelConnector for WebSocketConnector {
    fn open(&self, token: &str) -> ChannelHandle {
        let (handle, peer) = ChannelHandle::detached();
        let url = authenticated_url(&self.url, token);
        tokio::spawn(channel_loop(url, peer));
        handle
    }
}

/// The server authenticates the upgrade request by its `token` query parameter
fn authenticated_url(url: &str, token: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("token", token);
            parsed.to_string()
        }
        Err(e) => {
            // Connecting will keep failing and report it
            warn!(url, error = %e, "invalid channel url");
            url.to_string()
        }
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Reconnecting loop; exits once the runtime drops its handle
async fn channel_loop(url: String, mut peer: ChannelPeer) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(error = %e, retry_in = ?backoff, "channel connect failed");
                if !idle_for(backoff, &mut peer.requests).await {
                    return;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        // Anything queued while disconnected is re-asserted after `Connected`
        while peer.requests.try_recv().is_ok() {}

        info!("channel connected");
        if peer.events.send(ChannelEvent::Connected).is_err() {
            let _ = ws.close(None).await;
            return;
        }

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame::<ChannelNotification>(&text) {
                            Ok(notification) => {
                                if peer.events.send(ChannelEvent::Notification(notification)).is_err() {
                                    let _ = ws.close(None).await;
                                    return;
                                }
                            }
                            Err(e) => debug!(error = %e, frame = %text, "ignoring unknown frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "channel read failed");
                        break;
                    }
                },
                request = peer.requests.recv() => match request {
                    Some(request) => {
                        let frame = match encode_frame(&request) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, ?request, "failed to encode channel request");
                                continue;
                            }
                        };
                        debug!(?request, "channel send");
                        if let Err(e) = ws.send(Message::Text(frame)).await {
                            warn!(error = %e, "channel write failed");
                            break;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    }
                },
            }
        }

        info!("channel disconnected");
        if peer.events.send(ChannelEvent::Disconnected).is_err() {
            return;
        }
    }
}

/// Sleep through a backoff period, discarding requests that arrive meanwhile.
/// Returns false if the runtime hung up.
async fn idle_for(period: Duration, requests: &mut mpsc::UnboundedReceiver<ChannelRequest>) -> bool {
    let sleep = tokio::time::sleep(period);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            request = requests.recv() => match request {
                Some(request) => debug!(?request, "dropping request while disconnected"),
                None => return false,
            },
        }
    }
}
