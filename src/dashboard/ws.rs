use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::state::DashboardState;
use crate::events::{Event, EventKind};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How often each connection re-reads the job buckets.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(3);

// ── Per-connection state ─────────────────────────────────────────────

/// Decides which events a connection sends, remembering the last snapshot
/// it pushed so the reconcile tick only sends real changes.
#[derive(Debug, Default)]
pub struct Reconciler {
    last_sent: Option<DashboardState>,
}

impl Reconciler {
    pub fn initial(&mut self, snapshot: DashboardState) -> Event {
        self.last_sent = Some(snapshot.clone());
        Event::now(EventKind::Initial(snapshot))
    }

    /// Forward `event`, followed by a recomputed `state` event when the
    /// event changes what the dashboard shows.
    pub fn on_event<F>(&mut self, event: Event, snapshot: F) -> Vec<Event>
    where
        F: FnOnce() -> Option<DashboardState>,
    {
        let refresh = event.kind.affects_state();
        let mut out = vec![event];
        if refresh && let Some(state) = snapshot() {
            out.push(self.push_state(state));
        }
        out
    }

    /// A `state` event if `snapshot` differs from the last one sent.
    pub fn on_tick(&mut self, snapshot: DashboardState) -> Option<Event> {
        if self.last_sent.as_ref() == Some(&snapshot) {
            return None;
        }
        Some(self.push_state(snapshot))
    }

    fn push_state(&mut self, snapshot: DashboardState) -> Event {
        self.last_sent = Some(snapshot.clone());
        Event::now(EventKind::State(snapshot))
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    // subscribe before the initial snapshot so nothing falls between them
    let rx = state.bus.subscribe();
    tracing::debug!(observers = state.bus.observer_count(), "dashboard observer connected");
    run_socket_loop(sender, receiver, rx, state).await;
    tracing::debug!("dashboard observer disconnected");
}

fn snapshot(state: &SharedState) -> Option<DashboardState> {
    match state.snapshot() {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(error = ?e, "could not rebuild dashboard state");
            None
        }
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &Event) -> bool {
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "could not serialize event");
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Core WebSocket loop: event forwarding, periodic reconciliation, and
/// ping/pong keepalive in one select loop. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping is sent, the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Event>,
    state: SharedState,
) {
    let mut reconciler = Reconciler::default();
    let initial = reconciler.initial(snapshot(&state).unwrap_or_default());
    if !send_event(&mut sender, &initial).await {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;
    let mut reconcile_interval = tokio::time::interval(RECONCILE_INTERVAL);
    reconcile_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Reconcile against the buckets ───────────────────────
            _ = reconcile_interval.tick() => {
                if let Some(event) = snapshot(&state).and_then(|s| reconciler.on_tick(s))
                    && !send_event(&mut sender, &event).await
                {
                    break;
                }
            }

            // ── Bus forwarding ──────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let mut open = true;
                        for out in reconciler.on_event(event, || snapshot(&state)) {
                            if !send_event(&mut sender, &out).await {
                                open = false;
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "observer lagged; resending state");
                        if let Some(event) = snapshot(&state).and_then(|s| reconciler.on_tick(s))
                            && !send_event(&mut sender, &event).await
                        {
                            break;
                        }
                    }
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
