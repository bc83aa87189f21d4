#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientEvent, Frame, ProtocolError};
use crate::metrics::ServerMetrics;
use crate::room::{Handshake, Outbox, RoomManager, Routed};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// Frames queued beyond this are stale; drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// Per-connection limits, derived from the server config
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub idle_timeout: Duration,
    /// Server pings keep answering clients inside `idle_timeout`
    pub heartbeat_interval: Duration,
    pub rate_limit_per_sec: u64,
}

/// Token bucket rate limiter; capacity and refill rate are both `rate_per_sec`.
struct TokenBucket {
    tokens_us: u64,
    max_tokens_us: u64,
    refill_per_sec: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, now: Instant) -> Self {
        let max_tokens_us = rate_per_sec.saturating_mul(TOKEN_US);
        Self {
            tokens_us: max_tokens_us,
            max_tokens_us,
            refill_per_sec: rate_per_sec,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        // Refill: refill_per_sec tokens per second = that many token-microseconds per microsecond
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(self.refill_per_sec))
            .min(self.max_tokens_us);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// Handles a single WebSocket connection from upgrade to disconnect
pub async fn handle_connection(
    socket: WebSocket,
    room_manager: Arc<RoomManager>,
    limits: ConnectionLimits,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for frames to this client; the sender half becomes the
    // participant's outbox once it joins
    let (tx, rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

    let send_connection_id = connection_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        write_frames(ws_sender, rx, limits.heartbeat_interval, send_metrics).await;
        debug!("Send task finished for connection: {}", send_connection_id);
    });

    let mut bucket = TokenBucket::new(limits.rate_limit_per_sec, Instant::now());
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(limits.idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_events_received();

                if bucket.try_take(Instant::now()) {
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                    }
                    metrics.inc_dropped();
                    continue;
                }

                match ClientEvent::decode(text.as_str()) {
                    Ok(event) => {
                        let name = event.name();
                        let start = Instant::now();
                        let routed = handle_client_event(event, &connection_id, &tx, &room_manager);
                        metrics.observe_event_handling(start.elapsed());

                        if let Routed::Dropped(reason) = routed {
                            debug!("Dropped {} from {}: {:?}", name, connection_id, reason);
                            metrics.inc_dropped();
                        }
                    }
                    Err(e) => {
                        warn!("Invalid event from {}: {}", connection_id, e);
                        metrics.inc_errors();
                    }
                }
            }
            Message::Binary(_) => {
                warn!(
                    "Rejected frame from {}: {}",
                    connection_id,
                    ProtocolError::UnsupportedFrame("binary")
                );
                metrics.inc_errors();
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Answered by the socket; arriving at all resets the idle timer
            }
        }
    }

    // No further events are read for this id, so nothing can resolve against
    // it once the registry entry is gone
    room_manager.disconnect(&connection_id);

    // _conn_guard dropped here → dec connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for: {}", connection_id);
}

/// Writes queued frames to the socket and pings it every `heartbeat_interval`.
///
/// Returns once the outbox is closed or a write fails.
async fn write_frames<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Frame>,
    heartbeat_interval: Duration,
    metrics: ServerMetrics,
) where
    S: Sink<Message> + Unpin,
{
    let start = tokio::time::Instant::now() + heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text((*frame).clone().into())).await.is_err() {
                    break;
                }
                metrics.inc_frames_sent();
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Applies one decoded event on behalf of `connection_id`
pub fn handle_client_event(
    event: ClientEvent,
    connection_id: &str,
    outbox: &Outbox,
    room_manager: &RoomManager,
) -> Routed {
    match event {
        ClientEvent::JoinRoom(room_id, display_name) => {
            room_manager.join(connection_id, &room_id, display_name.as_deref(), outbox.clone())
        }
        ClientEvent::Offer(payload, target) => {
            room_manager.relay_handshake(Handshake::Offer, connection_id, &target, payload)
        }
        ClientEvent::Answer(payload, target) => {
            room_manager.relay_handshake(Handshake::Answer, connection_id, &target, payload)
        }
        ClientEvent::IceCandidate(payload, target) => {
            room_manager.relay_handshake(Handshake::IceCandidate, connection_id, &target, payload)
        }
        ClientEvent::ChatMessage(text) => room_manager.broadcast_chat(connection_id, text),
        ClientEvent::MuteStatus(is_muted) => room_manager.set_mute_status(connection_id, is_muted),
        ClientEvent::CameraStatus(is_on) => room_manager.set_camera_status(connection_id, is_on),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::test_support::TestConn;
    use crate::room::DropReason;
    use crate::signaling::protocol::ServerEvent;
    use serde_json::json;

    #[test]
    fn test_token_bucket_burst_then_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, start);

        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));

        // One token refills after a third of a second at 3/s
        let later = start + Duration::from_millis(340);
        assert!(bucket.try_take(later));
        assert!(!bucket.try_take(later));

        // Refill never exceeds the burst size
        let much_later = later + Duration::from_secs(60);
        assert!(bucket.try_take(much_later));
        assert!(bucket.try_take(much_later));
        assert!(bucket.try_take(much_later));
        assert!(!bucket.try_take(much_later));
    }

    #[tokio::test]
    async fn test_failed_write_is_not_counted_as_sent() {
        let metrics = ServerMetrics::new();
        let (tx, rx) = mpsc::channel::<Frame>(4);
        for text in ["one", "two", "three"] {
            tx.try_send(Arc::new(text.to_string())).unwrap();
        }

        // Takes one frame, then fails the way a socket with a vanished peer does
        let sink = futures_util::sink::unfold(0usize, |written, _msg: Message| async move {
            if written == 0 {
                Ok(written + 1)
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
        });
        write_frames(Box::pin(sink), rx, Duration::from_secs(60), metrics.clone()).await;

        assert!(metrics.render_prometheus(0, 0).contains("meetrelay_frames_sent_total 1\n"));
    }

    #[tokio::test]
    async fn test_writer_pings_quiet_socket() {
        let written = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = written.clone();
        let sink = futures_util::sink::unfold((), move |(), msg: Message| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(msg);
                Ok::<_, std::io::Error>(())
            }
        });

        let (tx, rx) = mpsc::channel::<Frame>(4);
        let metrics = ServerMetrics::new();
        let writer = tokio::spawn(write_frames(Box::pin(sink), rx, Duration::from_millis(20), metrics.clone()));

        tokio::time::sleep(Duration::from_millis(110)).await;
        tx.try_send(Arc::new("hello".to_string())).unwrap();
        drop(tx);
        writer.await.unwrap();

        let written = written.lock().unwrap();
        let pings = written.iter().filter(|m| matches!(m, Message::Ping(_))).count();
        assert!(pings >= 2, "expected periodic pings, got {pings}");
        assert!(written.iter().any(|m| matches!(m, Message::Text(t) if t.as_str() == "hello")));
        // Pings are not frames
        assert!(metrics.render_prometheus(0, 0).contains("meetrelay_frames_sent_total 1\n"));
    }

    #[test]
    fn test_events_before_join_are_dropped() {
        let manager = RoomManager::new(ServerMetrics::new());
        let conn = TestConn::new("a");

        for event in [
            ClientEvent::Offer(json!({}), "b".into()),
            ClientEvent::Answer(json!({}), "b".into()),
            ClientEvent::IceCandidate(json!({}), "b".into()),
            ClientEvent::ChatMessage("hi".into()),
            ClientEvent::MuteStatus(true),
            ClientEvent::CameraStatus(false),
        ] {
            assert_eq!(
                handle_client_event(event, &conn.id, &conn.outbox, &manager),
                Routed::Dropped(DropReason::UnregisteredSender)
            );
        }
        assert_eq!(manager.participant_count(), 0);
    }

    #[test]
    fn test_dispatch_routes_each_event_kind() {
        let manager = RoomManager::new(ServerMetrics::new());
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");

        let join_a = ClientEvent::JoinRoom("x".into(), Some("Alice".into()));
        let join_b = ClientEvent::JoinRoom("x".into(), None);
        handle_client_event(join_a, &a.id, &a.outbox, &manager);
        handle_client_event(join_b, &b.id, &b.outbox, &manager);
        assert_eq!(a.drain(), vec![ServerEvent::UserConnected("b".into(), "Guest".into())]);
        assert_eq!(b.drain().len(), 2);

        let offer = json!({"type": "offer", "sdp": "o"});
        handle_client_event(ClientEvent::Offer(offer.clone(), "a".into()), &b.id, &b.outbox, &manager);
        assert_eq!(a.drain(), vec![ServerEvent::Offer(offer, "b".into(), "Guest".into())]);

        let answer = json!({"type": "answer", "sdp": "a"});
        handle_client_event(ClientEvent::Answer(answer.clone(), "b".into()), &a.id, &a.outbox, &manager);
        assert_eq!(b.drain(), vec![ServerEvent::Answer(answer, "a".into())]);

        handle_client_event(ClientEvent::ChatMessage("hey".into()), &a.id, &a.outbox, &manager);
        assert_eq!(a.drain(), vec![ServerEvent::ChatMessage("hey".into(), "Alice".into())]);
        assert_eq!(b.drain(), vec![ServerEvent::ChatMessage("hey".into(), "Alice".into())]);

        handle_client_event(ClientEvent::CameraStatus(false), &b.id, &b.outbox, &manager);
        assert_eq!(a.drain(), vec![ServerEvent::CameraStatus("b".into(), false)]);
        assert!(b.drain().is_empty());

        let rejoin = ClientEvent::JoinRoom("y".into(), Some("Bob".into()));
        assert_eq!(
            handle_client_event(rejoin, &b.id, &b.outbox, &manager),
            Routed::Dropped(DropReason::AlreadyJoined)
        );
    }
}
