#![forbid(unsafe_code)]

//! Load test binary - spawn synthetic signaling clients against a running relay
//!
//! Usage:
//!   cargo run --bin load_test -- --clients 10 --duration 30
//!   cargo run --bin load_test -- --clients 500 --rooms 50 --duration 60 --chat-interval 500

use anyhow::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use meetrelay::peer::{PeerError, PeerSession, PeerSessionFactory, PeerSessions};
use meetrelay::signaling::protocol::{ClientEvent, Payload, ServerEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

mod metrics {
    include!("../clients/metrics.rs");
}

use metrics::{MetricsCollector, TestSummary};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
struct ClientConfig {
    server_url: String,
    room_id: String,
    participant_name: String,
    session_duration: Duration,
    chat_interval: Duration,
}

#[derive(Debug)]
struct TestConfig {
    num_clients: usize,
    duration_secs: u64,
    ramp_up_secs: u64,
    server_url: String,
    room_prefix: String,
    num_rooms: usize,
    chat_interval_ms: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            num_clients: 5,
            duration_secs: 30,
            ramp_up_secs: 5,
            server_url: "ws://localhost:3000/ws".to_string(),
            room_prefix: "load-test-room".to_string(),
            num_rooms: 1,
            chat_interval_ms: 2_000,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stand-in for a media session: payloads carry their creation time so the
/// receiving side can measure relay latency.
struct SyntheticSession {
    remote_id: String,
}

impl PeerSession for SyntheticSession {
    fn produce_offer(&mut self) -> Result<Payload, PeerError> {
        Ok(json!({"type": "offer", "sdp": "synthetic", "sentAt": now_ms()}))
    }

    fn produce_answer(&mut self, remote_offer: Payload) -> Result<Payload, PeerError> {
        if remote_offer.get("sdp").is_none() {
            return Err(PeerError::Negotiation {
                peer: self.remote_id.clone(),
                reason: "offer without sdp".into(),
            });
        }
        Ok(json!({"type": "answer", "sdp": "synthetic", "sentAt": now_ms()}))
    }

    fn apply_remote_answer(&mut self, _answer: Payload) -> Result<(), PeerError> {
        Ok(())
    }

    fn apply_remote_candidate(&mut self, _candidate: Payload) -> Result<(), PeerError> {
        Ok(())
    }

    fn close(&mut self) {}
}

struct SyntheticFactory;

impl PeerSessionFactory for SyntheticFactory {
    type Session = SyntheticSession;

    fn create(&mut self, remote_id: &str) -> SyntheticSession {
        SyntheticSession { remote_id: remote_id.to_string() }
    }
}

fn payload_latency(payload: &Payload) -> Option<u64> {
    payload
        .get("sentAt")
        .and_then(|v| v.as_u64())
        .map(|sent| now_ms().saturating_sub(sent))
}

async fn send(sink: &mut WsSink, event: &ClientEvent, metrics: &MetricsCollector) -> Result<()> {
    sink.send(Message::Text(event.encode()?.into())).await?;
    metrics.record_event_sent();
    Ok(())
}

async fn run_client(config: ClientConfig, metrics: Arc<MetricsCollector>) -> Result<()> {
    let (ws, _) = connect_async(config.server_url.as_str()).await?;
    metrics.mark_connection_successful();
    let (mut sink, mut stream) = ws.split();

    let mut peers = PeerSessions::new(SyntheticFactory);
    let join = ClientEvent::JoinRoom(config.room_id.clone(), Some(config.participant_name.clone()));
    send(&mut sink, &join, &metrics).await?;

    let session_end = sleep(config.session_duration);
    tokio::pin!(session_end);

    // Spread chat traffic so clients don't tick in lockstep
    let jitter = Duration::from_millis(rand::random::<u64>() % 250);
    let mut chat_tick = tokio::time::interval(config.chat_interval + jitter);
    chat_tick.tick().await;
    let mut muted = false;

    loop {
        tokio::select! {
            _ = &mut session_end => break,

            _ = chat_tick.tick() => {
                let chat = ClientEvent::ChatMessage(format!("load:{}", now_ms()));
                send(&mut sink, &chat, &metrics).await?;
                if rand::random::<u8>() < 64 {
                    muted = !muted;
                    send(&mut sink, &ClientEvent::MuteStatus(muted), &metrics).await?;
                }
            }

            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        metrics.record_error(format!("WebSocket error: {e}"));
                        break;
                    }
                    None => {
                        metrics.record_error("Server closed connection".to_string());
                        break;
                    }
                };
                metrics.record_event_received();

                let event = match ServerEvent::decode(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        metrics.record_error(format!("Undecodable event: {e}"));
                        continue;
                    }
                };

                match &event {
                    ServerEvent::Offer(payload, ..) => {
                        if let Some(ms) = payload_latency(payload) {
                            metrics.record_signaling_latency("offer", ms);
                        }
                    }
                    ServerEvent::Answer(payload, _) => {
                        if let Some(ms) = payload_latency(payload) {
                            metrics.record_signaling_latency("answer", ms);
                        }
                        metrics.record_handshake_completed();
                    }
                    ServerEvent::IceCandidate(payload, _) => {
                        if let Some(ms) = payload_latency(payload) {
                            metrics.record_signaling_latency("ice-candidate", ms);
                        }
                    }
                    ServerEvent::ChatMessage(text, _) => {
                        if let Some(sent) = text.strip_prefix("load:").and_then(|t| t.parse::<u64>().ok()) {
                            metrics.record_signaling_latency("chat-message", now_ms().saturating_sub(sent));
                        }
                    }
                    _ => {}
                }

                match peers.handle(event) {
                    Ok(Some(reply)) => {
                        let remote_id = match &reply {
                            ClientEvent::Offer(_, id) | ClientEvent::Answer(_, id) => Some(id.clone()),
                            _ => None,
                        };
                        send(&mut sink, &reply, &metrics).await?;
                        if let Some(remote_id) = remote_id {
                            let candidate = peers.local_candidate(
                                &remote_id,
                                json!({"candidate": "candidate:0 1 udp 1 127.0.0.1 9 typ host", "sentAt": now_ms()}),
                            );
                            send(&mut sink, &candidate, &metrics).await?;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => metrics.record_error(e.to_string()),
                }
            }
        }
    }

    peers.close_all();
    let _ = sink.close().await;
    Ok(())
}

fn parse_args() -> TestConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = TestConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--clients" | "-c", Some(v)) => config.num_clients = v.parse().unwrap_or(config.num_clients),
            ("--duration" | "-d", Some(v)) => config.duration_secs = v.parse().unwrap_or(config.duration_secs),
            ("--ramp-up" | "-r", Some(v)) => config.ramp_up_secs = v.parse().unwrap_or(config.ramp_up_secs),
            ("--server" | "-s", Some(v)) => config.server_url = v.clone(),
            ("--room", Some(v)) => config.room_prefix = v.clone(),
            ("--rooms", Some(v)) => config.num_rooms = v.parse().unwrap_or(1).max(1),
            ("--chat-interval", Some(v)) => {
                config.chat_interval_ms = v.parse().unwrap_or(config.chat_interval_ms).max(10)
            }
            ("--help" | "-h", _) => {
                println!("Usage: load_test [--clients N] [--duration SECS] [--ramp-up SECS] [--server URL] [--room PREFIX] [--rooms N] [--chat-interval MS]");
                std::process::exit(0);
            }
            (other, _) => {
                eprintln!("Ignoring unknown or incomplete argument '{other}'");
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();
    tracing::info!("Starting load test: {:?}", config);

    let ramp_delay = if config.num_clients > 0 {
        Duration::from_millis(config.ramp_up_secs * 1000 / config.num_clients as u64)
    } else {
        Duration::ZERO
    };

    let mut handles = Vec::with_capacity(config.num_clients);
    for i in 0..config.num_clients {
        let room_id = format!("{}-{}", config.room_prefix, i % config.num_rooms);
        let client_config = ClientConfig {
            server_url: config.server_url.clone(),
            room_id: room_id.clone(),
            participant_name: format!("load-client-{i}"),
            session_duration: Duration::from_secs(config.duration_secs),
            chat_interval: Duration::from_millis(config.chat_interval_ms),
        };
        let metrics = Arc::new(MetricsCollector::new(format!("client-{i}"), room_id));

        let task_metrics = metrics.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_config, task_metrics.clone()).await {
                task_metrics.record_error(e.to_string());
            }
        });
        handles.push((handle, metrics));

        if !ramp_delay.is_zero() {
            sleep(ramp_delay).await;
        }
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (handle, metrics) in handles {
        if let Err(e) = handle.await {
            metrics.record_error(format!("Client task failed: {e}"));
        }
        reports.push(metrics.generate_report());
    }

    TestSummary::from_metrics(&reports).print_summary();
    Ok(())
}
