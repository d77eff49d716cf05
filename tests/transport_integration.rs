//! Integration tests for the transport lifecycle
//!
//! Both variants run against in-memory peers: [`MockConnector`] plays the
//! socket server, [`MockPeerFactory`] and [`MockSignaling`] play the peer
//! stack and offer endpoint. No network or audio hardware is needed.
//!
//! ```bash
//! cargo test --test transport_integration
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_link::channel::mock::{MockConnector, MockRemote, PendingSocket};
use voice_link::channel::{Frame, SocketCommand};
use voice_link::config::{load_config, TransportConfig};
use voice_link::diagnostics::SessionOutcome;
use voice_link::negotiation::mock::{MockPeerFactory, MockSignaling};
use voice_link::negotiation::{IceConnectionState, PeerEvent};
use voice_link::{
    Callbacks, ControlMessage, DiagnosticsCollector, StaticDevices, Transport, TransportError,
    TransportEvent, TransportState,
};

fn bot_message(msg_type: &str) -> String {
    serde_json::to_string(&ControlMessage::new(msg_type, json!({}))).unwrap()
}

async fn wait_for_state(transport: &Transport, state: TransportState) {
    while transport.state() != state {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_event(events: &Arc<Mutex<Vec<String>>>, label: &str) {
    while !events.lock().unwrap().iter().any(|e| e == label) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Record every lifecycle notification as a short label
fn record_events(transport: &Transport) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    transport.subscribe(move |event| {
        let label = match event {
            TransportEvent::Connected => "connected".to_string(),
            TransportEvent::Ready => "ready".to_string(),
            TransportEvent::Disconnected => "disconnected".to_string(),
            TransportEvent::Reconnecting { attempt, delay } => {
                format!("reconnecting {} {}ms", attempt, delay.as_millis())
            }
            TransportEvent::Reconnected => "reconnected".to_string(),
            TransportEvent::Error(e) => format!("error: {}", e),
            _ => return,
        };
        sink.lock().unwrap().push(label);
    });
    log
}

// ============================================================================
// Duplex socket
// ============================================================================

mod websocket {
    use super::*;

    fn config() -> TransportConfig {
        let mut config = TransportConfig::default();
        config.websocket.url = "ws://mock".to_string();
        config.media.enable_mic = false;
        config.media.enable_speaker = false;
        config
    }

    fn transport(
        config: &TransportConfig,
    ) -> (Transport, MockConnector, mpsc::UnboundedReceiver<PendingSocket>) {
        let (connector, pending) = MockConnector::new();
        let transport = Transport::websocket(
            config,
            Arc::new(connector.clone()),
            Arc::new(StaticDevices::default()),
            None,
        );
        (transport, connector, pending)
    }

    /// Next control envelope written by the client
    async fn next_control(remote: &mut MockRemote) -> Value {
        loop {
            match remote.recv().await {
                Some(SocketCommand::Send(Frame::Text(text))) => {
                    return serde_json::from_str(&text).unwrap();
                }
                Some(_) => continue,
                None => panic!("client went away"),
            }
        }
    }

    /// Accept one socket and run the server half of the handshake
    async fn serve_handshake(pending: &mut mpsc::UnboundedReceiver<PendingSocket>) -> MockRemote {
        let mut remote = pending.recv().await.unwrap().accept();
        let hello = next_control(&mut remote).await;
        assert_eq!(hello["type"], "client-ready");
        remote.send_text(bot_message("bot-ready"));
        remote
    }

    async fn connect_ready(
        transport: &Transport,
        pending: &mut mpsc::UnboundedReceiver<PendingSocket>,
    ) -> MockRemote {
        let (result, remote) = tokio::join!(transport.connect(None), serve_handshake(pending));
        result.unwrap();
        remote
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_drop_repeats_handshake() {
        let (transport, _connector, mut pending) = transport(&config());
        let events = record_events(&transport);
        let remote = connect_ready(&transport, &mut pending).await;

        remote.close("server restart");
        let _remote = serve_handshake(&mut pending).await;
        wait_for_state(&transport, TransportState::Ready).await;
        wait_for_event(&events, "reconnected").await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "connected",
                "ready",
                "reconnecting 1 1000ms",
                "connected",
                "reconnected",
                "ready",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_end_in_error() {
        let (transport, connector, mut pending) = transport(&config());
        let events = record_events(&transport);
        let remote = connect_ready(&transport, &mut pending).await;

        remote.close("server gone");
        pending.recv().await.unwrap().reject("down");
        pending.recv().await.unwrap().reject("down");
        wait_for_state(&transport, TransportState::Error).await;
        wait_for_event(&events, "disconnected").await;

        let events = events.lock().unwrap().clone();
        assert!(events.contains(&"reconnecting 2 1500ms".to_string()));
        assert!(events.contains(&format!(
            "error: {}",
            TransportError::ExhaustedRetries { attempts: 2 }
        )));
        assert_eq!(events.last().map(String::as_str), Some("disconnected"));

        // Terminal: nothing else is attempted
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_is_detected_as_stale() {
        let (transport, _connector, mut pending) = transport(&config());
        let events = record_events(&transport);
        let mut remote = connect_ready(&transport, &mut pending).await;
        let started = tokio::time::Instant::now();

        // The client pings while the server stays silent
        let ping = next_control(&mut remote).await;
        assert_eq!(ping["type"], "ping");

        let _replacement = pending.recv().await.unwrap().accept();
        assert!(started.elapsed() > Duration::from_millis(15_000));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("reconnecting 1")));
    }

    #[tokio::test]
    async fn abort_while_socket_pending() {
        let (transport, connector, mut pending) = transport(&config());
        let token = CancellationToken::new();

        let server = async {
            let socket = pending.recv().await.unwrap();
            token.cancel();
            socket
        };
        let (result, _socket) = tokio::join!(transport.connect(Some(token.clone())), server);

        assert_eq!(result, Err(TransportError::Cancelled));
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(connector.attempts(), 1);

        // A fresh connect works afterwards
        let _remote = connect_ready(&transport, &mut pending).await;
        assert_eq!(transport.state(), TransportState::Ready);
    }

    #[tokio::test]
    async fn config_file_drives_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.json");
        std::fs::write(
            &path,
            r#"{ "websocket": { "url": "ws://from-file" }, "media": { "enable_mic": false, "enable_speaker": false } }"#,
        )
        .unwrap();

        let config = load_config(&path);
        assert_eq!(config.websocket.max_reconnect_attempts, 2);

        let (transport, _connector, mut pending) = transport(&config);
        let server = async {
            let socket = pending.recv().await.unwrap();
            let url = socket.url.clone();
            socket.reject("not today");
            url
        };
        let (result, url) = tokio::join!(transport.connect(None), server);

        assert_eq!(url, "ws://from-file");
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostics_track_reconnects() {
        let (connector, mut pending) = MockConnector::new();
        let collector = Arc::new(DiagnosticsCollector::new());
        let transport = Transport::websocket(
            &config(),
            Arc::new(connector),
            Arc::new(StaticDevices::default()),
            Some(collector.clone()),
        );

        let remote = connect_ready(&transport, &mut pending).await;
        remote.close("blip");
        let _remote = serve_handshake(&mut pending).await;
        wait_for_state(&transport, TransportState::Ready).await;
        transport.disconnect().await.unwrap();

        let sessions = collector.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].outcome, SessionOutcome::Completed);
        assert_eq!(sessions[0].reconnects, 1);
        assert_eq!(collector.summary().total_reconnects, 1);
    }
}

// ============================================================================
// Peer connection
// ============================================================================

mod webrtc {
    use super::*;

    fn setup(config: &TransportConfig) -> (Transport, MockPeerFactory, MockSignaling) {
        let factory = MockPeerFactory::new();
        let signaling = MockSignaling::new("conn-7");
        let transport = Transport::webrtc(
            config,
            Arc::new(factory.clone()),
            Arc::new(signaling.clone()),
            Arc::new(StaticDevices::default()),
            None,
        );
        (transport, factory, signaling)
    }

    async fn connect_ready(transport: &Transport, factory: &MockPeerFactory) {
        let answer = async {
            loop {
                if let Some(peer) = factory.latest() {
                    if peer.sent_messages().iter().any(|m| m.contains("client-ready")) {
                        peer.emit(PeerEvent::DataChannelMessage(bot_message("bot-ready")));
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let (result, ()) = tokio::join!(transport.connect(None), answer);
        result.unwrap();
    }

    #[tokio::test]
    async fn preferred_codec_reaches_offer() {
        let mut config = TransportConfig::default();
        config.webrtc.audio_codec = Some("opus".to_string());
        let (transport, factory, signaling) = setup(&config);

        connect_ready(&transport, &factory).await;

        let offer = &signaling.offers()[0];
        assert!(offer.sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 63\r\n"));
        assert!(!offer.restart);
    }

    #[tokio::test]
    async fn messages_flow_both_ways_once_ready() {
        let (transport, factory, _signaling) = setup(&TransportConfig::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        transport.set_callbacks(
            Callbacks::new().on_message(move |m| r.lock().unwrap().push(m.msg_type)),
        );

        // Dropped: not ready yet
        transport.send_message(ControlMessage::new("llm-function-call", json!({})));
        connect_ready(&transport, &factory).await;

        let handle = transport.handle();
        handle.send_message(ControlMessage::new("send-text", json!({ "content": "hi" })));
        let peer = factory.latest().unwrap();
        let sent = peer.sent_messages();
        assert!(sent.iter().any(|m| m.contains("send-text")));
        assert!(!sent.iter().any(|m| m.contains("llm-function-call")));

        peer.emit(PeerEvent::DataChannelMessage(bot_message("bot-transcription")));
        // Signaling never reaches the application
        peer.emit(PeerEvent::DataChannelMessage(
            r#"{"type":"signalling","message":"something-new"}"#.to_string(),
        ));
        while !received.lock().unwrap().contains(&"bot-transcription".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*received.lock().unwrap(), vec!["bot-ready", "bot-transcription"]);
    }

    #[tokio::test]
    async fn ice_failure_keeps_two_transceivers_and_connection_id() {
        let (transport, factory, signaling) = setup(&TransportConfig::default());
        let events = record_events(&transport);
        connect_ready(&transport, &factory).await;

        factory
            .latest()
            .unwrap()
            .emit(PeerEvent::IceConnectionState(IceConnectionState::Failed));
        wait_for_event(&events, "reconnected").await;
        assert_eq!(transport.state(), TransportState::Connected);

        let replacement = factory.latest().unwrap();
        assert_eq!(replacement.transceiver_count(), 2);
        let offers = signaling.offers();
        assert_eq!(offers.len(), 2);
        assert!(offers[1].restart);
        assert_eq!(offers[1].connection_id.as_deref(), Some("conn-7"));
    }
}

// ============================================================================
// Loopback network
// ============================================================================

mod loopback {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn websocket_from_config_dials_configured_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = TransportConfig::default();
        config.websocket.url = format!("ws://{}", listener.local_addr().unwrap());
        config.media.enable_mic = false;
        config.media.enable_speaker = false;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seen = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        let envelope: Value = serde_json::from_str(&text).unwrap();
                        let msg_type = envelope["type"].as_str().unwrap_or_default().to_string();
                        if msg_type == "client-ready" {
                            ws.send(Message::Text(bot_message("bot-ready"))).await.unwrap();
                        }
                        seen.push(msg_type);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            seen
        });

        let transport = Transport::websocket_from_config(
            &config,
            Arc::new(StaticDevices::default()),
            None,
        );
        let events = record_events(&transport);

        transport.connect(None).await.unwrap();
        assert_eq!(transport.state(), TransportState::Ready);

        transport.disconnect().await.unwrap();
        wait_for_event(&events, "disconnected").await;

        let seen = server.await.unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("client-ready"));
        assert_eq!(
            events.lock().unwrap()[..2],
            ["connected".to_string(), "ready".to_string()]
        );
    }

    #[tokio::test]
    async fn webrtc_from_config_posts_to_offer_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = TransportConfig::default();
        config.webrtc.offer_url = format!("http://{}/api/offer", listener.local_addr().unwrap());

        // Refuse the offer so the attempt ends after one round trip
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if body.len() >= length || n == 0 {
                        break;
                    }
                }
                assert!(n > 0, "client hung up early");
            }
            let reply = "offer rejected";
            let response = format!(
                "HTTP/1.1 403 Forbidden\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                reply.len(),
                reply
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        let factory = MockPeerFactory::new();
        let transport = Transport::webrtc_from_config(
            &config,
            Arc::new(factory.clone()),
            Arc::new(StaticDevices::default()),
            None,
        )
        .unwrap();

        let err = transport.connect(None).await.unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)), "{:?}", err);
        assert!(err.to_string().contains("403"), "{}", err);
        assert_eq!(transport.state(), TransportState::Error);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/offer HTTP/1.1\r\n"));
        let body: Value = serde_json::from_str(request.split_once("\r\n\r\n").unwrap().1).unwrap();
        assert_eq!(body["type"], "offer");
        assert_eq!(body["restart"], false);
        assert!(body.get("connectionId").is_none());
        assert!(body["sdp"].as_str().unwrap().contains("m=audio"));
    }
}
