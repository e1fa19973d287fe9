// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end session tests against a scripted mock RTSP server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use optic::client::rtp::{Depacketizer, DepacketizerHandler, RtpStats};
use optic::client::{MediaInfo, Session, SessionHandler};
use optic::codec::h264::Assembler;
use optic::codec::AssemblerHandler;
use optic::SessionConfig;

#[derive(Debug)]
enum Event {
    Connected,
    Describe { payload_type: u8, control: String },
    Setup { rtp: u16, rtcp: u16, interleaved: bool },
    Play,
    Error(String),
}

/// Forwards session callbacks onto a channel and, when configured, feeds
/// interleaved RTP payloads through a depacketizer.
struct RecordingHandler {
    events: mpsc::UnboundedSender<Event>,
    depacketizer: Option<Mutex<Depacketizer>>,
}

impl SessionHandler for RecordingHandler {
    fn on_connected(&self) {
        let _ = self.events.send(Event::Connected);
    }
    fn on_describe(&self, media: &MediaInfo) {
        let _ = self.events.send(Event::Describe {
            payload_type: media.video_payload_type,
            control: media.video_control.clone(),
        });
    }
    fn on_setup(&self, rtp: u16, rtcp: u16, interleaved: bool) {
        let _ = self.events.send(Event::Setup {
            rtp,
            rtcp,
            interleaved,
        });
    }
    fn on_play(&self) {
        let _ = self.events.send(Event::Play);
    }
    fn on_error(&self, error: &optic::Error) {
        let _ = self.events.send(Event::Error(error.to_string()));
    }
    fn on_rtp_data(&self, data: Bytes, is_rtp: bool) {
        if let (Some(d), true) = (&self.depacketizer, is_rtp) {
            d.lock().unwrap().push(&data);
        }
    }
}

struct NalSink {
    tx: mpsc::UnboundedSender<(Vec<u8>, u32)>,
}

impl DepacketizerHandler for NalSink {
    fn on_nal(&self, nal: Bytes, timestamp: u32) {
        let _ = self.tx.send((nal.to_vec(), timestamp));
    }
    fn on_stats(&self, _stats: &RtpStats) {}
}

#[derive(Debug)]
struct Request {
    method: String,
    url: String,
    cseq: String,
}

async fn read_request(rd: &mut BufReader<OwnedReadHalf>) -> Option<Request> {
    let mut line = String::new();
    if rd.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next()?.to_owned();
    let url = parts.next().unwrap_or("").to_owned();
    let mut cseq = String::new();
    loop {
        line.clear();
        if rd.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let l = line.trim_end();
        if l.is_empty() {
            break;
        }
        if let Some(v) = l.strip_prefix("CSeq:") {
            cseq = v.trim().to_owned();
        }
    }
    Some(Request { method, url, cseq })
}

async fn respond(
    wr: &mut OwnedWriteHalf,
    status: &str,
    cseq: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let mut response = format!("RTSP/1.0 {}\r\nCSeq: {}\r\n", status, cseq);
    for (name, value) in extra_headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    response.push_str("\r\n");
    wr.write_all(response.as_bytes()).await?;
    wr.write_all(body).await
}

fn sdp_body() -> Vec<u8> {
    b"v=0\r\n\
      o=- 0 0 IN IP4 127.0.0.1\r\n\
      s=cam\r\n\
      c=IN IP4 0.0.0.0\r\n\
      t=0 0\r\n\
      m=video 0 RTP/AVP 97\r\n\
      a=rtpmap:97 H264/90000\r\n\
      a=control:trackID=1\r\n"
        .to_vec()
}

/// The 14-byte RTP packet from the seed scenario: payload type 97, seq 1,
/// timestamp 100, carrying the IDR NAL `65 aa`.
const SEED_RTP: [u8; 14] = [
    0x80, 0x61, 0x00, 0x01, 0x00, 0x00, 0x00, 0x64, 0xde, 0xad, 0xbe, 0xef, 0x65, 0xaa,
];

async fn expect_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

fn free_udp_port_pair(avoid: &[(u16, u16)]) -> (u16, u16) {
    for _ in 0..100 {
        let probe = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        if port >= u16::MAX - 1 || avoid.iter().any(|&(a, b)| [a, b].contains(&port)) {
            continue;
        }
        if std::net::UdpSocket::bind(("0.0.0.0", port + 1)).is_ok() {
            drop(probe);
            return (port, port + 1);
        }
    }
    panic!("couldn't find a free UDP port pair");
}

fn quick_timeouts() -> optic::Timeouts {
    let mut t = optic::Timeouts::default();
    t.session_read = Duration::from_secs(2);
    t.play_response = Duration::from_secs(2);
    t
}

/// Scenario: TCP interleaved happy path. The full handshake succeeds, one
/// interleaved frame flows through the depacketizer, and the first
/// disconnect (of two) produces exactly one TEARDOWN.
#[tokio::test]
async fn tcp_interleaved_happy_path() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let requests: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));

    let server_requests = requests.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            let method = req.method.clone();
            let cseq = req.cseq.clone();
            server_requests.lock().unwrap().push(req);
            match method.as_str() {
                "OPTIONS" => respond(
                    &mut wr,
                    "200 OK",
                    &cseq,
                    &[("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN".to_owned())],
                    b"",
                )
                .await
                .unwrap(),
                "DESCRIBE" => respond(
                    &mut wr,
                    "200 OK",
                    &cseq,
                    &[
                        ("Content-Type", "application/sdp".to_owned()),
                        ("Content-Base", format!("rtsp://127.0.0.1:{}/stream/", port)),
                    ],
                    &sdp_body(),
                )
                .await
                .unwrap(),
                "SETUP" => respond(
                    &mut wr,
                    "200 OK",
                    &cseq,
                    &[
                        (
                            "Transport",
                            "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=DEADBEEF".to_owned(),
                        ),
                        ("Session", "12345678;timeout=60".to_owned()),
                    ],
                    b"",
                )
                .await
                .unwrap(),
                "PLAY" => {
                    respond(&mut wr, "200 OK", &cseq, &[("Session", "12345678".to_owned())], b"")
                        .await
                        .unwrap();
                    // One interleaved frame on channel 0.
                    let mut frame = vec![b'$', 0, 0, 14];
                    frame.extend_from_slice(&SEED_RTP);
                    wr.write_all(&frame).await.unwrap();
                }
                "TEARDOWN" => {
                    respond(&mut wr, "200 OK", &cseq, &[], b"").await.unwrap();
                    break;
                }
                other => panic!("unexpected method {}", other),
            }
        }
    });

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (nal_tx, mut nals) = mpsc::unbounded_channel();
    let mut config = SessionConfig::new(format!("rtsp://127.0.0.1:{}/stream", port), 97);
    config.timeouts = quick_timeouts();
    let depacketizer = Depacketizer::new(
        97,
        Arc::new(NalSink { tx: nal_tx }),
        config.timeouts.clone(),
    );
    let handler = Arc::new(RecordingHandler {
        events: event_tx,
        depacketizer: Some(Mutex::new(depacketizer)),
    });
    let session = Session::connect(config, handler);

    assert!(matches!(expect_event(&mut events).await, Event::Connected));
    match expect_event(&mut events).await {
        Event::Describe {
            payload_type,
            control,
        } => {
            assert_eq!(payload_type, 97);
            assert_eq!(control, "trackID=1");
        }
        e => panic!("expected describe, got {:?}", e),
    }
    match expect_event(&mut events).await {
        Event::Setup {
            rtp,
            rtcp,
            interleaved,
        } => {
            assert_eq!((rtp, rtcp, interleaved), (0, 1, true));
        }
        e => panic!("expected setup, got {:?}", e),
    }
    assert!(matches!(expect_event(&mut events).await, Event::Play));

    let (nal, timestamp) = tokio::time::timeout(Duration::from_secs(5), nals.recv())
        .await
        .context("no NAL emitted")?
        .context("nal channel closed")?;
    assert_eq!(nal, vec![0, 0, 0, 1, 0x65, 0xaa]);
    assert_eq!(timestamp, 100);

    session.disconnect();
    session.disconnect(); // second call is a no-op
    tokio::time::timeout(Duration::from_secs(5), server).await??;

    let requests = requests.lock().unwrap();
    let methods: Vec<&str> = requests.iter().map(|r| r.method.as_str()).collect();
    assert_eq!(
        methods,
        ["OPTIONS", "DESCRIBE", "SETUP", "PLAY", "TEARDOWN"]
    );
    // SETUP went to Content-Base + control attribute.
    assert_eq!(
        requests[2].url,
        format!("rtsp://127.0.0.1:{}/stream/trackID=1", port)
    );
    Ok(())
}

/// Scenario: UDP port fallback. The server refuses TCP and the first UDP
/// candidate pair with 461 Unsupported Transport; setup completes on the
/// second pair.
#[tokio::test]
async fn udp_port_fallback() -> anyhow::Result<()> {
    let first = free_udp_port_pair(&[]);
    let second = free_udp_port_pair(&[first]);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let expected_transport = format!("client_port={}-{}", second.0, second.1);
    let setups = Arc::new(Mutex::new(0usize));
    let teardowns = Arc::new(Mutex::new(0usize));

    let server_setups = setups.clone();
    let server_teardowns = teardowns.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            match req.method.as_str() {
                "OPTIONS" => respond(&mut wr, "200 OK", &req.cseq, &[], b"").await.unwrap(),
                "DESCRIBE" => respond(
                    &mut wr,
                    "200 OK",
                    &req.cseq,
                    &[("Content-Type", "application/sdp".to_owned())],
                    &sdp_body(),
                )
                .await
                .unwrap(),
                "SETUP" => {
                    let n = {
                        let mut s = server_setups.lock().unwrap();
                        *s += 1;
                        *s
                    };
                    // Refuse TCP interleaved and the first UDP pair.
                    if n < 3 {
                        respond(&mut wr, "461 Unsupported Transport", &req.cseq, &[], b"")
                            .await
                            .unwrap();
                    } else {
                        respond(
                            &mut wr,
                            "200 OK",
                            &req.cseq,
                            &[
                                (
                                    "Transport",
                                    format!(
                                        "RTP/AVP;unicast;{};server_port=6970-6971",
                                        expected_transport
                                    ),
                                ),
                                ("Session", "AF0229CD;timeout=60".to_owned()),
                            ],
                            b"",
                        )
                        .await
                        .unwrap();
                    }
                }
                "PLAY" => respond(
                    &mut wr,
                    "200 OK",
                    &req.cseq,
                    &[("Session", "AF0229CD".to_owned())],
                    b"",
                )
                .await
                .unwrap(),
                "TEARDOWN" => {
                    *server_teardowns.lock().unwrap() += 1;
                    respond(&mut wr, "200 OK", &req.cseq, &[], b"").await.unwrap();
                    break;
                }
                other => panic!("unexpected method {}", other),
            }
        }
    });

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut config = SessionConfig::new(format!("rtsp://127.0.0.1:{}/stream", port), 97);
    config.timeouts = quick_timeouts();
    config.udp_port_candidates = vec![first, second];
    let handler = Arc::new(RecordingHandler {
        events: event_tx,
        depacketizer: None,
    });
    let session = Session::connect(config, handler);

    loop {
        match expect_event(&mut events).await {
            Event::Setup {
                rtp,
                rtcp,
                interleaved,
            } => {
                assert_eq!((rtp, rtcp, interleaved), (second.0, second.1, false));
                break;
            }
            Event::Error(e) => panic!("session error: {}", e),
            _ => continue,
        }
    }
    assert!(matches!(expect_event(&mut events).await, Event::Play));

    session.disconnect();
    session.disconnect();
    tokio::time::timeout(Duration::from_secs(5), server).await??;
    assert_eq!(*setups.lock().unwrap(), 3);
    assert_eq!(*teardowns.lock().unwrap(), 1);
    Ok(())
}

/// Scenario: the server never answers PLAY within the budget. The
/// controller assumes success, starts the interleaved loop, consumes the
/// late PLAY response from the data stream, and still delivers the frame
/// that follows it.
#[tokio::test]
async fn play_timeout_is_success() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            match req.method.as_str() {
                "OPTIONS" => respond(&mut wr, "200 OK", &req.cseq, &[], b"").await.unwrap(),
                "DESCRIBE" => respond(
                    &mut wr,
                    "200 OK",
                    &req.cseq,
                    &[("Content-Type", "application/sdp".to_owned())],
                    &sdp_body(),
                )
                .await
                .unwrap(),
                "SETUP" => respond(
                    &mut wr,
                    "200 OK",
                    &req.cseq,
                    &[
                        ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1".to_owned()),
                        ("Session", "12345678".to_owned()),
                    ],
                    b"",
                )
                .await
                .unwrap(),
                "PLAY" => {
                    // Stay silent past the client's budget, then answer
                    // late and start streaming.
                    tokio::time::sleep(Duration::from_millis(800)).await;
                    respond(&mut wr, "200 OK", &req.cseq, &[("Session", "12345678".to_owned())], b"")
                        .await
                        .unwrap();
                    let mut frame = vec![b'$', 0, 0, 14];
                    frame.extend_from_slice(&SEED_RTP);
                    wr.write_all(&frame).await.unwrap();
                }
                "TEARDOWN" => {
                    respond(&mut wr, "200 OK", &req.cseq, &[], b"").await.unwrap();
                    break;
                }
                other => panic!("unexpected method {}", other),
            }
        }
    });

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (nal_tx, mut nals) = mpsc::unbounded_channel();
    let mut config = SessionConfig::new(format!("rtsp://127.0.0.1:{}/stream", port), 97);
    config.timeouts = quick_timeouts();
    config.timeouts.play_response = Duration::from_millis(300);
    let depacketizer = Depacketizer::new(
        97,
        Arc::new(NalSink { tx: nal_tx }),
        config.timeouts.clone(),
    );
    let handler = Arc::new(RecordingHandler {
        events: event_tx,
        depacketizer: Some(Mutex::new(depacketizer)),
    });
    let session = Session::connect(config, handler);

    loop {
        match expect_event(&mut events).await {
            Event::Play => break,
            Event::Error(e) => panic!("session error: {}", e),
            _ => continue,
        }
    }
    let (nal, _) = tokio::time::timeout(Duration::from_secs(5), nals.recv())
        .await
        .context("no NAL after late PLAY response")?
        .context("nal channel closed")?;
    assert_eq!(nal, vec![0, 0, 0, 1, 0x65, 0xaa]);

    session.disconnect();
    tokio::time::timeout(Duration::from_secs(5), server).await??;
    Ok(())
}

/// A non-200 early in the handshake surfaces as a fatal error and nothing
/// else happens.
#[tokio::test]
async fn options_failure_is_fatal() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        if let Some(req) = read_request(&mut rd).await {
            respond(&mut wr, "403 Forbidden", &req.cseq, &[], b"").await.unwrap();
        }
    });

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut config = SessionConfig::new(format!("rtsp://127.0.0.1:{}/stream", port), 97);
    config.timeouts = quick_timeouts();
    let handler = Arc::new(RecordingHandler {
        events: event_tx,
        depacketizer: None,
    });
    let _session = Session::connect(config, handler);

    loop {
        match expect_event(&mut events).await {
            Event::Error(e) => {
                assert!(e.contains("OPTIONS"), "unexpected error: {}", e);
                assert!(e.contains("403"), "unexpected error: {}", e);
                break;
            }
            Event::Connected => continue,
            e => panic!("expected error, got {:?}", e),
        }
    }
    Ok(())
}

/// The emitted NAL feeds straight into the access-unit assembler, which
/// produces a decodable key frame once the next timestamp arrives.
#[test]
fn depacketizer_chains_into_assembler() {
    #[derive(Default)]
    struct FrameSink {
        frames: Mutex<Vec<(Vec<u8>, u32, bool)>>,
    }
    impl AssemblerHandler for FrameSink {
        fn on_frame(&self, frame: &optic::codec::AccessUnit) {
            self.frames.lock().unwrap().push((
                frame.data().to_vec(),
                frame.timestamp(),
                frame.is_key_frame(),
            ));
        }
    }

    struct Chain {
        assembler: Mutex<Assembler>,
    }
    impl DepacketizerHandler for Chain {
        fn on_nal(&self, nal: Bytes, timestamp: u32) {
            self.assembler.lock().unwrap().push_nal(nal, timestamp);
        }
    }

    let sink = Arc::new(FrameSink::default());
    let chain = Arc::new(Chain {
        assembler: Mutex::new(Assembler::new(sink.clone(), optic::Timeouts::default())),
    });
    let mut depacketizer = Depacketizer::new(97, chain.clone(), optic::Timeouts::default());

    depacketizer.push(&SEED_RTP);
    // A later slice closes the first access unit.
    let mut next = SEED_RTP.to_vec();
    next[3] = 0x02; // seq 2
    next[7] = 0xc8; // timestamp 200
    depacketizer.push(&next);

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, vec![0, 0, 0, 1, 0x65, 0xaa]);
    assert_eq!(frames[0].1, 100);
    assert!(frames[0].2);
}
