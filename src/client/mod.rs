// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP/1.0 session control; see [RFC 2326](https://datatracker.ietf.org/doc/html/rfc2326).
//!
//! [`Session::connect`] spawns a driver task that walks the handshake:
//!
//! ```text
//! IDLE -> CONNECTING -> OPTIONS_SENT -> DESCRIBE_SENT -> SETUP_NEGOTIATING -> PLAYING
//! ```
//!
//! ending in `CLOSED` on [`Session::disconnect`] or any fatal error.
//! Transport negotiation is a fixed ladder: TCP interleaved first, then
//! each configured UDP client-port pair, then UDP with a server-assigned
//! port. In TCP mode the driver becomes the interleaved demultiplex loop,
//! handing `$`-framed payloads to the observer; in UDP mode the observer
//! is expected to bind an [`rtp::UdpReceiver`] on the negotiated port.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::{Error, SessionConfig, TransportPolicy};

pub(crate) mod parse;
pub mod rtp;

pub use parse::{MediaInfo, MediaSection};

pub(crate) const DEFAULT_RTSP_PORT: u16 = 554;

/// Receives session lifecycle events. Callbacks are invoked from the
/// session's driver task, so they're serialized; implementations must be
/// prepared to be called from that task rather than the caller's.
pub trait SessionHandler: Send + Sync + 'static {
    /// The TCP connection to the server is up; the handshake is starting.
    fn on_connected(&self) {}

    /// `DESCRIBE` succeeded and the SDP parsed.
    fn on_describe(&self, _media: &MediaInfo) {}

    /// `SETUP` succeeded. In interleaved mode `rtp`/`rtcp` are the channel
    /// numbers; in UDP mode they're the negotiated local ports.
    fn on_setup(&self, _rtp: u16, _rtcp: u16, _interleaved: bool) {}

    /// `PLAY` succeeded (or timed out, which servers commonly treat as
    /// implicit success and just start streaming).
    fn on_play(&self) {}

    /// The session is over; no further callbacks will arrive.
    fn on_error(&self, _error: &Error) {}

    /// One interleaved frame payload (TCP mode only). `is_rtp` is false
    /// for the RTCP channel, whose contents are forwarded unparsed.
    fn on_rtp_data(&self, _data: Bytes, _is_rtp: bool) {}
}

/// Handshake progress, observable via [`Session::state`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting,
    OptionsSent,
    DescribeSent,
    SetupNegotiating,
    Playing,
    Teardown,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Connecting,
            2 => SessionState::OptionsSent,
            3 => SessionState::DescribeSent,
            4 => SessionState::SetupNegotiating,
            5 => SessionState::Playing,
            6 => SessionState::Teardown,
            _ => SessionState::Closed,
        }
    }
}

struct Shared {
    state: AtomicU8,
    running: AtomicBool,
    stop: Notify,
    cseq: AtomicU32,
}

impl Shared {
    fn new() -> Self {
        Shared {
            state: AtomicU8::new(SessionState::Idle as u8),
            running: AtomicBool::new(true),
            stop: Notify::new(),
            cseq: AtomicU32::new(0),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

/// One RTSP session. Dropping the handle does not end the session; call
/// [`Session::disconnect`].
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Starts the handshake in a background task and returns immediately.
    /// Progress and failures arrive via `handler`. Must be called within a
    /// tokio runtime.
    pub fn connect(config: SessionConfig, handler: Arc<dyn SessionHandler>) -> Session {
        let shared = Arc::new(Shared::new());
        tokio::spawn(run(config, handler, shared.clone()));
        Session { shared }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.stopped() && self.state() != SessionState::Closed
    }

    /// Ends the session: the driver task sends a single best-effort
    /// `TEARDOWN` and closes its sockets. Idempotent and non-blocking;
    /// repeated calls are no-ops.
    pub fn disconnect(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.notify_one();
    }
}

/// The request/response side of the session socket. Responses and
/// interleaved data share `rd`, so all reads go through its buffer.
struct Dialog {
    rd: BufReader<OwnedReadHalf>,
    wr: OwnedWriteHalf,
    shared: Arc<Shared>,
    user_agent: String,
    read_timeout: Duration,
}

impl Dialog {
    async fn send_request(
        &mut self,
        method: &'static str,
        url: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<(), Error> {
        let cseq = self.shared.cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut req = format!(
            "{} {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {}\r\n",
            method, url, cseq, self.user_agent
        );
        for (name, value) in extra_headers {
            req.push_str(name);
            req.push_str(": ");
            req.push_str(value);
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        debug!("sending {} {} (CSeq {})", method, url, cseq);
        self.wr
            .write_all(req.as_bytes())
            .await
            .map_err(|source| Error::Io {
                context: "writing request",
                source,
            })
    }

    /// Sends a request and reads its response within the session read
    /// timeout.
    async fn request(
        &mut self,
        method: &'static str,
        url: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<parse::Response, Error> {
        self.send_request(method, url, extra_headers).await?;
        match tokio::time::timeout(self.read_timeout, parse::read_response(&mut self.rd, method))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(method)),
        }
    }
}

fn expect_ok(method: &'static str, response: &parse::Response) -> Result<(), Error> {
    if response.status != 200 {
        return Err(Error::Status {
            method,
            status: response.status,
            reason: response.reason.clone(),
        });
    }
    Ok(())
}

#[derive(Debug)]
enum NegotiatedTransport {
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
    Udp { client_rtp: u16, client_rtcp: u16 },
}

#[derive(Debug)]
struct SetupOutcome {
    transport: NegotiatedTransport,
    session_id: String,
    session_timeout: Option<Duration>,
}

async fn run(config: SessionConfig, handler: Arc<dyn SessionHandler>, shared: Arc<Shared>) {
    let result = drive(&config, handler.as_ref(), &shared).await;
    shared.set_state(SessionState::Closed);
    if let Err(e) = result {
        warn!("session ended: {}", e);
        handler.on_error(&e);
    }
}

async fn drive(
    config: &SessionConfig,
    handler: &dyn SessionHandler,
    shared: &Arc<Shared>,
) -> Result<(), Error> {
    let url = url::Url::parse(&config.url).map_err(|e| Error::BadUrl {
        url: config.url.clone(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "rtsp" {
        return Err(Error::BadUrl {
            url: config.url.clone(),
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    let host = url.host_str().ok_or_else(|| Error::BadUrl {
        url: config.url.clone(),
        reason: "no host".to_owned(),
    })?;
    let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
    let addr = format!("{}:{}", host, port);

    shared.set_state(SessionState::Connecting);
    let stream = tokio::time::timeout(config.timeouts.connect, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Timeout("TCP connect"))?
        .map_err(|source| Error::Connect {
            addr: addr.clone(),
            source,
        })?;
    stream.set_nodelay(true).map_err(|source| Error::Io {
        context: "setting TCP_NODELAY",
        source,
    })?;
    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
        debug!("couldn't enable TCP keepalive: {}", e);
    }
    info!("connected to {}", addr);
    handler.on_connected();

    let (rd, wr) = stream.into_split();
    let mut dialog = Dialog {
        rd: BufReader::new(rd),
        wr,
        shared: shared.clone(),
        user_agent: config.user_agent.clone(),
        read_timeout: config.timeouts.session_read,
    };

    shared.set_state(SessionState::OptionsSent);
    let response = dialog.request("OPTIONS", &config.url, &[]).await?;
    expect_ok("OPTIONS", &response)?;
    if shared.stopped() {
        return Ok(());
    }

    shared.set_state(SessionState::DescribeSent);
    let response = dialog
        .request("DESCRIBE", &config.url, &[("Accept", "application/sdp")])
        .await?;
    expect_ok("DESCRIBE", &response)?;
    let content_base = response.header("Content-Base").map(str::to_owned);
    let media = parse::parse_sdp(&response.body)?;
    debug!("described media: {:#?}", media);
    handler.on_describe(&media);
    if shared.stopped() {
        return Ok(());
    }

    shared.set_state(SessionState::SetupNegotiating);
    let setup_url = parse::setup_url(&config.url, content_base.as_deref(), &media.video_control);
    let outcome = negotiate_transport(&mut dialog, &setup_url, config).await?;
    info!(
        "transport negotiated: {:?}, session {}",
        outcome.transport, outcome.session_id
    );
    match outcome.transport {
        NegotiatedTransport::Interleaved {
            rtp_channel,
            rtcp_channel,
        } => handler.on_setup(u16::from(rtp_channel), u16::from(rtcp_channel), true),
        NegotiatedTransport::Udp {
            client_rtp,
            client_rtcp,
        } => handler.on_setup(client_rtp, client_rtcp, false),
    }

    let stream_result = if shared.stopped() {
        Ok(())
    } else {
        play_and_stream(&mut dialog, config, handler, shared, &outcome).await
    };

    shared.set_state(SessionState::Teardown);
    teardown(&mut dialog, config, &outcome.session_id).await;
    stream_result
}

async fn play_and_stream(
    dialog: &mut Dialog,
    config: &SessionConfig,
    handler: &dyn SessionHandler,
    shared: &Arc<Shared>,
    outcome: &SetupOutcome,
) -> Result<(), Error> {
    dialog
        .send_request("PLAY", &config.url, &[("Session", &outcome.session_id)])
        .await?;
    match tokio::time::timeout(
        config.timeouts.play_response,
        parse::read_response(&mut dialog.rd, "PLAY"),
    )
    .await
    {
        // Many servers start streaming without answering PLAY; treat an
        // elapsed read budget or an empty response as success.
        Err(_) => debug!("no PLAY response within budget; assuming streaming started"),
        Ok(Ok(response)) if response.status == 200 || response.status == 0 => {}
        Ok(Ok(response)) => {
            return Err(Error::Status {
                method: "PLAY",
                status: response.status,
                reason: response.reason,
            })
        }
        Ok(Err(e)) => return Err(e),
    }
    shared.set_state(SessionState::Playing);
    handler.on_play();

    match outcome.transport {
        NegotiatedTransport::Interleaved {
            rtp_channel,
            rtcp_channel: _,
        } => interleaved_loop(dialog, handler, shared, rtp_channel).await,
        NegotiatedTransport::Udp { .. } => {
            udp_keepalive_loop(dialog, config, shared, outcome).await
        }
    }
}

/// Walks the transport ladder: TCP interleaved, then each UDP candidate
/// pair whose RTP port binds locally, then UDP with no `client_port` (the
/// server assigns; if its response names none, the last attempted pair is
/// assumed).
async fn negotiate_transport(
    dialog: &mut Dialog,
    setup_url: &str,
    config: &SessionConfig,
) -> Result<SetupOutcome, Error> {
    let mut failures: Vec<String> = Vec::new();

    if config.transport != TransportPolicy::Udp {
        let response = dialog
            .request(
                "SETUP",
                setup_url,
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
            )
            .await?;
        if response.status == 200 {
            let transport = parse::parse_transport(response.header("Transport").unwrap_or(""));
            match transport.interleaved {
                Some((rtp_channel, rtcp_channel)) => {
                    let (session_id, session_timeout) = setup_session(&response)?;
                    return Ok(SetupOutcome {
                        transport: NegotiatedTransport::Interleaved {
                            rtp_channel,
                            rtcp_channel,
                        },
                        session_id,
                        session_timeout,
                    });
                }
                None => failures
                    .push("TCP: 200 OK without interleaved= in Transport".to_owned()),
            }
        } else {
            failures.push(format!("TCP: status {}", response.status));
        }
    }

    if config.transport != TransportPolicy::Tcp {
        let mut last_attempted = config.udp_port_candidates.last().copied().unwrap_or((0, 1));
        for &(rtp_port, rtcp_port) in &config.udp_port_candidates {
            if !udp_ports_available(rtp_port, rtcp_port) {
                debug!("skipping UDP candidate {}-{}: not locally bindable", rtp_port, rtcp_port);
                continue;
            }
            last_attempted = (rtp_port, rtcp_port);
            let transport_value = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtcp_port);
            let response = dialog
                .request("SETUP", setup_url, &[("Transport", &transport_value)])
                .await?;
            if response.status == 200 {
                let (session_id, session_timeout) = setup_session(&response)?;
                let transport = parse::parse_transport(response.header("Transport").unwrap_or(""));
                if let Some((server_rtp, server_rtcp)) = transport.server_port {
                    debug!("server RTP ports: {}-{}", server_rtp, server_rtcp);
                }
                return Ok(SetupOutcome {
                    transport: NegotiatedTransport::Udp {
                        client_rtp: rtp_port,
                        client_rtcp: rtcp_port,
                    },
                    session_id,
                    session_timeout,
                });
            }
            failures.push(format!(
                "UDP {}-{}: status {}",
                rtp_port, rtcp_port, response.status
            ));
        }

        let response = dialog
            .request("SETUP", setup_url, &[("Transport", "RTP/AVP;unicast")])
            .await?;
        if response.status == 200 {
            let (session_id, session_timeout) = setup_session(&response)?;
            let transport = parse::parse_transport(response.header("Transport").unwrap_or(""));
            let (client_rtp, client_rtcp) = transport.client_port.unwrap_or(last_attempted);
            return Ok(SetupOutcome {
                transport: NegotiatedTransport::Udp {
                    client_rtp,
                    client_rtcp,
                },
                session_id,
                session_timeout,
            });
        }
        failures.push(format!("UDP server-assigned: status {}", response.status));
    }

    Err(Error::TransportExhausted(failures.join("; ")))
}

fn setup_session(response: &parse::Response) -> Result<(String, Option<Duration>), Error> {
    let header = response.header("Session").ok_or_else(|| Error::Malformed {
        method: "SETUP",
        description: "200 OK without a Session header".to_owned(),
    })?;
    let (id, timeout) = parse::parse_session(header);
    if id.is_empty() {
        return Err(Error::Malformed {
            method: "SETUP",
            description: "empty session id".to_owned(),
        });
    }
    Ok((id, timeout))
}

/// Both ports of a candidate pair must be locally bindable; the probe
/// sockets are dropped immediately so the receiver can bind for real.
fn udp_ports_available(rtp_port: u16, rtcp_port: u16) -> bool {
    let rtp = std::net::UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, rtp_port));
    let rtcp = std::net::UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, rtcp_port));
    rtp.is_ok() && rtcp.is_ok()
}

/// Demultiplexes `$`-framed interleaved data (RFC 2326 section 10.12):
/// magic byte, channel, big-endian length, payload. Stray RTSP responses
/// (late `PLAY` replies) are consumed and discarded. Read timeouts are
/// benign idle; other I/O errors pause briefly and retry while the session
/// is alive.
async fn interleaved_loop(
    dialog: &mut Dialog,
    handler: &dyn SessionHandler,
    shared: &Arc<Shared>,
    rtp_channel: u8,
) -> Result<(), Error> {
    let mut magic = [0u8; 1];
    let mut header = [0u8; 3];
    loop {
        if shared.stopped() {
            return Ok(());
        }
        // The timeout covers only the first byte; a timed-out single-byte
        // read can't leave the stream mid-frame. The rest of the frame
        // follows it immediately.
        let read = tokio::time::timeout(dialog.read_timeout, dialog.rd.read_exact(&mut magic));
        tokio::select! {
            _ = shared.stop.notified() => return Ok(()),
            r = read => match r {
                Err(_) => continue,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::ConnectionClosed);
                }
                Ok(Err(e)) => {
                    debug!("interleaved read error: {}; retrying", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Ok(Ok(_)) => {}
            },
        }
        if magic[0] != b'$' {
            consume_stray_response(dialog).await?;
            continue;
        }
        tokio::select! {
            _ = shared.stop.notified() => return Ok(()),
            r = dialog.rd.read_exact(&mut header) => {
                r.map_err(|_| Error::ConnectionClosed)?;
            }
        }
        let channel = header[0];
        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
        let mut payload = vec![0u8; len];
        tokio::select! {
            _ = shared.stop.notified() => return Ok(()),
            r = dialog.rd.read_exact(&mut payload) => {
                r.map_err(|_| Error::ConnectionClosed)?;
            }
        }
        handler.on_rtp_data(Bytes::from(payload), channel == rtp_channel);
    }
}

/// Discards the remainder of a non-`$` message on the data socket, which
/// is assumed to be an RTSP response whose status line the demultiplexer
/// partially consumed: skip to the blank line, then `Content-Length`
/// bytes of body.
async fn consume_stray_response(dialog: &mut Dialog) -> Result<(), Error> {
    let map_io = |source| Error::Io {
        context: "skipping stray response",
        source,
    };
    let mut line = String::new();
    dialog.rd.read_line(&mut line).await.map_err(map_io)?;
    let mut content_length = 0usize;
    for _ in 0..50 {
        line.clear();
        if dialog.rd.read_line(&mut line).await.map_err(map_io)? == 0 {
            return Err(Error::ConnectionClosed);
        }
        let l = line.trim_end();
        if l.is_empty() {
            break;
        }
        if let Some((name, value)) = parse::split_once(l, ':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        dialog.rd.read_exact(&mut body).await.map_err(map_io)?;
    }
    debug!("consumed stray RTSP response on the data socket");
    Ok(())
}

/// In UDP mode the session socket is otherwise idle; refresh the server's
/// session timer with `OPTIONS` at half its advertised timeout.
async fn udp_keepalive_loop(
    dialog: &mut Dialog,
    config: &SessionConfig,
    shared: &Arc<Shared>,
    outcome: &SetupOutcome,
) -> Result<(), Error> {
    let timeout = outcome
        .session_timeout
        .unwrap_or_else(|| Duration::from_secs(60));
    let interval = std::cmp::max(timeout / 2, Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shared.stop.notified() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.stopped() {
            return Ok(());
        }
        match dialog
            .request("OPTIONS", &config.url, &[("Session", &outcome.session_id)])
            .await
        {
            Ok(_) => debug!("session keepalive sent"),
            Err(Error::ConnectionClosed) => return Err(Error::ConnectionClosed),
            Err(e) => warn!("session keepalive failed: {}", e),
        }
    }
}

/// Best effort: the response may never come and failures don't matter.
async fn teardown(dialog: &mut Dialog, config: &SessionConfig, session_id: &str) {
    if dialog
        .send_request("TEARDOWN", &config.url, &[("Session", session_id)])
        .await
        .is_err()
    {
        return;
    }
    let _ = tokio::time::timeout(
        dialog.read_timeout,
        parse::read_response(&mut dialog.rd, "TEARDOWN"),
    )
    .await;
}
