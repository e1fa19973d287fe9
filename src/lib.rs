// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side ingestion of live H.264 video over RTSP.
//!
//! `optic` drives the RTSP/1.0 handshake against a server (typically an IP
//! camera), negotiates an RTP transport (TCP interleaved first, falling back
//! to UDP), depacketizes the RTP stream into H.264 NAL units, and groups
//! those into complete access units ready for a decoder:
//!
//! *   [`client::Session`] owns the RTSP dialog (`OPTIONS`, `DESCRIBE`,
//!     `SETUP`, `PLAY`, `TEARDOWN`) plus the interleaved demultiplex loop
//!     in TCP mode.
//! *   [`client::rtp::Depacketizer`] validates RTP headers and sequence
//!     discipline, tracks loss/jitter/bitrate, reassembles FU-A fragments
//!     ([RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184)), and
//!     emits Annex-B framed NAL units.
//! *   [`codec::h264::Assembler`] groups NAL units into access units,
//!     classifies them, and prepends cached SPS/PPS to key frames.
//!
//! Each component exposes a narrow observer trait rather than a deep
//! inheritance surface; callbacks for a given component are serialized on
//! that component's task. The crate is embeddable: no CLI, no environment
//! variables, no persisted state. Configuration is a single
//! [`SessionConfig`] passed at construction.

use std::time::Duration;

pub mod client;
pub mod codec;

/// A session-terminating error.
///
/// Per-packet anomalies (short packets, wrong payload type, reassembly
/// failures) never surface here; they're swallowed with counter increments
/// on the relevant statistics struct. Only errors that end the session cross
/// the observer boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad RTSP URL {url:?}: {reason}")]
    BadUrl { url: String, reason: String },

    #[error("couldn't connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{method} failed with status {status} {reason}")]
    Status {
        method: &'static str,
        status: u16,
        reason: String,
    },

    #[error("malformed {method} response: {description}")]
    Malformed {
        method: &'static str,
        description: String,
    },

    #[error("bad SDP: {0}")]
    Sdp(String),

    #[error("transport negotiation exhausted: {0}")]
    TransportExhausted(String),

    #[error("connection closed by server")]
    ConnectionClosed,
}

/// Which transports to attempt during `SETUP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportPolicy {
    /// TCP interleaved first, then the UDP candidate ports, then UDP with a
    /// server-assigned port.
    Auto,

    /// TCP interleaved only.
    Tcp,

    /// UDP only (candidate ports, then server-assigned).
    Udp,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        TransportPolicy::Auto
    }
}

/// Every timeout and periodic interval in the pipeline, with the defaults
/// the rest of the documentation assumes. All fields are public so tests
/// and impatient callers can shorten them.
#[derive(Clone, Debug)]
pub struct Timeouts {
    /// TCP connect to the RTSP server.
    pub connect: Duration,

    /// Reading a single RTSP response on the session socket.
    pub session_read: Duration,

    /// Budget for the `PLAY` response. Elapsing is treated as success; many
    /// servers start streaming without answering.
    pub play_response: Duration,

    /// UDP receive timeout. Elapsing is a normal idle indicator.
    pub udp_receive: Duration,

    /// How long with no RTP data before a starvation warning is emitted
    /// (and the receiver keeps running).
    pub no_data_warning: Duration,

    /// Maximum age of an in-progress FU-A reassembly.
    pub fragment_age: Duration,

    /// Maximum age of an incomplete access unit.
    pub frame_age: Duration,

    /// Cadence of the stale-state sweeps.
    pub sweep_period: Duration,

    /// Statistics are reported at least this often while packets flow...
    pub stats_interval: Duration,

    /// ...and additionally after every this many received packets.
    pub stats_packets: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(15),
            session_read: Duration::from_secs(10),
            play_response: Duration::from_secs(10),
            udp_receive: Duration::from_secs(5),
            no_data_warning: Duration::from_secs(25),
            fragment_age: Duration::from_secs(5),
            frame_age: Duration::from_secs(5),
            sweep_period: Duration::from_secs(10),
            stats_interval: Duration::from_secs(5),
            stats_packets: 10,
        }
    }
}

/// Configuration for one [`client::Session`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// `rtsp://host[:port]/path`; the port defaults to 554.
    pub url: String,

    /// The video RTP payload type. Packets carrying any other payload type
    /// are silently dropped by the depacketizer.
    pub payload_type: u8,

    pub transport: TransportPolicy,

    /// `(rtp, rtcp)` local port pairs to offer during UDP negotiation, in
    /// order. Pairs whose RTP port can't be bound locally are skipped.
    pub udp_port_candidates: Vec<(u16, u16)>,

    pub user_agent: String,

    pub timeouts: Timeouts,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, payload_type: u8) -> Self {
        SessionConfig {
            url: url.into(),
            payload_type,
            transport: TransportPolicy::default(),
            udp_port_candidates: vec![(6000, 6001), (7000, 7001), (8000, 8001), (5004, 5005)],
            user_agent: "Universal-RTSP-Client/1.0".to_owned(),
            timeouts: Timeouts::default(),
        }
    }
}
