// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP depacketization; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550)
//! and the H.264 payload format in
//! [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
//!
//! [`Depacketizer`] accepts raw RTP packets from either a UDP socket
//! ([`UdpReceiver`]) or the TCP interleaved channel, enforces sequence
//! discipline, tracks loss/jitter/bitrate, reassembles FU-A fragments, and
//! emits one Annex-B framed NAL unit at a time to its handler. Packet-level
//! anomalies are counted, never surfaced as errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use tokio::sync::Notify;

use crate::Timeouts;

/// Sequence gaps up to this count as loss; beyond it the stream is assumed
/// to have resynchronized (new source, server restart).
const MAX_DROPOUT: i16 = 3000;

/// How far back a packet may arrive and still count as a reorder rather
/// than part of a resynchronization.
const MAX_MISORDER: i16 = 100;

/// A single FU-A reassembly may not exceed this many bytes.
const MAX_FRAGMENT_BYTES: usize = 1 << 20;

/// The RTP socket's kernel receive buffer. Key frames arrive in bursts of
/// dozens of packets; the default buffer drops them on loaded machines.
const UDP_RECV_BUFFER: usize = 640 << 10;

/// The 90 kHz RTP clock for video, in ticks per millisecond.
const CLOCK_TICKS_PER_MS: f64 = 90.0;

/// Receives NAL units and statistics from a [`Depacketizer`]. Callbacks are
/// invoked synchronously from `push`, so they're serialized per receiver.
pub trait DepacketizerHandler: Send + Sync + 'static {
    /// One complete NAL unit, Annex-B framed (`00 00 00 01` prefix), with
    /// the RTP timestamp of the packet(s) that carried it.
    fn on_nal(&self, _nal: Bytes, _timestamp: u32) {}

    /// A sequence parameter set, raw (no start code). Also delivered via
    /// [`DepacketizerHandler::on_nal`].
    fn on_sps(&self, _nal: &[u8]) {}

    /// A picture parameter set, raw (no start code). Also delivered via
    /// [`DepacketizerHandler::on_nal`].
    fn on_pps(&self, _nal: &[u8]) {}

    /// A non-fatal condition worth telling the user about (e.g. prolonged
    /// silence on a UDP socket). The receiver keeps running.
    fn on_warning(&self, _message: &str) {}

    fn on_stats(&self, _stats: &RtpStats) {}
}

/// Running reception statistics.
///
/// `packets_lost` is the sum of sequence gaps within the [`MAX_DROPOUT`]
/// window; a late packet arriving within [`MAX_MISORDER`] takes its gap
/// back, and duplicates never count as loss.
#[derive(Clone, Debug, Default)]
pub struct RtpStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub packets_duplicated: u64,
    pub bytes_received: u64,

    /// Abandoned FU-A reassemblies (size/age/timestamp mismatch).
    pub fragments_discarded: u64,

    /// Packets rejected before sequence accounting (truncated header,
    /// forbidden NAL bit, bad FU-A header).
    pub parse_errors: u64,

    /// Highest sequence number accepted so far (mod 2^16).
    pub max_seq: u16,

    /// Over the interval preceding `updated_at`.
    pub bitrate_bps: u64,

    /// Running mean of per-packet jitter samples against the 90 kHz clock.
    pub jitter_ms: f64,

    pub updated_at: Option<SystemTime>,
}

#[derive(Debug, PartialEq, Eq)]
enum SeqOutcome {
    Valid,
    Lost(u16),
    Reordered,
    Duplicate,
}

/// Expected-sequence tracking with loss/reorder/duplicate classification.
/// All arithmetic is modulo 2^16.
#[derive(Debug, Default)]
struct SequenceTracker {
    expected: Option<u16>,
}

impl SequenceTracker {
    fn observe(&mut self, seq: u16) -> SeqOutcome {
        let expected = match self.expected {
            None => {
                self.expected = Some(seq.wrapping_add(1));
                return SeqOutcome::Valid;
            }
            Some(e) => e,
        };
        let delta = seq.wrapping_sub(expected) as i16;
        if delta == 0 {
            self.expected = Some(seq.wrapping_add(1));
            SeqOutcome::Valid
        } else if delta > 0 && delta < MAX_DROPOUT {
            self.expected = Some(seq.wrapping_add(1));
            SeqOutcome::Lost(delta as u16)
        } else if delta == -1 {
            // Retransmission of the packet just delivered.
            SeqOutcome::Duplicate
        } else if delta < 0 && delta > -MAX_MISORDER {
            SeqOutcome::Reordered
        } else {
            // Jump beyond the dropout window; resynchronize silently.
            self.expected = Some(seq.wrapping_add(1));
            SeqOutcome::Valid
        }
    }
}

/// Interarrival jitter per RFC 3550 section 6.4.1, simplified to a running
/// mean of absolute transit deltas.
#[derive(Debug, Default)]
struct JitterEstimator {
    prev: Option<(Instant, u32)>,
    mean_ms: f64,
    samples: u64,
}

impl JitterEstimator {
    fn observe(&mut self, arrival: Instant, rtp_timestamp: u32) {
        if let Some((prev_arrival, prev_rtp)) = self.prev {
            let arrival_ms = arrival.duration_since(prev_arrival).as_secs_f64() * 1_000.0;
            let rtp_ms = rtp_timestamp.wrapping_sub(prev_rtp) as i32 as f64 / CLOCK_TICKS_PER_MS;
            let sample = (arrival_ms - rtp_ms).abs();
            self.samples += 1;
            self.mean_ms += (sample - self.mean_ms) / self.samples as f64;
        }
        self.prev = Some((arrival, rtp_timestamp));
    }
}

/// In-progress FU-A reassembly. The buffer is non-empty iff `started`.
#[derive(Debug)]
struct FragmentBuffer {
    buf: BytesMut,
    started: bool,
    timestamp: u32,
    since: Instant,
}

/// Turns RTP packets into Annex-B NAL units.
pub struct Depacketizer {
    payload_type: u8,
    handler: Arc<dyn DepacketizerHandler>,
    timeouts: Timeouts,
    seq: SequenceTracker,
    jitter: JitterEstimator,
    stats: RtpStats,
    frag: FragmentBuffer,

    /// Largest completed fragment; used as the initial buffer capacity for
    /// subsequent reassemblies to minimize reallocation.
    frag_high_water: usize,

    last_sweep: Instant,
    last_report: Instant,
    packets_since_report: u32,
    bytes_since_report: u64,
}

impl Depacketizer {
    pub fn new(payload_type: u8, handler: Arc<dyn DepacketizerHandler>, timeouts: Timeouts) -> Self {
        let now = Instant::now();
        Depacketizer {
            payload_type,
            handler,
            timeouts,
            seq: SequenceTracker::default(),
            jitter: JitterEstimator::default(),
            stats: RtpStats::default(),
            frag: FragmentBuffer {
                buf: BytesMut::new(),
                started: false,
                timestamp: 0,
                since: now,
            },
            frag_high_water: 0,
            last_sweep: now,
            last_report: now,
            packets_since_report: 0,
            bytes_since_report: 0,
        }
    }

    /// Processes one RTP packet: a UDP datagram or an interleaved RTP
    /// channel payload. Never fails; anomalies are counted and logged.
    pub fn push(&mut self, data: &[u8]) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) >= self.timeouts.sweep_period {
            self.sweep_at(now);
        }

        let reader = match rtp_rs::RtpReader::new(data) {
            Ok(r) => r,
            Err(e) => {
                self.stats.parse_errors += 1;
                debug!("dropping corrupt RTP packet ({} bytes): {:?}", data.len(), e);
                return;
            }
        };
        if reader.payload_type() != self.payload_type {
            return;
        }
        let seq = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = reader.timestamp();
        match self.seq.observe(seq) {
            SeqOutcome::Valid => {}
            SeqOutcome::Lost(n) => {
                debug!("{} packet(s) lost before seq={:04x}", n, seq);
                self.stats.packets_lost += u64::from(n);
            }
            SeqOutcome::Reordered => {
                self.stats.packets_reordered += 1;
                // The gap this packet fills was provisionally counted.
                self.stats.packets_lost = self.stats.packets_lost.saturating_sub(1);
            }
            SeqOutcome::Duplicate => {
                self.stats.packets_duplicated += 1;
                return;
            }
        }
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;
        self.stats.max_seq = seq;
        self.packets_since_report += 1;
        self.bytes_since_report += data.len() as u64;
        self.jitter.observe(now, timestamp);

        self.handle_payload(reader.payload(), timestamp, now);
        self.maybe_report(now);
    }

    /// Discards stale reassembly state and flushes due statistics. Intended
    /// to be driven by a housekeeping tick; also invoked from `push`.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.sweep_at(now);
        self.maybe_report(now);
    }

    /// A statistics snapshot with the live jitter estimate filled in.
    pub fn stats(&self) -> RtpStats {
        let mut stats = self.stats.clone();
        stats.jitter_ms = self.jitter.mean_ms;
        stats
    }

    fn sweep_at(&mut self, now: Instant) {
        self.last_sweep = now;
        if self.frag.started && now.duration_since(self.frag.since) >= self.timeouts.sweep_period {
            self.discard_fragment("stale reassembly swept");
        }
    }

    fn maybe_report(&mut self, now: Instant) {
        if self.packets_since_report == 0 {
            return;
        }
        let elapsed = now.duration_since(self.last_report);
        if self.packets_since_report < self.timeouts.stats_packets
            && elapsed < self.timeouts.stats_interval
        {
            return;
        }
        let secs = elapsed.as_secs_f64();
        self.stats.bitrate_bps = if secs > 0.0 {
            (self.bytes_since_report as f64 * 8.0 / secs) as u64
        } else {
            0
        };
        self.stats.jitter_ms = self.jitter.mean_ms;
        self.stats.updated_at = Some(SystemTime::now());
        self.last_report = now;
        self.packets_since_report = 0;
        self.bytes_since_report = 0;
        self.handler.on_stats(&self.stats);
    }

    fn handle_payload(&mut self, payload: &[u8], timestamp: u32, now: Instant) {
        let nal_header = match payload.first() {
            Some(&h) => h,
            None => {
                self.stats.parse_errors += 1;
                return;
            }
        };
        if (nal_header & 0x80) != 0 {
            self.stats.parse_errors += 1;
            debug!("dropping NAL with forbidden_zero_bit set: {:02x}", nal_header);
            return;
        }
        match nal_header & 0x1f {
            28 => self.push_fu_a(payload, timestamp, now),
            t => {
                if matches!(t, 24..=27 | 29) {
                    // STAP/MTAP/FU-B aggregation isn't unpacked; the payload
                    // goes through the single-NAL path as-is.
                    debug!("passing through unhandled aggregation NAL type {}", t);
                }
                self.emit_nal(payload, timestamp);
            }
        }
    }

    /// FU-A, RFC 6184 section 5.8: byte 0 is the FU indicator, byte 1 the
    /// FU header with start/end bits and the fragmented NAL's type.
    fn push_fu_a(&mut self, payload: &[u8], timestamp: u32, now: Instant) {
        if payload.len() < 2 {
            self.stats.parse_errors += 1;
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;
        if start && end {
            self.stats.parse_errors += 1;
            debug!("dropping FU-A with both start and end bits: {:02x}", fu_header);
            return;
        }

        // A new timestamp invalidates whatever was being reassembled.
        if self.frag.started && self.frag.timestamp != timestamp {
            self.discard_fragment("timestamp changed mid-reassembly");
        }

        if start {
            if self.frag.started {
                self.discard_fragment("start bit while reassembly in progress");
            }
            let mut buf = std::mem::take(&mut self.frag.buf);
            buf.clear();
            buf.reserve(std::cmp::max(self.frag_high_water, payload.len() - 1));
            buf.put_u8((indicator & 0xe0) | (fu_header & 0x1f));
            buf.put_slice(&payload[2..]);
            self.frag = FragmentBuffer {
                buf,
                started: true,
                timestamp,
                since: now,
            };
            return;
        }

        if !self.frag.started {
            self.stats.fragments_discarded += 1;
            debug!("dropping FU-A continuation with no start fragment");
            return;
        }
        if now.duration_since(self.frag.since) > self.timeouts.fragment_age {
            self.discard_fragment("reassembly exceeded age limit");
            return;
        }
        self.frag.buf.put_slice(&payload[2..]);
        if self.frag.buf.len() > MAX_FRAGMENT_BYTES {
            self.discard_fragment("reassembly exceeded size limit");
            return;
        }
        if end {
            let nal = self.frag.buf.split().freeze();
            self.frag.started = false;
            self.frag_high_water = std::cmp::max(self.frag_high_water, nal.len());
            self.emit_nal(&nal, timestamp);
        }
    }

    fn discard_fragment(&mut self, reason: &str) {
        debug!(
            "discarding {}-byte FU-A reassembly (ts={}): {}",
            self.frag.buf.len(),
            self.frag.timestamp,
            reason
        );
        self.frag.buf.clear();
        self.frag.started = false;
        self.stats.fragments_discarded += 1;
    }

    /// Frames a complete NAL into Annex-B and hands it to the observer,
    /// surfacing SPS/PPS on their dedicated methods as well.
    fn emit_nal(&mut self, nal: &[u8], timestamp: u32) {
        match nal[0] & 0x1f {
            7 => self.handler.on_sps(nal),
            8 => self.handler.on_pps(nal),
            _ => {}
        }
        let mut framed = BytesMut::with_capacity(4 + nal.len());
        framed.put_slice(&[0, 0, 0, 1]);
        framed.put_slice(nal);
        self.handler.on_nal(framed.freeze(), timestamp);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
        self.handler.on_warning(message);
    }
}

impl std::fmt::Debug for Depacketizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depacketizer")
            .field("payload_type", &self.payload_type)
            .field("seq", &self.seq)
            .field("stats", &self.stats)
            .field("frag_len", &self.frag.buf.len())
            .finish()
    }
}

/// Stops a running [`UdpReceiver`] loop.
#[derive(Clone)]
pub struct ReceiverHandle {
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    local_port: u16,
}

impl ReceiverHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Idempotent; the receive loop exits at its next suspension point.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one leaves a permit so a not-yet-registered waiter still
        // observes the stop.
        self.stop.notify_one();
    }
}

/// Owns the RTP UDP socket and runs the receive loop in UDP transport mode.
pub struct UdpReceiver {
    socket: tokio::net::UdpSocket,
    local_port: u16,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl UdpReceiver {
    /// Binds the requested local port, falling back to an ephemeral one if
    /// it's taken, with a [`UDP_RECV_BUFFER`]-sized kernel buffer.
    pub async fn bind(preferred_port: u16) -> std::io::Result<Self> {
        let std_socket = match bind_udp(preferred_port) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("UDP port {} in use; falling back to ephemeral", preferred_port);
                bind_udp(0)?
            }
            Err(e) => return Err(e),
        };
        let local_port = std_socket.local_addr()?.port();
        let socket = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(UdpReceiver {
            socket,
            local_port,
            running: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(Notify::new()),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            running: self.running.clone(),
            stop: self.stop.clone(),
            local_port: self.local_port,
        }
    }

    /// Spawns the receive loop, feeding every datagram into `depacketizer`.
    /// The returned handle stops it; the join handle yields the
    /// depacketizer back for final statistics.
    pub fn spawn(
        self,
        depacketizer: Depacketizer,
    ) -> (ReceiverHandle, tokio::task::JoinHandle<Depacketizer>) {
        let handle = self.handle();
        let join = tokio::spawn(self.run(depacketizer));
        (handle, join)
    }

    async fn run(self, mut depacketizer: Depacketizer) -> Depacketizer {
        let timeouts = depacketizer.timeouts.clone();
        let mut buf = vec![0u8; 65_536];
        let mut last_packet = Instant::now();
        let mut starvation_warned = false;
        while self.running.load(Ordering::SeqCst) {
            let recv = tokio::time::timeout(timeouts.udp_receive, self.socket.recv(&mut buf));
            tokio::select! {
                _ = self.stop.notified() => break,
                r = recv => match r {
                    Ok(Ok(n)) => {
                        last_packet = Instant::now();
                        starvation_warned = false;
                        depacketizer.push(&buf[..n]);
                    }
                    Ok(Err(e)) => {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!("UDP receive error: {}; retrying", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    // Idle; sweep and check for starvation.
                    Err(_) => {
                        depacketizer.sweep();
                        if !starvation_warned && last_packet.elapsed() >= timeouts.no_data_warning {
                            starvation_warned = true;
                            depacketizer.warn(
                                "no RTP data received; UDP may be blocked by a NAT or firewall",
                            );
                        }
                    }
                },
            }
        }
        depacketizer
    }
}

fn bind_udp(port: u16) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    let addr: std::net::SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        nals: Mutex<Vec<(Vec<u8>, u32)>>,
        sps: Mutex<Vec<Vec<u8>>>,
        pps: Mutex<Vec<Vec<u8>>>,
        stats: Mutex<Vec<RtpStats>>,
    }

    impl DepacketizerHandler for Capture {
        fn on_nal(&self, nal: Bytes, timestamp: u32) {
            self.nals.lock().unwrap().push((nal.to_vec(), timestamp));
        }
        fn on_sps(&self, nal: &[u8]) {
            self.sps.lock().unwrap().push(nal.to_vec());
        }
        fn on_pps(&self, nal: &[u8]) {
            self.pps.lock().unwrap().push(nal.to_vec());
        }
        fn on_stats(&self, stats: &RtpStats) {
            self.stats.lock().unwrap().push(stats.clone());
        }
    }

    fn packet(payload_type: u8, seq: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(12 + payload.len());
        pkt.push(0x80); // version 2, no padding/extension/CSRCs
        pkt.push(payload_type & 0x7f);
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&timestamp.to_be_bytes());
        pkt.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    fn depacketizer(handler: Arc<Capture>) -> Depacketizer {
        Depacketizer::new(97, handler, Timeouts::default())
    }

    #[test]
    fn single_nal_annex_b() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        d.push(&packet(97, 1, 100, &[0x65, 0xaa]));
        let nals = capture.nals.lock().unwrap();
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].0, vec![0, 0, 0, 1, 0x65, 0xaa]);
        assert_eq!(nals[0].1, 100);
    }

    #[test]
    fn other_payload_type_dropped() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        d.push(&packet(96, 1, 100, &[0x65, 0xaa]));
        assert!(capture.nals.lock().unwrap().is_empty());
        assert_eq!(d.stats().packets_received, 0);
    }

    #[test]
    fn truncated_packet_counted() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture);
        d.push(&[0x80, 97, 0, 1]);
        assert_eq!(d.stats().parse_errors, 1);
        assert_eq!(d.stats().packets_received, 0);
    }

    #[test]
    fn fu_a_three_fragments() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        // NRI from the indicator (0x7c & 0xe0 = 0x60), type 5 from the FU
        // header; reconstructed NAL header is 0x65.
        d.push(&packet(97, 1, 7000, &[0x7c, 0x85, 0xaa, 0xbb]));
        d.push(&packet(97, 2, 7000, &[0x7c, 0x05, 0xcc]));
        d.push(&packet(97, 3, 7000, &[0x7c, 0x45, 0xdd, 0xee]));
        let nals = capture.nals.lock().unwrap();
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].0, vec![0, 0, 0, 1, 0x65, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        assert_eq!(nals[0].1, 7000);
    }

    #[test]
    fn fu_a_timestamp_change_discards() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        d.push(&packet(97, 1, 7000, &[0x7c, 0x85, 0xaa]));
        // New timestamp with a fresh start; the old reassembly is dropped.
        d.push(&packet(97, 2, 8000, &[0x7c, 0x85, 0xbb]));
        d.push(&packet(97, 3, 8000, &[0x7c, 0x45, 0xcc]));
        let nals = capture.nals.lock().unwrap();
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].0, vec![0, 0, 0, 1, 0x65, 0xbb, 0xcc]);
        assert_eq!(d.stats().fragments_discarded, 1);
    }

    #[test]
    fn fu_a_continuation_without_start_dropped() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        d.push(&packet(97, 1, 7000, &[0x7c, 0x05, 0xcc]));
        d.push(&packet(97, 2, 7000, &[0x7c, 0x45, 0xdd]));
        assert!(capture.nals.lock().unwrap().is_empty());
        assert_eq!(d.stats().fragments_discarded, 2);
    }

    #[test]
    fn fu_a_oversize_discarded() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        d.push(&packet(97, 1, 7000, &[0x7c, 0x85, 0xaa]));
        let mut big = vec![0x7c, 0x05];
        big.resize(2 + MAX_FRAGMENT_BYTES + 1, 0);
        d.push(&packet(97, 2, 7000, &big));
        d.push(&packet(97, 3, 7000, &[0x7c, 0x45, 0xdd]));
        assert!(capture.nals.lock().unwrap().is_empty());
        assert_eq!(d.stats().fragments_discarded, 2);
    }

    #[test]
    fn sps_pps_surfaced() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        d.push(&packet(97, 1, 100, &[0x67, 0x42, 0x00]));
        d.push(&packet(97, 2, 100, &[0x68, 0xce, 0x38, 0x80]));
        assert_eq!(capture.sps.lock().unwrap()[0], vec![0x67, 0x42, 0x00]);
        assert_eq!(capture.pps.lock().unwrap()[0], vec![0x68, 0xce, 0x38, 0x80]);
        // Also emitted on the ordinary NAL path.
        assert_eq!(capture.nals.lock().unwrap().len(), 2);
    }

    #[test]
    fn loss_then_reorder() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture);
        for seq in [1000u16, 1002, 1001, 1003] {
            d.push(&packet(97, seq, 100, &[0x41, 0x9a]));
        }
        let stats = d.stats();
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.packets_reordered, 1);
        assert_eq!(stats.packets_duplicated, 0);
    }

    #[test]
    fn duplicate_dropped() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        for seq in [1000u16, 1001, 1001, 1002] {
            d.push(&packet(97, seq, 100, &[0x41, 0x9a]));
        }
        let stats = d.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_duplicated, 1);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(capture.nals.lock().unwrap().len(), 3);
    }

    #[test]
    fn unfilled_gap_stays_lost() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture);
        for seq in [1000u16, 1003, 1004] {
            d.push(&packet(97, seq, 100, &[0x41, 0x9a]));
        }
        let stats = d.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 2);
    }

    #[test]
    fn large_jump_resynchronizes() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture);
        d.push(&packet(97, 1000, 100, &[0x41, 0x9a]));
        d.push(&packet(97, 50_000, 100, &[0x41, 0x9a]));
        d.push(&packet(97, 50_001, 100, &[0x41, 0x9a]));
        let stats = d.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.max_seq, 50_001);
    }

    #[test]
    fn sequence_wraps() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture);
        for seq in [65_534u16, 65_535, 0, 1] {
            d.push(&packet(97, seq, 100, &[0x41, 0x9a]));
        }
        let stats = d.stats();
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn stats_reported_every_ten_packets() {
        let capture = Arc::new(Capture::default());
        let mut d = depacketizer(capture.clone());
        for seq in 0..10u16 {
            d.push(&packet(97, seq, 100, &[0x41, 0x9a]));
        }
        let stats = capture.stats.lock().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].packets_received, 10);
        assert!(stats[0].updated_at.is_some());
    }

    #[tokio::test]
    async fn udp_receiver_binds_fallback() {
        let first = UdpReceiver::bind(0).await.unwrap();
        // Binding the same port again must fall back to an ephemeral port
        // rather than fail.
        let second = UdpReceiver::bind(first.local_port()).await.unwrap();
        assert_ne!(second.local_port(), first.local_port());
    }

    #[tokio::test]
    async fn udp_receiver_stop_unblocks() {
        let receiver = UdpReceiver::bind(0).await.unwrap();
        let capture = Arc::new(Capture::default());
        let d = Depacketizer::new(97, capture, Timeouts::default());
        let (handle, join) = receiver.spawn(d);
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("receive loop should exit promptly")
            .unwrap();
    }
}
