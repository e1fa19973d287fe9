// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grouping of H.264 NAL units into access units as specified in
//! [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184) and ITU-T
//! H.264 section 7.4.1.2.
//!
//! This doesn't inspect slice headers, so frame boundaries are driven by
//! NAL type and RTP timestamp alone: a slice NAL opens a frame, an access
//! unit delimiter or a timestamp change closes it. Cached SPS/PPS are
//! prepended to key frames so a decoder can start from any of them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};
use log::debug;
use smallvec::SmallVec;

use super::{AccessUnit, AssemblerHandler, AssemblerStats, FrameType, NalUnit, VideoParameters};
use crate::Timeouts;

/// A single access unit may not exceed this many serialized bytes;
/// exceeding it finalizes whatever is held.
const MAX_FRAME_BYTES: usize = 2 << 20;

/// Finalized frames waiting for [`Assembler::pop_frame`]; the oldest is
/// evicted on overflow.
const FRAME_QUEUE_CAPACITY: usize = 20;

struct PendingFrame {
    nals: SmallVec<[NalUnit; 8]>,
    timestamp: u32,
    since: Instant,

    /// Serialized size so far, start codes included.
    len: usize,
}

impl PendingFrame {
    fn start(nal: NalUnit, timestamp: u32, now: Instant) -> Self {
        let len = nal.start_code_len() + nal.data().len();
        let mut nals = SmallVec::new();
        nals.push(nal);
        PendingFrame {
            nals,
            timestamp,
            since: now,
            len,
        }
    }

    fn push(&mut self, nal: NalUnit) {
        self.len += nal.start_code_len() + nal.data().len();
        self.nals.push(nal);
    }
}

/// Groups Annex-B NAL units into [`AccessUnit`]s.
pub struct Assembler {
    handler: Arc<dyn AssemblerHandler>,
    timeouts: Timeouts,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    parameters: VideoParameters,
    current: Option<PendingFrame>,
    queue: VecDeque<AccessUnit>,
    stats: AssemblerStats,
    last_sweep: Instant,
}

impl Assembler {
    pub fn new(handler: Arc<dyn AssemblerHandler>, timeouts: Timeouts) -> Self {
        Assembler {
            handler,
            timeouts,
            sps: None,
            pps: None,
            parameters: VideoParameters::default(),
            current: None,
            queue: VecDeque::with_capacity(FRAME_QUEUE_CAPACITY),
            stats: AssemblerStats::default(),
            last_sweep: Instant::now(),
        }
    }

    /// Seeds the SPS/PPS cache, typically from the SDP's
    /// `sprop-parameter-sets`, so the first key frame already carries
    /// decoder configuration.
    pub fn set_parameter_sets(&mut self, sps: Bytes, pps: Bytes) {
        self.sps = Some(sps);
        self.pps = Some(pps);
    }

    /// A statistics snapshot.
    pub fn stats(&self) -> AssemblerStats {
        self.stats.clone()
    }

    /// Number of finalized frames awaiting [`Assembler::pop_frame`].
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// The oldest finalized frame, if any.
    pub fn pop_frame(&mut self) -> Option<AccessUnit> {
        self.queue.pop_front()
    }

    /// Accepts one NAL unit as emitted by the depacketizer: Annex-B framed
    /// (3- or 4-byte start code tolerated), with its RTP timestamp.
    pub fn push_nal(&mut self, nal: Bytes, timestamp: u32) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) >= self.timeouts.sweep_period {
            self.sweep_at(now);
        }

        let (raw, start_code_len) = strip_start_code(nal);
        if raw.is_empty() {
            self.stats.orphan_nals += 1;
            return;
        }
        let header = match NalHeader::new(raw[0]) {
            Ok(h) => h,
            Err(e) => {
                debug!("dropping NAL with bad header {:02x}: {:?}", raw[0], e);
                self.stats.orphan_nals += 1;
                return;
            }
        };
        self.stats.nals_received += 1;
        let nal = NalUnit::new(raw, start_code_len);

        match header.nal_unit_type() {
            UnitType::SliceLayerWithoutPartitioningIdr
            | UnitType::SliceLayerWithoutPartitioningNonIdr => {
                // Every slice begins a new frame.
                self.finalize();
                self.current = Some(PendingFrame::start(nal, timestamp, now));
                self.enforce_frame_bound();
            }
            UnitType::AccessUnitDelimiter => {
                // The delimiter closes the frame but isn't part of it.
                self.finalize();
            }
            unit_type => {
                if unit_type == UnitType::SeqParameterSet {
                    self.sps = Some(nal.data().clone());
                    self.handler.on_parameters(&self.parameters);
                } else if unit_type == UnitType::PicParameterSet {
                    self.pps = Some(nal.data().clone());
                    self.handler.on_pps();
                }
                match &mut self.current {
                    Some(frame) if frame.timestamp == timestamp => {
                        frame.push(nal);
                        self.enforce_frame_bound();
                    }
                    Some(_) => {
                        // Timestamp moved on; close the frame. The NAL
                        // itself can't open one, so it's dropped.
                        self.finalize();
                        self.stats.orphan_nals += 1;
                    }
                    None => {
                        self.stats.orphan_nals += 1;
                    }
                }
            }
        }
    }

    /// Discards a stale in-progress frame and reports statistics. Intended
    /// to be driven by a housekeeping tick; also invoked from `push_nal`.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now());
        self.handler.on_stats(&self.stats);
    }

    fn sweep_at(&mut self, now: Instant) {
        self.last_sweep = now;
        if let Some(frame) = &self.current {
            if now.duration_since(frame.since) >= self.timeouts.frame_age {
                debug!(
                    "discarding stale incomplete frame (ts={}, {} NALs)",
                    frame.timestamp,
                    frame.nals.len()
                );
                self.current = None;
                self.stats.stale_frames_discarded += 1;
            }
        }
    }

    fn enforce_frame_bound(&mut self) {
        let oversize = matches!(&self.current, Some(f) if f.len > MAX_FRAME_BYTES);
        if oversize {
            debug!("frame exceeds {} bytes; finalizing early", MAX_FRAME_BYTES);
            self.finalize();
        }
    }

    /// Closes the in-progress frame, classifying it and prepending cached
    /// parameter sets to key frames.
    fn finalize(&mut self) {
        let frame = match self.current.take() {
            Some(f) => f,
            None => return,
        };
        let mut frame_type = FrameType::Unknown;
        for nal in &frame.nals {
            match nal.nal_type() {
                5 => {
                    frame_type = FrameType::I;
                    break;
                }
                1 => frame_type = FrameType::P,
                _ => {}
            }
        }

        let mut nals = frame.nals;
        let mut has_sps_pps = false;
        if frame_type == FrameType::I {
            if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                nals.insert(0, NalUnit::new(pps.clone(), 4));
                nals.insert(0, NalUnit::new(sps.clone(), 4));
                has_sps_pps = true;
            }
        }

        let unit = AccessUnit::new(nals, frame.timestamp, frame_type, has_sps_pps);
        self.stats.frames_emitted += 1;
        if unit.is_key_frame() {
            self.stats.key_frames += 1;
        }
        self.handler.on_frame(&unit);
        if self.queue.len() == FRAME_QUEUE_CAPACITY {
            self.queue.pop_front();
            self.stats.frames_dropped += 1;
        }
        self.queue.push_back(unit);
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("has_sps", &self.sps.is_some())
            .field("has_pps", &self.pps.is_some())
            .field("in_progress", &self.current.is_some())
            .field("queued", &self.queue.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Splits an Annex-B framed NAL into its raw bytes and the start-code
/// length (4 when no prefix is recognized, matching the emitter default).
fn strip_start_code(nal: Bytes) -> (Bytes, usize) {
    if nal.len() > 4 && nal[..4] == [0, 0, 0, 1] {
        (nal.slice(4..), 4)
    } else if nal.len() > 3 && nal[..3] == [0, 0, 1] {
        (nal.slice(3..), 3)
    } else {
        (nal, 4)
    }
}
