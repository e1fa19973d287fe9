// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared H.264 types: NAL units, access units, video parameters, and the
//! assembler's observer surface.
//!
//! The depacketizer emits Annex-B framed NAL units; [`h264::Assembler`]
//! groups them into [`AccessUnit`]s for a decoder. Types here are the
//! vocabulary both ends speak.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

pub mod h264;

/// Coarse classification of a finalized access unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// Contains an IDR slice; decodable on its own.
    I,
    /// Contains a non-IDR slice.
    P,
    /// Reserved for when slice-header parsing can distinguish B slices.
    B,
    Unknown,
}

/// One NAL unit held inside an access unit: the raw bytes (header byte
/// first, no start code) plus the start-code length to use when
/// serializing. NAL types are 1 through 31; the assembler never constructs
/// one from an empty payload.
#[derive(Clone)]
pub struct NalUnit {
    data: Bytes,
    start_code_len: usize,
}

impl NalUnit {
    pub(crate) fn new(data: Bytes, start_code_len: usize) -> Self {
        debug_assert!(!data.is_empty());
        debug_assert!(start_code_len == 3 || start_code_len == 4);
        NalUnit {
            data,
            start_code_len,
        }
    }

    /// `nal_unit_type`, the low five bits of the header byte.
    pub fn nal_type(&self) -> u8 {
        self.data[0] & 0x1f
    }

    /// `nal_ref_idc`, bits 5..7 of the header byte. Zero means no other
    /// picture references this one.
    pub fn nal_ref_idc(&self) -> u8 {
        (self.data[0] >> 5) & 0x3
    }

    /// The NAL bytes, without a start code.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// 3 or 4; the Annex-B start code length recorded at ingest.
    pub fn start_code_len(&self) -> usize {
        self.start_code_len
    }
}

impl std::fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalUnit")
            .field("nal_type", &self.nal_type())
            .field("nal_ref_idc", &self.nal_ref_idc())
            .field("len", &self.data.len())
            .field("start_code_len", &self.start_code_len)
            .finish()
    }
}

/// A complete access unit (one coded picture), serialized as an Annex-B
/// byte stream ready for a decoder. Key frames carry the cached SPS and PPS
/// as their first two NAL units when available.
pub struct AccessUnit {
    data: Bytes,
    timestamp: u32,
    frame_type: FrameType,
    has_sps_pps: bool,
    nals: SmallVec<[NalUnit; 8]>,
}

impl AccessUnit {
    pub(crate) fn new(nals: SmallVec<[NalUnit; 8]>, timestamp: u32, frame_type: FrameType, has_sps_pps: bool) -> Self {
        let data = serialize_annex_b(&nals);
        AccessUnit {
            data,
            timestamp,
            frame_type,
            has_sps_pps,
            nals,
        }
    }

    /// The Annex-B byte stream: each NAL prefixed by its recorded start
    /// code.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// The RTP timestamp of the first slice NAL.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::I
    }

    /// True iff the first two NAL units are the cached SPS and PPS.
    pub fn has_parameter_sets(&self) -> bool {
        self.has_sps_pps
    }

    pub fn nal_units(&self) -> &[NalUnit] {
        &self.nals
    }
}

impl std::fmt::Debug for AccessUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUnit")
            .field("timestamp", &self.timestamp)
            .field("frame_type", &self.frame_type)
            .field("has_sps_pps", &self.has_sps_pps)
            .field("nals", &self.nals)
            .field("data_len", &self.data.len())
            .finish()
    }
}

fn serialize_annex_b(nals: &[NalUnit]) -> Bytes {
    const START_CODE: [u8; 4] = [0, 0, 0, 1];
    let total: usize = nals.iter().map(|n| n.start_code_len() + n.data().len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for nal in nals {
        buf.put_slice(&START_CODE[4 - nal.start_code_len()..]);
        buf.put_slice(nal.data());
    }
    buf.freeze()
}

/// Decoded video stream parameters.
///
/// Real values require Exponential-Golomb parsing of the SPS, which isn't
/// implemented; every stream currently reports this type's `Default` of
/// 1920x1080 at 30 fps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoParameters {
    pixel_dimensions: (u32, u32),
    frame_rate: u32,
}

impl VideoParameters {
    /// `(width, height)` in pixels.
    pub fn pixel_dimensions(&self) -> (u32, u32) {
        self.pixel_dimensions
    }

    /// Frames per second.
    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }
}

impl Default for VideoParameters {
    fn default() -> Self {
        VideoParameters {
            pixel_dimensions: (1920, 1080),
            frame_rate: 30,
        }
    }
}

/// Assembly statistics, reported from the assembler's sweep.
#[derive(Clone, Debug, Default)]
pub struct AssemblerStats {
    pub nals_received: u64,
    pub frames_emitted: u64,
    pub key_frames: u64,

    /// Finalized frames evicted from a full output queue.
    pub frames_dropped: u64,

    /// Incomplete frames discarded for exceeding their age bound.
    pub stale_frames_discarded: u64,

    /// Non-slice NAL units that arrived with no frame in progress (or a
    /// different timestamp) and were dropped.
    pub orphan_nals: u64,
}

/// Receives access units and statistics from an [`h264::Assembler`].
/// Callbacks are invoked synchronously from `push_nal`/`sweep`, so they're
/// serialized per assembler.
pub trait AssemblerHandler: Send + Sync + 'static {
    /// An SPS was observed; `params` is the current (declared-default)
    /// decode geometry.
    fn on_parameters(&self, _params: &VideoParameters) {}

    /// A PPS was observed and cached.
    fn on_pps(&self) {}

    /// A finalized access unit. The same unit is also queued for
    /// [`h264::Assembler::pop_frame`].
    fn on_frame(&self, _frame: &AccessUnit) {}

    fn on_warning(&self, _message: &str) {}

    fn on_stats(&self, _stats: &AssemblerStats) {}
}
