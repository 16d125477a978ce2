// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frame abstractions shared between the capture side and the track layer.

use std::ops::Range;

use bytes::Bytes;
use pretty_hex::PrettyHex;

use crate::h264::nal;

/// The broad class of media a track or frame carries.
///
/// The discriminant doubles as the track id in SDP `a=control` lines.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackType {
    Video = 0,
    Audio = 1,
}

/// Identifies a frame's codec, checked at track construction seams.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecId {
    H264,
    H265,
    Aac,
}

/// A single encoded frame flowing through the pipeline: a start-code prefix
/// followed by one NAL unit (or, from some devices, several bundled units).
///
/// One type covers the three ownership shapes the pipeline needs:
///
/// *   a self-contained frame built by [`Frame::h264_owned`], which copies
///     its payload and may be cached indefinitely;
/// *   a zero-copy wrapper around a buffer managed elsewhere
///     ([`Frame::h264_wrapped`]), which downstream stages must not hold past
///     the call that delivered it; and
/// *   a zero-copy view of a sub-range of another frame
///     ([`Frame::view_of`]), which shares the parent's backing buffer and
///     inherits its retainability.
///
/// Clones are cheap; the backing buffer is reference-counted.
#[derive(Clone)]
pub struct Frame {
    data: Bytes,
    dts: u32,
    pts: Option<u32>,
    prefix_len: usize,
    track_type: TrackType,
    codec_id: CodecId,
    retainable: bool,
}

impl Frame {
    /// Copies `nal_unit` (a NAL unit without start code) into a new
    /// self-contained frame, prepending the canonical 4-byte start code.
    pub fn h264_owned(nal_unit: &[u8], dts: u32) -> Self {
        let mut data = Vec::with_capacity(nal::START_CODE.len() + nal_unit.len());
        data.extend_from_slice(&nal::START_CODE);
        data.extend_from_slice(nal_unit);
        Frame {
            data: data.into(),
            dts,
            pts: None,
            prefix_len: nal::START_CODE.len(),
            track_type: TrackType::Video,
            codec_id: CodecId::H264,
            retainable: true,
        }
    }

    /// Wraps a buffer supplied by the capture pipeline as an H.264 video
    /// frame, without copying.
    ///
    /// The frame is not retainable: the pipeline is free to recycle the
    /// buffer's storage once the call that delivered the frame returns, so
    /// downstream stages must copy anything they want to keep.
    ///
    /// The buffer must start with a `prefix_len`-byte start code and must be
    /// at least `prefix_len + 1` bytes long.
    pub fn h264_wrapped(data: Bytes, dts: u32, pts: Option<u32>, prefix_len: usize) -> Self {
        Self::wrapped(CodecId::H264, TrackType::Video, data, dts, pts, prefix_len)
    }

    /// As [`Frame::h264_wrapped`], with an explicit codec and track type.
    pub fn wrapped(
        codec_id: CodecId,
        track_type: TrackType,
        data: Bytes,
        dts: u32,
        pts: Option<u32>,
        prefix_len: usize,
    ) -> Self {
        debug_assert!(prefix_len == 3 || prefix_len == 4);
        Frame {
            data,
            dts,
            pts,
            prefix_len,
            track_type,
            codec_id,
            retainable: false,
        }
    }

    /// A zero-copy view of `range` within `parent`, sharing its backing
    /// buffer, timestamps, and tags.
    ///
    /// The buffer's reference count keeps the view valid no matter what
    /// happens to `parent` itself, but the view is only retainable if the
    /// parent is.
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the parent's buffer.
    pub fn view_of(parent: &Frame, range: Range<usize>, prefix_len: usize) -> Self {
        assert!(
            range.start <= range.end && range.end <= parent.data.len(),
            "view {:?} not within {}-byte parent",
            range,
            parent.data.len(),
        );
        debug_assert!(prefix_len == 3 || prefix_len == 4);
        Frame {
            data: parent.data.slice(range),
            dts: parent.dts,
            pts: parent.pts,
            prefix_len,
            track_type: parent.track_type,
            codec_id: parent.codec_id,
            retainable: parent.retainable,
        }
    }

    /// The full buffer, including the start code prefix.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bytes past the start code prefix.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.prefix_len..]
    }

    /// [`Frame::payload`] as a shared handle into this frame's buffer.
    pub(crate) fn payload_bytes(&self) -> Bytes {
        self.data.slice(self.prefix_len..)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Decode timestamp, in the stream's clock units.
    pub fn dts(&self) -> u32 {
        self.dts
    }

    /// Presentation timestamp; follows [`Frame::dts`] when unset.
    pub fn pts(&self) -> u32 {
        self.pts.unwrap_or(self.dts)
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub fn codec_id(&self) -> CodecId {
        self.codec_id
    }

    /// Whether downstream stages may hold onto this frame after the call
    /// that delivered it.
    pub fn is_retainable(&self) -> bool {
        self.retainable
    }

    /// True iff this is an IDR slice.
    pub fn key_frame(&self) -> bool {
        nal::UnitType::from_header(self.data[self.prefix_len]) == nal::UnitType::IdrSlice
    }

    /// True iff this is a sequence or picture parameter set.
    pub fn config_frame(&self) -> bool {
        matches!(
            nal::UnitType::from_header(self.data[self.prefix_len]),
            nal::UnitType::SeqParameterSet | nal::UnitType::PicParameterSet
        )
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("codec_id", &self.codec_id)
            .field("dts", &self.dts)
            .field("pts", &self.pts())
            .field("prefix_len", &self.prefix_len)
            .field("retainable", &self.retainable)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

/// Receives the frames leaving a track, in arrival order.
///
/// Called synchronously from [`crate::h264::H264Track::input_frame`]; there
/// is no queue, so backpressure is the implementation's business. A
/// non-retainable frame must not be held past the call; check
/// [`Frame::is_retainable`] before caching a clone.
pub trait FrameSink {
    fn on_frame(&mut self, frame: &Frame);
}
