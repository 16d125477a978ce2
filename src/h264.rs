// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en) elementary
//! stream logic: the per-stream track state machine and SPS geometry
//! extraction.

pub mod nal;

use bytes::Bytes;
use log::{debug, trace};

use crate::error::ErrorInt;
use crate::frame::{CodecId, Frame, FrameSink};
use crate::sdp::Sdp;
use crate::Error;

use self::nal::{NalUnits, UnitType};

/// Per-stream state for an H.264 video track.
///
/// The track ingests encoded frames in arrival order, learns the stream's
/// SPS/PPS, and forwards every frame to the registered sink, re-inserting
/// the stored parameter sets in front of each key frame so the forwarded
/// stream is independently decodable from any IDR onward.
///
/// Not internally synchronized: exactly one producer must call
/// [`H264Track::input_frame`], in strict arrival order.
pub struct H264Track {
    /// Current SPS NAL, without start code. Empty until discovered.
    sps: Bytes,

    /// Current PPS NAL, without start code. Empty until discovered.
    pps: Bytes,

    width: u32,
    height: u32,
    fps: f32,

    /// The previous forwarded frame was an IDR; suppresses duplicate config
    /// insertion across a run of consecutive key frames.
    last_frame_is_idr: bool,

    sink: Option<Box<dyn FrameSink>>,
}

impl H264Track {
    /// Creates a track that discovers its parameter sets from the stream.
    pub fn new() -> Self {
        Self::with_parameters(Bytes::new(), Bytes::new())
    }

    /// Creates a track from known parameter sets, each preceded by a start
    /// code of the given length (3 or 4 bytes). Geometry is resolved
    /// immediately.
    pub fn with_parameter_sets(
        sps: &[u8],
        pps: &[u8],
        sps_prefix_len: usize,
        pps_prefix_len: usize,
    ) -> Self {
        Self::with_parameters(
            Bytes::copy_from_slice(&sps[sps_prefix_len..]),
            Bytes::copy_from_slice(&pps[pps_prefix_len..]),
        )
    }

    /// Creates a track from SPS and PPS frames as delivered by the capture
    /// pipeline, taking the payload past each frame's own prefix. Geometry
    /// is resolved immediately.
    ///
    /// Fails unless both frames carry [`CodecId::H264`].
    pub fn from_frames(sps: &Frame, pps: &Frame) -> Result<Self, Error> {
        if sps.codec_id() != CodecId::H264 || pps.codec_id() != CodecId::H264 {
            bail!(ErrorInt::InvalidArgument(format!(
                "H264Track requires H264 frames, got {:?}/{:?}",
                sps.codec_id(),
                pps.codec_id(),
            )));
        }
        Ok(Self::with_parameters(
            sps.payload_bytes(),
            pps.payload_bytes(),
        ))
    }

    fn with_parameters(sps: Bytes, pps: Bytes) -> Self {
        let mut track = H264Track {
            sps,
            pps,
            width: 0,
            height: 0,
            fps: 0.0,
            last_frame_is_idr: false,
            sink: None,
        };
        if track.ready() {
            track.on_ready();
        }
        track
    }

    /// A fresh track seeded with this one's construction parameters: the
    /// same SPS/PPS (and the geometry derived from them), clean dynamic
    /// state, no sink.
    pub fn clone_template(&self) -> H264Track {
        Self::with_parameters(self.sps.clone(), self.pps.clone())
    }

    /// Both parameter sets are known.
    pub fn ready(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }

    /// The current SPS NAL, without start code. Empty until discovered.
    pub fn sps(&self) -> &Bytes {
        &self.sps
    }

    /// The current PPS NAL, without start code. Empty until discovered.
    pub fn pps(&self) -> &Bytes {
        &self.pps
    }

    /// Coded width in pixels; 0 until resolved from the SPS.
    pub fn video_width(&self) -> u32 {
        self.width
    }

    /// Coded height in pixels; 0 until resolved from the SPS.
    pub fn video_height(&self) -> u32 {
        self.height
    }

    /// Frame rate; 0 until resolved, and 0 if the SPS has no timing info.
    pub fn video_fps(&self) -> f32 {
        self.fps
    }

    /// Registers the sink that receives every forwarded frame.
    pub fn set_frame_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sink = Some(sink);
    }

    pub fn clear_frame_sink(&mut self) {
        self.sink = None;
    }

    /// Ingests one frame in arrival order.
    ///
    /// SPS/PPS units update the stored parameter sets and are not forwarded
    /// themselves; owned copies are re-inserted in front of the next key
    /// frame instead. Everything else is forwarded to the sink unchanged.
    ///
    /// Some devices bundle SPS+PPS+IDR into a single delivery buffer, so a
    /// frame that classifies as SPS is split at its internal start codes and
    /// each unit is handled in order, as a zero-copy view of the input. The
    /// first unit's start code is the frame's own prefix; internal start
    /// codes are taken to be the 3-byte form.
    ///
    /// The frame must be at least `prefix_len() + 1` bytes.
    pub fn input_frame(&mut self, frame: Frame) {
        let unit_type = UnitType::from_header(frame.data()[frame.prefix_len()]);
        if unit_type != UnitType::SeqParameterSet {
            self.input_unit(frame);
            return;
        }
        let mut first = true;
        for range in NalUnits::new(frame.data()) {
            let sub = if first {
                first = false;
                Frame::view_of(&frame, 0..range.end, frame.prefix_len())
            } else {
                Frame::view_of(&frame, range.start - 3..range.end, 3)
            };
            if sub.size() <= sub.prefix_len() {
                continue; // too short to hold a NAL header
            }
            self.input_unit(sub);
        }
    }

    /// Handles a single NAL unit: parameter set capture, config insertion,
    /// forwarding, and geometry resolution.
    fn input_unit(&mut self, frame: Frame) {
        let unit_type = UnitType::from_header(frame.payload()[0]);
        match unit_type {
            UnitType::SeqParameterSet => {
                trace!("new sps, {} bytes", frame.payload().len());
                self.sps = frame.payload_bytes();
            }
            UnitType::PicParameterSet => {
                trace!("new pps, {} bytes", frame.payload().len());
                self.pps = frame.payload_bytes();
            }
            UnitType::IdrSlice => {
                self.insert_config_frames(&frame);
                self.forward(&frame);
            }
            _ => self.forward(&frame),
        }
        self.last_frame_is_idr = unit_type == UnitType::IdrSlice;
        if self.width == 0 && self.ready() {
            self.on_ready();
        }
    }

    /// Re-sends the stored parameter sets in front of a key frame, stamped
    /// with its timestamp, so a consumer joining at this frame can decode.
    /// Skipped when the previous forwarded frame was itself a key frame:
    /// one config pair per run of consecutive IDRs.
    fn insert_config_frames(&mut self, frame: &Frame) {
        if self.last_frame_is_idr {
            return;
        }
        if !self.sps.is_empty() {
            let sps = Frame::h264_owned(&self.sps, frame.dts());
            self.forward(&sps);
        }
        if !self.pps.is_empty() {
            let pps = Frame::h264_owned(&self.pps, frame.dts());
            self.forward(&pps);
        }
    }

    fn forward(&mut self, frame: &Frame) {
        if let Some(sink) = self.sink.as_mut() {
            sink.on_frame(frame);
        }
    }

    /// Parses the stored SPS for geometry. Failure leaves the zeros in
    /// place; the parse is retried as further input arrives.
    fn on_ready(&mut self) {
        if let Some((width, height, fps)) = sps_geometry(&self.sps) {
            self.width = width;
            self.height = height;
            self.fps = fps;
            debug!("resolved geometry: {}x{} @ {} fps", width, height, fps);
        }
    }

    /// Builds the SDP media description for this track, with the default
    /// payload type and bitrate.
    ///
    /// Precondition: [`H264Track::ready`]; the description embeds both
    /// parameter sets.
    pub fn sdp(&self) -> Result<Sdp, Error> {
        if !self.ready() {
            bail!(ErrorInt::FailedPrecondition(
                "can't build SDP before both parameter sets are known".to_owned()
            ));
        }
        Ok(Sdp::new(
            &self.sps,
            &self.pps,
            Sdp::DEFAULT_PAYLOAD_TYPE,
            Sdp::DEFAULT_BITRATE_KBPS,
        ))
    }
}

impl Default for H264Track {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for H264Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H264Track")
            .field("sps", &self.sps)
            .field("pps", &self.pps)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fps", &self.fps)
            .field("last_frame_is_idr", &self.last_frame_is_idr)
            .field("sink", &self.sink.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Extracts `(width, height, fps)` from an SPS NAL unit (without start
/// code).
///
/// Returns `None` when the SPS doesn't parse; fps is 0 when it parses but
/// carries no VUI timing information.
pub fn sps_geometry(sps_nal: &[u8]) -> Option<(u32, u32, f32)> {
    if sps_nal.is_empty() {
        return None;
    }
    let rbsp = match h264_reader::rbsp::decode_nal(sps_nal) {
        Ok(rbsp) => rbsp,
        Err(e) => {
            debug!("failed to decode sps nal: {:?}", e);
            return None;
        }
    };
    if rbsp.len() < 4 {
        debug!("sps rbsp too short: {} bytes", rbsp.len());
        return None;
    }
    let sps = match h264_reader::nal::sps::SeqParameterSet::from_bits(
        h264_reader::rbsp::BitReader::new(&*rbsp),
    ) {
        Ok(sps) => sps,
        Err(e) => {
            debug!("bad sps: {:?}", e);
            return None;
        }
    };
    let (width, height) = match sps.pixel_dimensions() {
        Ok(d) => d,
        Err(e) => {
            debug!("sps has invalid pixel dimensions: {:?}", e);
            return None;
        }
    };
    let fps = sps
        .vui_parameters
        .as_ref()
        .and_then(|vui| vui.timing_info.as_ref())
        .and_then(|t| {
            t.num_units_in_tick
                .checked_mul(2)
                .filter(|&doubled| doubled != 0)
                .map(|doubled| t.time_scale as f32 / doubled as f32)
        })
        .unwrap_or(0.0);
    Some((width, height, fps))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;

    use super::*;
    use crate::frame::TrackType;

    /// 640x480 Main profile SPS and matching PPS from a real camera stream.
    const SPS: &[u8] =
        b"\x67\x4d\x40\x1e\x9a\x64\x05\x01\xef\xf3\x50\x10\x10\x14\x00\x00\x0f\xa0\x00\x01\x38\x80\x10";
    const PPS: &[u8] = b"\x68\xee\x3c\x80";

    #[derive(Clone, Default)]
    struct Collect(Rc<RefCell<Vec<Frame>>>);

    impl FrameSink for Collect {
        fn on_frame(&mut self, frame: &Frame) {
            self.0.borrow_mut().push(frame.clone());
        }
    }

    impl Collect {
        fn frames(&self) -> Vec<Frame> {
            self.0.borrow().clone()
        }

        fn unit_types(&self) -> Vec<u8> {
            self.0
                .borrow()
                .iter()
                .map(|f| nal::nal_unit_type(f.payload()[0]))
                .collect()
        }
    }

    fn track_with_sink() -> (H264Track, Collect) {
        let mut track = H264Track::new();
        let collect = Collect::default();
        track.set_frame_sink(Box::new(collect.clone()));
        (track, collect)
    }

    /// Wraps `nal` with the canonical 4-byte start code, as the capture
    /// pipeline delivers single units.
    fn annex_b(nal_unit: &[u8]) -> Frame {
        let mut buf = Vec::with_capacity(4 + nal_unit.len());
        buf.extend_from_slice(&nal::START_CODE);
        buf.extend_from_slice(nal_unit);
        Frame::h264_wrapped(buf.into(), 0, None, 4)
    }

    #[test]
    fn config_insertion_is_idempotent_across_consecutive_idrs() {
        let (mut track, sink) = track_with_sink();
        track.input_frame(annex_b(SPS));
        track.input_frame(annex_b(PPS));
        track.input_frame(annex_b(b"\x65idr one"));
        track.input_frame(annex_b(b"\x65idr two"));

        // One config pair for the whole IDR run.
        assert_eq!(sink.unit_types(), vec![7, 8, 5, 5]);
        let frames = sink.frames();
        assert_eq!(frames[0].payload(), SPS);
        assert_eq!(frames[0].prefix_len(), 4);
        assert!(frames[0].is_retainable());
        assert_eq!(frames[1].payload(), PPS);
        assert_eq!(frames[2].payload(), b"\x65idr one");
        assert_eq!(frames[3].payload(), b"\x65idr two");
    }

    #[test]
    fn config_reinserted_after_non_key_frame() {
        let (mut track, sink) = track_with_sink();
        track.input_frame(annex_b(SPS));
        track.input_frame(annex_b(PPS));
        track.input_frame(annex_b(b"\x65idr"));
        track.input_frame(annex_b(b"\x41p slice"));
        track.input_frame(annex_b(b"\x65idr"));
        assert_eq!(sink.unit_types(), vec![7, 8, 5, 1, 7, 8, 5]);
    }

    #[test]
    fn sei_forwarded_unchanged() {
        let (mut track, sink) = track_with_sink();
        track.input_frame(annex_b(b"\x06sei payload"));
        assert_eq!(sink.unit_types(), vec![6]);
        assert_eq!(sink.frames()[0].payload(), b"\x06sei payload");
    }

    #[test]
    fn composite_frame_learns_parameters_and_forwards_idr() {
        let (mut track, sink) = track_with_sink();
        let mut buf = Vec::new();
        buf.extend_from_slice(&nal::START_CODE);
        buf.extend_from_slice(SPS);
        buf.extend_from_slice(b"\x00\x00\x01");
        buf.extend_from_slice(PPS);
        buf.extend_from_slice(b"\x00\x00\x01");
        buf.extend_from_slice(b"\x65idr slice");
        track.input_frame(Frame::h264_wrapped(buf.into(), 1_234, None, 4));

        assert!(track.ready());
        assert_eq!(&track.sps()[..], SPS);
        assert_eq!(&track.pps()[..], PPS);
        assert_eq!(track.video_width(), 640);
        assert_eq!(track.video_height(), 480);

        // Config pair inserted from the freshly stored sets, then the IDR.
        assert_eq!(sink.unit_types(), vec![7, 8, 5]);
        let frames = sink.frames();
        assert_eq!(frames[0].payload(), SPS);
        assert_eq!(frames[0].prefix_len(), 4);
        assert!(frames[0].is_retainable());
        assert_eq!(frames[1].payload(), PPS);

        // The IDR is a zero-copy view of the composite input: 3-byte
        // prefix, the input's timestamp and (non-)retainability.
        assert_eq!(frames[2].payload(), b"\x65idr slice");
        assert_eq!(frames[2].prefix_len(), 3);
        assert_eq!(frames[2].dts(), 1_234);
        assert!(!frames[2].is_retainable());
    }

    #[test]
    fn prefix_stripping_on_construction() {
        let mut sps = b"\x00\x00\x00\x01".to_vec();
        sps.extend_from_slice(SPS);
        let mut pps = b"\x00\x00\x01".to_vec();
        pps.extend_from_slice(PPS);
        let track = H264Track::with_parameter_sets(&sps, &pps, 4, 3);
        assert_eq!(&track.sps()[..], SPS);
        assert_eq!(&track.pps()[..], PPS);
        assert!(track.ready());
        assert_eq!(track.video_width(), 640);
    }

    #[test]
    fn from_frames_requires_h264() {
        let sps = annex_b(SPS);
        let not_h264 = Frame::wrapped(
            CodecId::Aac,
            TrackType::Audio,
            Bytes::from_static(b"\x00\x00\x00\x01\xffdata"),
            0,
            None,
            4,
        );
        H264Track::from_frames(&sps, &not_h264).unwrap_err();
        let err = H264Track::from_frames(&not_h264, &sps).unwrap_err();
        assert!(err.to_string().starts_with("Invalid argument"));
    }

    #[test]
    fn from_frames_stores_payloads_and_resolves_geometry() {
        let track = H264Track::from_frames(&annex_b(SPS), &annex_b(PPS)).unwrap();
        assert!(track.ready());
        assert_eq!(&track.sps()[..], SPS);
        assert_eq!(&track.pps()[..], PPS);
        assert_eq!((track.video_width(), track.video_height()), (640, 480));
    }

    #[test]
    fn geometry_resolves_when_both_parameter_sets_arrive() {
        let (mut track, _sink) = track_with_sink();
        assert_eq!(
            (track.video_width(), track.video_height(), track.video_fps()),
            (0, 0, 0.0)
        );
        track.input_frame(annex_b(SPS));
        assert!(!track.ready());
        assert_eq!(track.video_width(), 0);
        track.input_frame(annex_b(PPS));
        assert!(track.ready());
        assert_eq!((track.video_width(), track.video_height()), (640, 480));
    }

    #[test]
    fn unparseable_sps_leaves_geometry_unresolved() {
        let (mut track, sink) = track_with_sink();
        track.input_frame(annex_b(b"\x67\xff"));
        track.input_frame(annex_b(PPS));
        assert!(track.ready());
        assert_eq!(
            (track.video_width(), track.video_height(), track.video_fps()),
            (0, 0, 0.0)
        );

        // Forwarding doesn't need geometry.
        track.input_frame(annex_b(b"\x65idr"));
        assert_eq!(sink.unit_types(), vec![7, 8, 5]);
    }

    #[test]
    fn idr_before_parameter_sets_forwarded_bare() {
        let (mut track, sink) = track_with_sink();
        track.input_frame(annex_b(b"\x65idr"));
        assert_eq!(sink.unit_types(), vec![5]);
    }

    #[test]
    fn sdp_requires_ready() {
        let track = H264Track::new();
        let err = track.sdp().unwrap_err();
        assert!(err.to_string().starts_with("Failed precondition"));

        let track = H264Track::from_frames(&annex_b(SPS), &annex_b(PPS)).unwrap();
        let sdp = track.sdp().unwrap();
        assert!(sdp.text().contains("a=rtpmap:96 H264/90000"));
    }

    #[test]
    fn clone_template_seeds_parameters_only() {
        let (mut track, _sink) = track_with_sink();
        track.input_frame(annex_b(SPS));
        track.input_frame(annex_b(PPS));
        track.input_frame(annex_b(b"\x65idr"));

        let mut clone = track.clone_template();
        assert_eq!(&clone.sps()[..], SPS);
        assert_eq!(clone.video_width(), 640);

        // Dynamic state doesn't carry over: the first IDR into the clone
        // gets a config pair even though the original just forwarded one.
        let sink = Collect::default();
        clone.set_frame_sink(Box::new(sink.clone()));
        clone.input_frame(annex_b(b"\x65idr"));
        assert_eq!(sink.unit_types(), vec![7, 8, 5]);
    }

    #[test]
    fn sps_geometry_soft_fails() {
        assert_eq!(sps_geometry(b""), None);
        assert_eq!(sps_geometry(b"\x67"), None);
        assert_eq!(sps_geometry(b"\x67\xff"), None);
        let (width, height, _fps) = sps_geometry(SPS).unwrap();
        assert_eq!((width, height), (640, 480));
    }
}
