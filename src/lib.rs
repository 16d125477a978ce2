// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 elementary stream handling.
//!
//! This library covers the codec-level bookkeeping a media pipeline needs
//! between capture/demux and packetization/recording:
//!
//! *   splitting composite [Annex B](https://www.itu.int/rec/T-REC-H.264)
//!     buffers into NAL units without copying,
//! *   tracking the stream's current sequence/picture parameter sets
//!     (SPS/PPS) and guaranteeing they precede every key frame sent
//!     downstream,
//! *   deriving video geometry from the SPS, and
//! *   rendering an [RFC 6184](https://tools.ietf.org/html/rfc6184)-style
//!     SDP media description from the stored parameter sets.
//!
//! It does not own a wire protocol: RTP packetization, transport, and
//! full-session SDP assembly are the caller's business.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

pub mod frame;
pub mod h264;
pub mod sdp;
