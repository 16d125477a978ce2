// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SDP media description fragments for H.264, as in
//! [RFC 6184 section 8.2](https://tools.ietf.org/html/rfc6184#section-8.2).

use std::fmt::Write as _;

use crate::frame::TrackType;

/// RTP clock rate for H.264 video; always 90 kHz.
pub const CLOCK_RATE: u32 = 90_000;

/// An RFC 6184 media description for one H.264 track.
///
/// This is a fragment (the `m=`/`b=`/`a=` lines for a single track) which
/// the session layer merges into a full session description.
#[derive(Clone, Debug)]
pub struct Sdp {
    text: String,
    payload_type: u8,
}

impl Sdp {
    /// Payload type used when the caller doesn't pick one: the first
    /// dynamic payload type number.
    pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

    /// Advertised bandwidth used when the caller doesn't pick one, in kbps.
    pub const DEFAULT_BITRATE_KBPS: u32 = 4000;

    /// Renders the fragment from parameter sets given without start codes.
    ///
    /// `profile-level-id` is the 24-bit value at SPS bytes 1..4
    /// (profile_idc, constraint flags, level_idc); an SPS shorter than that
    /// yields zero rather than an error.
    pub fn new(sps: &[u8], pps: &[u8], payload_type: u8, bitrate_kbps: u32) -> Self {
        let profile_level_id = if sps.len() >= 4 {
            (u32::from(sps[1]) << 16) | (u32::from(sps[2]) << 8) | u32::from(sps[3])
        } else {
            0
        };
        let mut text = String::new();
        let _ = write!(
            &mut text,
            "m=video 0 RTP/AVP {pt}\r\n\
             b=AS:{bitrate}\r\n\
             a=rtpmap:{pt} H264/{clock}\r\n\
             a=fmtp:{pt} packetization-mode=1; profile-level-id={plid:06X}; \
             sprop-parameter-sets={sps},{pps}\r\n\
             a=control:trackID={track_id}\r\n",
            pt = payload_type,
            bitrate = bitrate_kbps,
            clock = CLOCK_RATE,
            plid = profile_level_id,
            sps = base64::encode(sps),
            pps = base64::encode(pps),
            track_id = TrackType::Video as u8,
        );
        Sdp { text, payload_type }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }
}

impl std::fmt::Display for Sdp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}
