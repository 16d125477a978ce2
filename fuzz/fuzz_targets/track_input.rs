// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use bytes::Bytes;
use h264_track::frame::{Frame, FrameSink};
use h264_track::h264::H264Track;
use libfuzzer_sys::fuzz_target;

struct Count(u64);

impl FrameSink for Count {
    fn on_frame(&mut self, frame: &Frame) {
        self.0 = self.0.wrapping_add(frame.size() as u64);
    }
}

fuzz_target!(|data: &[u8]| {
    let mut track = H264Track::new();
    track.set_frame_sink(Box::new(Count(0)));
    let mut data = data;
    loop {
        let (hdr, rest) = match data.split_first() {
            Some(r) => r,
            None => return,
        };
        let prefix_len = if (hdr & 1) == 0 { 3 } else { 4 };
        let len = usize::from(hdr >> 1);
        // input_frame requires at least prefix_len + 1 bytes.
        if rest.len() < len || len <= prefix_len {
            return;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        track.input_frame(Frame::h264_wrapped(
            Bytes::copy_from_slice(payload),
            0,
            None,
            prefix_len,
        ));
    }
});
