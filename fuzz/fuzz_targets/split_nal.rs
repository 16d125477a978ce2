// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for range in h264_track::h264::nal::NalUnits::new(data) {
        // Yielded spans index the buffer, are non-empty, and never begin
        // with a start code.
        assert!(range.start < range.end && range.end <= data.len());
        assert!(!data[range.start..].starts_with(b"\x00\x00\x01"));
    }
});
