#![no_main]

use libfuzzer_sys::fuzz_target;
use satlink_codec::{FrameDecoder, DEFAULT_MAX_FRAME};

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new(Some(0xc1), DEFAULT_MAX_FRAME);
    for chunk in data.chunks(7) {
        decoder.feed(chunk);
        while decoder.pop_event().is_some() {}
    }
});
