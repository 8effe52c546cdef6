#![no_main]

use libfuzzer_sys::fuzz_target;
use satlink_reliable::frame::Frame;

fuzz_target!(|data: &[u8]| {
    let _ = Frame::try_from(data);
});
