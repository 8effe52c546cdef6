#![no_main]

use libfuzzer_sys::fuzz_target;
use satlink_codec::{Message, Value};

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = Value::try_from(data) {
        let _ = Message::from_value(value);
    }
});
