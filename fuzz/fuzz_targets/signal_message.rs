//! Fuzz target for signaling message parsing

#![no_main]

use headlink_signaling::SignalMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(Some(message)) = SignalMessage::parse(text) {
            let json = message.to_json().expect("serialize parsed message");
            assert_eq!(SignalMessage::parse(&json).ok().flatten(), Some(message));
        }
    }
});
