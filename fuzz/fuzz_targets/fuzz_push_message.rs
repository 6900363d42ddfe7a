#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Push frames are text; anything else never reaches the parser.
    if let Ok(s) = std::str::from_utf8(data) {
        // The same frame is parsed differently on lobby and session channels.
        let _ = gambit_sync::protocol::PushMessage::parse(s, false);
        let _ = gambit_sync::protocol::PushMessage::parse(s, true);
    }
});
