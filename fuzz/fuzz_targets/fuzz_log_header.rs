// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for persisted log header decoding

#![no_main]

use intent_log::LogHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = LogHeader::decode(data) {
        // Anything that decodes must survive a re-encode.
        let again = LogHeader::decode(&header.encode()).expect("re-encoded header decodes");
        assert_eq!(again, header);
    }
});
