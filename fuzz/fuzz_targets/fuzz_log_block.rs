// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for log block validation and record decoding

#![no_main]

use intent_log::chain::decode_and_validate_block;
use intent_log::record::decode_record;
use intent_log::{BlockPtr, ByteOrder, ChainSeed, DeviceId};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Records straight from the fuzzer, in both byte orders.
    let _ = decode_record(data, ByteOrder::Little);
    let _ = decode_record(data, ByteOrder::Big);

    // Whole blocks: a garbage block must end the chain, never panic.
    let bp = BlockPtr {
        device: DeviceId(0),
        offset: 0,
        size: data.len() as u64,
        birth: 1,
        seed: ChainSeed::new_chain(1),
        order: ByteOrder::NATIVE,
        encrypted: false,
    };
    let _ = decode_and_validate_block(data, &bp, None);
});
