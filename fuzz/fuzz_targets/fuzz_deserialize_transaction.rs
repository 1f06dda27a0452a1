#![no_main]

use libfuzzer_sys::fuzz_target;
use meridian::transaction::SignedTransaction;

fuzz_target!(|data: &[u8]| {
    // SignedTransaction nests tagged inputs (UTXO, deposit, mint) with
    // variable-length strings and per-input Dilithium signature groups.
    // Deserialization must never panic on arbitrary bytes.
    let _ = meridian::deserialize::<SignedTransaction>(data);
});
