#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use meridian::storage::SledStore;
use meridian::transaction::SignedTransaction;

static STORE: OnceLock<Option<SledStore>> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    // Deserialize a transaction and run the admission checks against an
    // empty store.  Validation reads the store but never writes it, so one
    // store serves every iteration.
    let Some(store) = STORE.get_or_init(|| SledStore::open_temporary().ok()) else {
        return;
    };
    if let Ok(tx) = meridian::deserialize::<SignedTransaction>(data) {
        let _ = tx.hash();
        let _ = tx.transaction.output_total();
        if tx.check_mint() {
            let _ = tx.validate_mint(store);
        }
        let _ = tx.validate(store);
    }
});
