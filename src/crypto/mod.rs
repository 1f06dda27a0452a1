//! Cryptographic primitives used by the round kernel.
//!
//! Only signing is needed here: snapshots are signed by their author and
//! co-signed by the quorum, deposits are attested by domain keys. Hashing
//! lives at the crate root (`hash_domain`, `hash_concat`).

pub mod keys;
