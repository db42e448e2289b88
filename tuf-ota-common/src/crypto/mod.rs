pub mod sign;

use sha2::digest::Output;
use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    <Sha256 as Digest>::new().chain_update(data).finalize().into()
}

/// Checks `data` against an expected SHA-256 digest. Digests of the wrong size never match.
pub fn verify_sha256(hash: impl AsRef<[u8]>, data: impl AsRef<[u8]>) -> bool {
    let hash = hash.as_ref();
    if hash.len() != 32 {
        return false;
    }
    verify_sha256_impl(hash.into(), data.as_ref())
}

fn verify_sha256_impl(hash: &Output<Sha256>, data: impl AsRef<[u8]>) -> bool {
    let output = <Sha256 as Digest>::new().chain_update(data).finalize();
    hash == &output
}
