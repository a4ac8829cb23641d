use serde::Serialize;
use sha2::{Digest, Sha256};

/// Short, process-independent digest of a serializable value.
///
/// Used to derive cache keys from filter sets, so it must not depend on
/// `std`'s randomized hasher.
pub(crate) fn short_digest<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
