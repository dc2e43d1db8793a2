use sha2::{Digest, Sha256};

use super::Container;

/// Hashes a container spec with the resize related fields cleared, so an in-place resize is not
/// mistaken for a definition change.
pub fn hash_container(container: &Container) -> u64 {
    let mut c = container.clone();
    c.resources = Default::default();
    c.resources_allocated.clear();
    c.resize_policy.clear();
    // Serializing a plain struct with string keyed maps cannot fail.
    let encoded = serde_json::to_vec(&c).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// The container hash formatted the way it is stored in container annotations and back-off keys.
pub fn hash_hex(container: &Container) -> String {
    format!("{:x}", hash_container(container))
}
