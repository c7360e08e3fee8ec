//! Credential identifier generation

use rand::RngCore;

use super::model::CredentialKind;

/// Random bytes per identifier (256 bits)
pub const KEY_BYTES: usize = 32;

/// Generate a fresh, unguessable identifier for the given credential kind
///
/// Format: `<prefix><64 lowercase hex chars>`, e.g. `kg_3f9a...`.
pub fn generate(kind: CredentialKind) -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);

    let mut id = String::with_capacity(kind.prefix().len() + KEY_BYTES * 2);
    id.push_str(kind.prefix());
    for byte in bytes {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// Short, non-secret prefix of an identifier for logs
pub fn fingerprint(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map(|(idx, _)| idx)
        .unwrap_or(id.len());
    &id[..end]
}
