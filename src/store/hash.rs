use sha2::{Digest, Sha256};

/// Hex SHA-256 of an upload's name, size and arrival time; used for upload keys.
pub fn upload_hash(file_name: &str, bytes: &[u8], nanos: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
