//! Hash primitives used across the wire protocol
//!
//! Bitcoin identifies almost everything by double-SHA256: block hashes,
//! transaction ids, frame checksums and compact filter headers.

use sha2::{Digest, Sha256};

/// Single SHA256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA256 (`SHA256(SHA256(data))`).
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

/// First four bytes of the double-SHA256 of `data`.
///
/// This is the checksum field of every P2P message frame.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = sha256d(data);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_checksum() {
        // sha256d("") starts with 5d f6 e0 e2; every verack frame carries it.
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn sha256d_is_nested_sha256() {
        let data = b"bitlight";
        assert_eq!(sha256d(data), sha256(&sha256(data)));
    }
}
