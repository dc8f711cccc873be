use std::io;

use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Streaming 128-bit digest over canonical bytes.
///
/// Implements [`io::Write`] so serializers can encode straight into the hash state without an
/// intermediate buffer.
pub struct DigestHasher {
    inner: blake3::Hasher,
}

impl DigestHasher {
    pub fn new(domain: &str) -> Self {
        let mut inner = blake3::Hasher::new();
        inner.update(domain.as_bytes());
        inner.update(&[0]);
        Self { inner }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn write_serialized<T: Serialize + ?Sized>(&mut self, value: &T) -> bincode::Result<()> {
        bincode::serialize_into(&mut *self, value)
    }

    /// First 16 bytes of the digest, little endian.
    pub fn finish_u128(&self) -> u128 {
        let hash = self.inner.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        u128::from_le_bytes(bytes)
    }
}

impl io::Write for DigestHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Short 64-bit hash of a serializable value, used to tag specializations in log lines.
pub fn short_hash<T: Serialize + ?Sized>(value: &T) -> bincode::Result<u64> {
    let bytes = bincode::serialize(value)?;
    Ok(fnv1a_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn digest_depends_on_domain() {
        let mut a = DigestHasher::new("left");
        let mut b = DigestHasher::new("right");
        a.write_bytes(b"payload");
        b.write_bytes(b"payload");
        assert_ne!(a.finish_u128(), b.finish_u128());
    }
}
