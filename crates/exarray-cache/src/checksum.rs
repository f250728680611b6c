//! Image checksums.
//!
//! Every image the cache writes is followed by a 4-byte little-endian
//! Jenkins lookup3 `hashlittle` digest of the payload. Loads recompute the
//! digest and reject the image on mismatch before any entry decoder sees it.

use crate::addr::Addr;
use crate::error::{CacheError, CacheResult};

/// Size of the trailing checksum in bytes.
pub const CHECKSUM_LEN: usize = 4;

/// Stored size of an image whose payload is `payload_len` bytes.
pub const fn stored_len(payload_len: usize) -> usize {
    payload_len + CHECKSUM_LEN
}

/// Bob Jenkins' lookup3 `hashlittle`.
pub fn hashlittle(data: &[u8], initval: u32) -> u32 {
    let seed = 0xdead_beef_u32
        .wrapping_add(u32::try_from(data.len()).unwrap_or(u32::MAX))
        .wrapping_add(initval);
    let mut state = State {
        a: seed,
        b: seed,
        c: seed,
    };

    if data.is_empty() {
        return state.c;
    }

    let mut rest = data;
    while rest.len() > 12 {
        state.absorb(&rest[..12]);
        state.mix();
        rest = &rest[12..];
    }

    // The tail adds its bytes into zero-extended little-endian words.
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    state.absorb(&tail);
    state.finish();
    state.c
}

struct State {
    a: u32,
    b: u32,
    c: u32,
}

impl State {
    fn absorb(&mut self, block: &[u8]) {
        let word = |i: usize| u32::from_le_bytes([block[i], block[i + 1], block[i + 2], block[i + 3]]);
        self.a = self.a.wrapping_add(word(0));
        self.b = self.b.wrapping_add(word(4));
        self.c = self.c.wrapping_add(word(8));
    }

    fn mix(&mut self) {
        let Self { a, b, c } = self;
        for (x, y, z, r) in [(0, 2, 1, 4), (1, 0, 2, 6), (2, 1, 0, 8), (0, 2, 1, 16), (1, 0, 2, 19), (2, 1, 0, 4)] {
            let mut regs = [*a, *b, *c];
            regs[x] = regs[x].wrapping_sub(regs[y]);
            regs[x] ^= regs[y].rotate_left(r);
            regs[y] = regs[y].wrapping_add(regs[z]);
            [*a, *b, *c] = regs;
        }
    }

    fn finish(&mut self) {
        let Self { a, b, c } = self;
        for (x, y, r) in [(2, 1, 14), (0, 2, 11), (1, 0, 25), (2, 1, 16), (0, 2, 4), (1, 0, 14), (2, 1, 24)] {
            let mut regs = [*a, *b, *c];
            regs[x] ^= regs[y];
            regs[x] = regs[x].wrapping_sub(regs[y].rotate_left(r));
            [*a, *b, *c] = regs;
        }
    }
}

/// Append the checksum of `payload` to it, producing the stored image.
pub fn seal(mut payload: Vec<u8>) -> Vec<u8> {
    let digest = hashlittle(&payload, 0);
    payload.extend_from_slice(&digest.to_le_bytes());
    payload
}

/// Verify a stored image and return its payload.
pub fn verify(addr: Addr, image: &[u8]) -> CacheResult<&[u8]> {
    if image.len() < CHECKSUM_LEN {
        return Err(CacheError::corruption(addr, "image shorter than checksum"));
    }
    let (payload, stored) = image.split_at(image.len() - CHECKSUM_LEN);
    let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let computed = hashlittle(payload, 0);
    if stored != computed {
        return Err(CacheError::corruption(
            addr,
            format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        ));
    }
    Ok(payload)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_hashlittle_reference_vectors() {
        assert_eq!(hashlittle(b"", 0), 0xdead_beef);
        assert_eq!(hashlittle(b"Four score and seven years ago", 0), 0x1777_0551);
        assert_eq!(hashlittle(b"Four score and seven years ago", 1), 0xcd62_8161);
    }

    #[test]
    fn test_seal_then_verify() {
        let image = seal(b"extensible array".to_vec());
        assert_eq!(image.len(), stored_len(16));
        let payload = verify(Addr::new(0), &image).expect("intact image");
        assert_eq!(payload, b"extensible array");
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let image = seal(vec![0x5a; 40]);
        for byte in 0..image.len() {
            let mut damaged = image.clone();
            damaged[byte] ^= 0x01;
            let err = verify(Addr::new(8), &damaged).expect_err("flip must be caught");
            assert!(err.is_corruption(), "byte {byte}");
        }
    }

    #[test]
    fn test_truncated_image_rejected() {
        assert!(verify(Addr::new(0), &[1, 2]).is_err());
    }
}
