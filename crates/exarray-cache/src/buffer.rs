//! Fallible buffer allocation
//!
//! Node sizes grow with the structures built on the cache, so buffers for
//! images and node contents are reserved with `try_reserve_exact` and a
//! failed reservation surfaces as [`CacheError::OutOfSpace`] instead of
//! aborting the process.

use crate::error::{CacheError, CacheResult};

fn out_of_space(requested: u64) -> CacheError {
    CacheError::OutOfSpace {
        requested,
        available: 0,
    }
}

/// `len` copies of `value`
pub fn filled<T: Clone>(value: T, len: usize) -> CacheResult<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| {
        let bytes = (len as u64).saturating_mul(std::mem::size_of::<T>() as u64);
        out_of_space(bytes)
    })?;
    buf.resize(len, value);
    Ok(buf)
}

/// `len` zero bytes
pub fn zeroed(len: usize) -> CacheResult<Vec<u8>> {
    filled(0u8, len)
}

/// `count` elements of `size` bytes each, as a byte length
pub fn byte_len(count: usize, size: usize) -> CacheResult<usize> {
    count
        .checked_mul(size)
        .ok_or_else(|| out_of_space((count as u64).saturating_mul(size as u64)))
}

/// Grow `buf` to `len` bytes, zero filling the new tail
pub fn grow(buf: &mut Vec<u8>, len: usize) -> CacheResult<()> {
    if len <= buf.len() {
        return Ok(());
    }
    buf.try_reserve_exact(len - buf.len())
        .map_err(|_| out_of_space(len as u64))?;
    buf.resize(len, 0);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_and_grow() {
        assert_eq!(filled(Some(3u8), 2).expect("filled"), vec![Some(3), Some(3)]);

        let mut buf = zeroed(2).expect("zeroed");
        buf[0] = 7;
        grow(&mut buf, 4).expect("grow");
        assert_eq!(buf, vec![7, 0, 0, 0]);
        grow(&mut buf, 1).expect("shrinking is a no-op");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_impossible_sizes_are_out_of_space() {
        let err = zeroed(usize::MAX).expect_err("cannot reserve usize::MAX bytes");
        assert!(err.is_out_of_space());

        let err = filled(0u64, usize::MAX / 4).expect_err("byte size overflows");
        assert!(err.is_out_of_space());

        let err = byte_len(usize::MAX, 2).expect_err("overflow");
        assert!(err.is_out_of_space());
        assert_eq!(byte_len(3, 4).expect("fits"), 12);
    }
}
