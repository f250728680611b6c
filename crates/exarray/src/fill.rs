//! Fill values.
//!
//! The fill value is the element returned for any index whose storage has
//! never been written. It is persisted in the array header, so every handle
//! on the array agrees on it.

use serde::{Deserialize, Serialize};

/// Element value used for unwritten indices.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FillValue(Vec<u8>);

impl core::fmt::Display for FillValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl FillValue {
    /// Create a fill value from its element bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// All-zero fill value of `element_size` bytes.
    #[must_use]
    pub fn zeros(element_size: usize) -> Self {
        Self(vec![0; element_size])
    }

    /// Size of one element in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Element bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether every element in `bytes` equals the fill value.
    #[must_use]
    pub fn equals_all(&self, bytes: &[u8]) -> bool {
        !self.0.is_empty()
            && bytes.len() % self.0.len() == 0
            && bytes.chunks_exact(self.0.len()).all(|elem| elem == self.0)
    }

    /// Overwrite `out` with repeated copies of the fill value.
    ///
    /// `out` must hold a whole number of elements.
    pub fn fill_into(&self, out: &mut [u8]) {
        if self.0.is_empty() {
            return;
        }
        for elem in out.chunks_exact_mut(self.0.len()) {
            elem.copy_from_slice(&self.0);
        }
    }
}

impl From<&[u8]> for FillValue {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for FillValue {
    fn from(value: [u8; N]) -> Self {
        Self(value.to_vec())
    }
}

impl From<Vec<u8>> for FillValue {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

macro_rules! fill_value_from_le {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for FillValue {
                fn from(value: $ty) -> Self {
                    Self(value.to_le_bytes().to_vec())
                }
            }
        )*
    };
}

// Stored fill bytes are little endian.
fill_value_from_le!(u16, u32, u64, i16, i32, i64, f32, f64);

impl From<u8> for FillValue {
    fn from(value: u8) -> Self {
        Self(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions_are_little_endian() {
        assert_eq!(FillValue::from(0x0102_0304u32).as_bytes(), &[4, 3, 2, 1]);
        assert_eq!(FillValue::from(-1i16).as_bytes(), &[0xff, 0xff]);
        assert_eq!(FillValue::from(7u8).size(), 1);
    }

    #[test]
    fn test_fill_into_and_equals_all() {
        let fill = FillValue::from([0xab, 0xcd]);
        let mut buf = vec![0u8; 6];
        fill.fill_into(&mut buf);
        assert_eq!(buf, vec![0xab, 0xcd, 0xab, 0xcd, 0xab, 0xcd]);
        assert!(fill.equals_all(&buf));

        buf[3] = 0;
        assert!(!fill.equals_all(&buf));
    }

    #[test]
    fn test_zeros() {
        let fill = FillValue::zeros(3);
        assert!(fill.equals_all(&[0; 9]));
        assert_eq!(fill.to_string(), "[0, 0, 0]");
    }
}
