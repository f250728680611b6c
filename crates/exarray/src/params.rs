//! Creation parameters for an extensible array

use crate::fill::FillValue;
use serde::{Deserialize, Serialize};

/// Largest supported `max_nelmts_bits`; indices are `u64`.
pub const MAX_NELMTS_BITS: u8 = 63;

/// Parameters fixed when an array is created and persisted in its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    /// Size of one element in bytes
    pub element_size: usize,

    /// Log2 of the maximum number of elements
    pub max_nelmts_bits: u8,

    /// Elements stored directly in the index block
    pub idx_blk_elmts: u8,

    /// Element capacity of the smallest data blocks (power of two)
    pub data_blk_min_elmts: u8,

    /// Data block pointers in the smallest super blocks (power of two, at least 2)
    pub sup_blk_min_data_ptrs: u8,

    /// Log2 of the elements per data block page
    pub max_dblk_page_nelmts_bits: u8,

    /// Value of unwritten elements. `None` means all-zero bytes.
    pub fill_value: Option<FillValue>,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            element_size: 8,
            max_nelmts_bits: 32,
            idx_blk_elmts: 4,
            data_blk_min_elmts: 16,
            sup_blk_min_data_ptrs: 4,
            max_dblk_page_nelmts_bits: 10,
            fill_value: None,
        }
    }
}

impl CreateParams {
    /// Create parameters for elements of `element_size` bytes
    pub fn new(element_size: usize) -> Self {
        Self {
            element_size,
            ..Self::default()
        }
    }

    /// Set the maximum number of elements as a power of two
    #[must_use]
    pub const fn with_max_nelmts_bits(mut self, bits: u8) -> Self {
        self.max_nelmts_bits = bits;
        self
    }

    /// Set the number of elements held directly by the index block
    #[must_use]
    pub const fn with_idx_blk_elmts(mut self, elmts: u8) -> Self {
        self.idx_blk_elmts = elmts;
        self
    }

    /// Set the capacity of the smallest data blocks
    #[must_use]
    pub const fn with_data_blk_min_elmts(mut self, elmts: u8) -> Self {
        self.data_blk_min_elmts = elmts;
        self
    }

    /// Set the data block pointer count of the smallest super blocks
    #[must_use]
    pub const fn with_sup_blk_min_data_ptrs(mut self, ptrs: u8) -> Self {
        self.sup_blk_min_data_ptrs = ptrs;
        self
    }

    /// Set the page size of large data blocks as a power of two
    #[must_use]
    pub const fn with_max_dblk_page_nelmts_bits(mut self, bits: u8) -> Self {
        self.max_dblk_page_nelmts_bits = bits;
        self
    }

    /// Set the fill value
    #[must_use]
    pub fn with_fill_value(mut self, fill: impl Into<FillValue>) -> Self {
        self.fill_value = Some(fill.into());
        self
    }

    /// Fill value, defaulting to zeros
    pub fn fill(&self) -> FillValue {
        self.fill_value
            .clone()
            .unwrap_or_else(|| FillValue::zeros(self.element_size))
    }

    /// Validate the parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.element_size == 0 || self.element_size > usize::from(u16::MAX) {
            return Err(format!(
                "element_size must be between 1 and {}, got {}",
                u16::MAX,
                self.element_size
            ));
        }
        if self.max_nelmts_bits == 0 || self.max_nelmts_bits > MAX_NELMTS_BITS {
            return Err(format!(
                "max_nelmts_bits must be between 1 and {MAX_NELMTS_BITS}, got {}",
                self.max_nelmts_bits
            ));
        }
        if self.idx_blk_elmts == 0 {
            return Err("idx_blk_elmts must be greater than 0".to_string());
        }
        if !self.data_blk_min_elmts.is_power_of_two() {
            return Err(format!(
                "data_blk_min_elmts must be a power of two, got {}",
                self.data_blk_min_elmts
            ));
        }
        if u32::from(self.max_nelmts_bits) < self.data_blk_min_elmts.ilog2() {
            return Err(format!(
                "max_nelmts_bits {} is too small for data blocks of {} elements",
                self.max_nelmts_bits, self.data_blk_min_elmts
            ));
        }
        if !self.sup_blk_min_data_ptrs.is_power_of_two() || self.sup_blk_min_data_ptrs < 2 {
            return Err(format!(
                "sup_blk_min_data_ptrs must be a power of two of at least 2, got {}",
                self.sup_blk_min_data_ptrs
            ));
        }
        if self.max_dblk_page_nelmts_bits == 0
            || self.max_dblk_page_nelmts_bits > self.max_nelmts_bits
        {
            return Err(format!(
                "max_dblk_page_nelmts_bits must be between 1 and max_nelmts_bits ({}), got {}",
                self.max_nelmts_bits, self.max_dblk_page_nelmts_bits
            ));
        }
        if let Some(fill) = &self.fill_value {
            if fill.size() != self.element_size {
                return Err(format!(
                    "fill value is {} bytes but elements are {} bytes",
                    fill.size(),
                    self.element_size
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CreateParams::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(CreateParams::new(0).validate().is_err());
        assert!(CreateParams::new(4).with_max_nelmts_bits(64).validate().is_err());
        assert!(CreateParams::new(4).with_idx_blk_elmts(0).validate().is_err());
        assert!(CreateParams::new(4).with_data_blk_min_elmts(12).validate().is_err());
        assert!(CreateParams::new(4).with_sup_blk_min_data_ptrs(1).validate().is_err());
        assert!(CreateParams::new(4).with_sup_blk_min_data_ptrs(6).validate().is_err());
        assert!(CreateParams::new(4)
            .with_max_nelmts_bits(8)
            .with_max_dblk_page_nelmts_bits(9)
            .validate()
            .is_err());
        assert!(CreateParams::new(4)
            .with_max_nelmts_bits(2)
            .with_data_blk_min_elmts(16)
            .validate()
            .is_err());
    }

    #[test]
    fn test_fill_value_must_match_element_size() {
        let params = CreateParams::new(4).with_fill_value(7u16);
        assert!(params.validate().is_err());

        let params = CreateParams::new(4).with_fill_value(7u32);
        assert!(params.validate().is_ok());
        assert_eq!(params.fill().as_bytes(), &[7, 0, 0, 0]);
        assert_eq!(CreateParams::new(2).fill(), FillValue::zeros(2));
    }

    #[test]
    fn test_serde_round_trip() {
        let params = CreateParams::new(4)
            .with_idx_blk_elmts(8)
            .with_fill_value(0xffff_ffffu32);
        let json = serde_json::to_string(&params).expect("serialize");
        let parsed: CreateParams = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, params);
    }
}
