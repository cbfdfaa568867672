//! Active analog channel mask.
//!
//! Bit `i` set means analog channel `i` is active. The mask is sent to the
//! firmware as the decimal form of the unsigned value. Adding and removing a
//! channel both use `1 << index`; removal clears with `mask & !(1 << index)`.

use super::channel::{ChannelDescriptor, ChannelKind};
use crate::error::{AppResult, DaqError};
use std::fmt;

/// Bit set of active analog channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelMask(u32);

impl ChannelMask {
    /// No channels active.
    pub const EMPTY: ChannelMask = ChannelMask(0);

    /// The single bit for `index`.
    pub fn bit(index: u32) -> AppResult<u32> {
        1u32
            .checked_shl(index)
            .ok_or(DaqError::ChannelIndexOutOfRange(index))
    }

    /// Mask with exactly the given indices set.
    pub fn from_indices<I: IntoIterator<Item = u32>>(indices: I) -> AppResult<Self> {
        indices
            .into_iter()
            .try_fold(Self::EMPTY, |mask, index| mask.with(index))
    }

    /// Mask of every active analog channel in `channels`.
    pub fn from_active(channels: &[ChannelDescriptor]) -> AppResult<Self> {
        Self::from_indices(
            channels
                .iter()
                .filter(|ch| ch.kind == ChannelKind::Analog && ch.is_active)
                .map(|ch| ch.index),
        )
    }

    /// This mask with `index` set.
    pub fn with(self, index: u32) -> AppResult<Self> {
        Ok(Self(self.0 | Self::bit(index)?))
    }

    /// This mask with `index` cleared.
    pub fn without(self, index: u32) -> AppResult<Self> {
        Ok(Self(self.0 & !Self::bit(index)?))
    }

    /// Whether `index` is set.
    pub fn contains(self, index: u32) -> bool {
        Self::bit(index).map(|b| self.0 & b != 0).unwrap_or(false)
    }

    /// Raw value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Set indices in ascending order.
    pub fn indices(self) -> impl Iterator<Item = u32> {
        (0..32).filter(move |i| self.0 & (1u32 << i) != 0)
    }
}

impl From<u32> for ChannelMask {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::channel::{AnalogCalibration, ChannelDirection};
    use std::collections::HashSet;

    #[test]
    fn every_index_maps_to_its_own_left_shifted_bit() {
        let mut seen = HashSet::new();
        for i in 0..32u32 {
            let bit = ChannelMask::bit(i).unwrap();
            assert_eq!(bit, 1u32 << i);
            assert!(seen.insert(bit), "index {i} collides with another index");
        }
    }

    #[test]
    fn index_31_is_unsigned() {
        let mask = ChannelMask::EMPTY.with(31).unwrap();
        assert_eq!(mask.bits(), 2_147_483_648);
        assert_eq!(mask.to_string(), "2147483648");
    }

    #[test]
    fn index_32_is_rejected() {
        assert!(matches!(
            ChannelMask::bit(32),
            Err(DaqError::ChannelIndexOutOfRange(32))
        ));
    }

    #[test]
    fn removing_middle_channel_keeps_the_others() {
        // Regression guard: clearing must use a left shift. A right shift
        // (1 >> index) is zero for any index above 0 and would wipe the mask.
        let mask = ChannelMask::from_indices([1, 4, 9]).unwrap();
        let removed = mask.without(4).unwrap();
        assert_eq!(removed, ChannelMask::from_indices([1, 9]).unwrap());
        assert!(removed.contains(1));
        assert!(!removed.contains(4));
        assert!(removed.contains(9));
    }

    #[test]
    fn removing_absent_channel_is_identity() {
        let mask = ChannelMask::from_indices([0, 2]).unwrap();
        assert_eq!(mask.without(7).unwrap(), mask);
    }

    #[test]
    fn from_active_ignores_inactive_and_digital() {
        let channels = vec![
            ChannelDescriptor::analog(0, AnalogCalibration::default()).active(),
            ChannelDescriptor::analog(1, AnalogCalibration::default()),
            ChannelDescriptor::analog(3, AnalogCalibration::default()).active(),
            ChannelDescriptor::digital(2, ChannelDirection::Input).active(),
        ];
        let mask = ChannelMask::from_active(&channels).unwrap();
        assert_eq!(mask.bits(), 0b1001);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![0, 3]);
    }
}
