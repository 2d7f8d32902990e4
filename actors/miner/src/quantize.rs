// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;

/// Constant defining the [QuantSpec] which performs no quantization.
pub const NO_QUANTIZATION: QuantSpec = QuantSpec { unit: 1, offset: 0 };

/// A spec for epoch quantization.
///
/// Epochs are rounded up to the next point of the grid `offset + k * unit`, which bounds the
/// number of distinct keys in every epoch-keyed queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuantSpec {
    /// The unit of quantization
    pub unit: ChainEpoch,
    /// The offset from zero from which to base the modulus
    pub offset: ChainEpoch,
}

impl QuantSpec {
    /// Rounds `epoch` to the nearest exact multiple of the quantization unit offset by
    /// `offset % unit`, rounding up.
    ///
    /// Over the reals this is `unit * ceil((epoch - offset % unit) / unit) + offset % unit`.
    ///
    /// Precondition: `unit >= 0`
    pub fn quantize_up(&self, epoch: ChainEpoch) -> ChainEpoch {
        let offset = self.offset % self.unit;

        let remainder = (epoch - offset) % self.unit;
        let quotient = (epoch - offset) / self.unit;

        // Don't round if epoch falls on a quantization epoch
        if remainder == 0
        // Negative truncating division rounds up
        || epoch - offset < 0
        {
            self.unit * quotient + offset
        } else {
            self.unit * (quotient + 1) + offset
        }
    }

    /// Rounds `epoch` down to the previous grid point, or returns it unchanged if it is on one.
    pub fn quantize_down(&self, epoch: ChainEpoch) -> ChainEpoch {
        let next = self.quantize_up(epoch);
        if epoch == next {
            next
        } else {
            next - self.unit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use rstest::rstest;

    #[rstest]
    #[case(42, 10, 0, 50)]
    #[case(16000, 100, 0, 16000)]
    #[case(0, 10, 0, 0)]
    #[case(-5, 10, 0, 0)]
    #[case(-50, 10, 0, -50)]
    #[case(-53, 10, 0, -50)]
    #[case(101, 10, 0, 110)]
    #[case(100, 10, 0, 100)]
    fn quantize_up_zero_offset(
        #[case] epoch: ChainEpoch,
        #[case] unit: ChainEpoch,
        #[case] offset: ChainEpoch,
        #[case] expected: ChainEpoch,
    ) {
        assert_eq!(expected, QuantSpec { unit, offset }.quantize_up(epoch));
    }

    #[rstest]
    #[case(4, 5, 1, 6)]
    #[case(0, 5, 1, 1)]
    #[case(-6, 5, 1, -4)]
    #[case(2, 10, 4, 4)]
    fn quantize_up_non_zero_offset(
        #[case] epoch: ChainEpoch,
        #[case] unit: ChainEpoch,
        #[case] offset: ChainEpoch,
        #[case] expected: ChainEpoch,
    ) {
        assert_eq!(expected, QuantSpec { unit, offset }.quantize_up(epoch));
    }

    #[rstest]
    #[case(9, 5, 28, 13)]
    #[case(10000, 100, 2000000, 10000)]
    fn quantize_up_offset_seed_bigger_than_unit(
        #[case] epoch: ChainEpoch,
        #[case] unit: ChainEpoch,
        #[case] offset: ChainEpoch,
        #[case] expected: ChainEpoch,
    ) {
        assert_eq!(expected, QuantSpec { unit, offset }.quantize_up(epoch));
    }

    #[test]
    fn quantize_down_snaps_to_previous_grid_point() {
        let q = QuantSpec { unit: 10, offset: 3 };
        assert_eq!(3, q.quantize_down(12));
        assert_eq!(13, q.quantize_down(13));
        assert_eq!(-7, q.quantize_down(-1));
    }

    #[test]
    fn no_quantization_is_identity() {
        for epoch in [-7, 0, 1, 2880] {
            assert_eq!(epoch, NO_QUANTIZATION.quantize_up(epoch));
            assert_eq!(epoch, NO_QUANTIZATION.quantize_down(epoch));
        }
    }

    fn spec_from(unit: u16, offset: i32) -> QuantSpec {
        QuantSpec {
            unit: ChainEpoch::from(unit) + 1,
            offset: ChainEpoch::from(offset),
        }
    }

    #[quickcheck]
    fn quantized_epoch_is_not_earlier(epoch: i32, unit: u16, offset: i32) -> bool {
        let q = spec_from(unit, offset);
        q.quantize_up(ChainEpoch::from(epoch)) >= ChainEpoch::from(epoch)
    }

    #[quickcheck]
    fn quantized_epoch_lies_on_the_grid(epoch: i32, unit: u16, offset: i32) -> bool {
        let q = spec_from(unit, offset);
        let e = q.quantize_up(ChainEpoch::from(epoch));
        (e - q.offset).rem_euclid(q.unit) == 0
    }

    #[quickcheck]
    fn quantize_up_is_idempotent(epoch: i32, unit: u16, offset: i32) -> bool {
        let q = spec_from(unit, offset);
        let once = q.quantize_up(ChainEpoch::from(epoch));
        q.quantize_up(once) == once
    }

    #[quickcheck]
    fn quantized_epoch_is_within_one_unit(epoch: i32, unit: u16, offset: i32) -> bool {
        let q = spec_from(unit, offset);
        let e = ChainEpoch::from(epoch);
        q.quantize_up(e) - e < q.unit
    }
}
