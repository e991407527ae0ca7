//! Bit-level packing primitives.
//!
//! Two shapes are needed on the wire: n-bit unsigned fields (MTF positions,
//! HEX slot values) and 1-bit flag vectors (row mask, placeholder flags).
//! Bits fill each byte LSB-first; the final byte is zero-padded.

use crate::error::{Result, UscError};

/// Width needed for values drawn from `0..count`, per the wire rule
/// `ceil(log2(count + 1))`. Always at least 1.
pub fn bits_for_count(count: u64) -> u32 {
    let mut bits = 0u32;
    let mut x = count;
    while x > 0 {
        bits += 1;
        x >>= 1;
    }
    bits.max(1)
}

/// Width needed to hold `maxval` itself.
pub fn bits_for_maxval(maxval: u64) -> u32 {
    bits_for_count(maxval)
}

pub fn bitpack(values: &[u64], bits: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((values.len() * bits as usize).div_ceil(8));
    // u128 accumulator: a 64-bit field shifted by a partial byte must not
    // spill.
    let mut acc: u128 = 0;
    let mut acc_bits: u32 = 0;
    let mask = if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };

    for &v in values {
        acc |= ((v & mask) as u128) << acc_bits;
        acc_bits += bits;
        while acc_bits >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            acc_bits -= 8;
        }
    }
    if acc_bits > 0 {
        out.push((acc & 0xFF) as u8);
    }
    out
}

pub fn bitunpack(data: &[u8], count: usize, bits: u32) -> Result<Vec<u64>> {
    let mut out = Vec::with_capacity(count);
    let mut acc: u128 = 0;
    let mut acc_bits: u32 = 0;
    let mut idx = 0usize;
    let mask = if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };

    for _ in 0..count {
        while acc_bits < bits {
            let b = *data
                .get(idx)
                .ok_or_else(|| UscError::truncated(idx, "bit stream truncated"))?;
            acc |= (b as u128) << acc_bits;
            idx += 1;
            acc_bits += 8;
        }
        out.push(acc as u64 & mask);
        acc >>= bits;
        acc_bits -= bits;
    }
    Ok(out)
}

pub fn pack_flags(flags: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; flags.len().div_ceil(8)];
    for (i, &f) in flags.iter().enumerate() {
        if f {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_flags(data: &[u8], count: usize) -> Result<Vec<bool>> {
    if data.len() < count.div_ceil(8) {
        return Err(UscError::truncated(data.len(), "flag vector truncated"));
    }
    Ok((0..count).map(|i| data[i / 8] >> (i % 8) & 1 == 1).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_rule() {
        assert_eq!(bits_for_count(0), 1);
        assert_eq!(bits_for_count(1), 1);
        assert_eq!(bits_for_count(2), 2);
        assert_eq!(bits_for_count(3), 2);
        assert_eq!(bits_for_count(255), 8);
        assert_eq!(bits_for_count(256), 9);
    }

    #[test]
    fn pack_roundtrip() {
        for bits in [1u32, 3, 7, 8, 13, 32, 63, 64] {
            let mask = if bits >= 64 {
                u64::MAX
            } else {
                (1u64 << bits) - 1
            };
            let values: Vec<u64> = (0..100u64)
                .map(|i| i.wrapping_mul(0x9E3779B97F4A7C15) & mask)
                .collect();
            let packed = bitpack(&values, bits);
            let unpacked = bitunpack(&packed, values.len(), bits).unwrap();
            assert_eq!(values, unpacked, "width {}", bits);
        }
    }

    #[test]
    fn pack_truncated_errors() {
        let packed = bitpack(&[1, 2, 3, 4], 9);
        assert!(bitunpack(&packed[..packed.len() - 1], 4, 9).is_err());
    }

    #[test]
    fn flags_roundtrip() {
        let flags: Vec<bool> = (0..19).map(|i| i % 3 == 0).collect();
        let packed = pack_flags(&flags);
        assert_eq!(packed.len(), 3);
        assert_eq!(unpack_flags(&packed, flags.len()).unwrap(), flags);
    }
}
