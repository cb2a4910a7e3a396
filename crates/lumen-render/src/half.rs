//! IEEE 754 binary16 conversion.
//!
//! Word layout matches WGSL `pack2x16float` / `unpack2x16float`: the first value
//! occupies the low 16 bits.

/// Largest finite half-float value.
pub const HALF_MAX: f32 = 65504.0;

/// Convert to half precision, rounding to nearest even.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        // Infinity keeps a zero mantissa; any NaN becomes a quiet NaN.
        return if mantissa == 0 { sign | 0x7c00 } else { sign | 0x7e00 };
    }

    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let full = mantissa | 0x0080_0000;
        let shift = (14 - half_exponent) as u32;
        let mut half = full >> shift;
        let remainder = full & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        if remainder > halfway || (remainder == halfway && half & 1 == 1) {
            half += 1;
        }
        return sign | half as u16;
    }

    let mut half = ((half_exponent as u32) << 10) | (mantissa >> 13);
    let remainder = mantissa & 0x1fff;
    if remainder > 0x1000 || (remainder == 0x1000 && half & 1 == 1) {
        // A carry out of the mantissa correctly bumps the exponent, up to infinity.
        half += 1;
    }
    sign | half as u16
}

/// Widen a half-float to `f32`. Exact for every input.
pub fn f16_to_f32(half: u16) -> f32 {
    let sign = u32::from(half & 0x8000) << 16;
    let exponent = u32::from((half >> 10) & 0x1f);
    let mantissa = u32::from(half & 0x03ff);

    match exponent {
        0 => {
            let magnitude = mantissa as f32 * (1.0 / 16_777_216.0);
            if sign == 0 { magnitude } else { -magnitude }
        }
        0x1f => f32::from_bits(sign | 0x7f80_0000 | (mantissa << 13)),
        _ => f32::from_bits(sign | ((exponent + 112) << 23) | (mantissa << 13)),
    }
}

/// Pack two floats into one word, `low` in bits 0..16.
#[inline]
pub fn pack2x16(low: f32, high: f32) -> u32 {
    u32::from(f32_to_f16(low)) | (u32::from(f32_to_f16(high)) << 16)
}

#[inline]
pub fn unpack2x16(word: u32) -> (f32, f32) {
    (f16_to_f32(word as u16), f16_to_f32((word >> 16) as u16))
}
