///
/// `long double` conversion
///
/// Rust has no `long double`, so values cross the boundary as bytes in the
/// platform's format:
///
/// - x86 / x86_64 outside MSVC: 80-bit x87 extended precision
/// - aarch64 (non-Apple), riscv64, s390x: IEEE 754 binary128
/// - everywhere else `long double` is `double` (or a double-double whose high
///   half is the `double` and whose low half is zero)
///
/// nial reals are `f64`, so narrowing on the way back truncates.
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongDoubleFormat {
    Double,
    X87Extended,
    Binary128,
}

#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), not(target_env = "msvc")))]
pub const FORMAT: LongDoubleFormat = LongDoubleFormat::X87Extended;

#[cfg(any(
    all(target_arch = "aarch64", not(target_vendor = "apple"), not(windows)),
    target_arch = "riscv64",
    target_arch = "s390x"
))]
pub const FORMAT: LongDoubleFormat = LongDoubleFormat::Binary128;

#[cfg(not(any(
    all(any(target_arch = "x86_64", target_arch = "x86"), not(target_env = "msvc")),
    all(target_arch = "aarch64", not(target_vendor = "apple"), not(windows)),
    target_arch = "riscv64",
    target_arch = "s390x"
)))]
pub const FORMAT: LongDoubleFormat = LongDoubleFormat::Double;

/// Bytes written; callers copy only `size_of(long double)` of them
pub const ENCODED_LEN: usize = 16;

const FRAC_MASK: u64 = (1 << 52) - 1;

pub fn encode(value: f64) -> [u8; ENCODED_LEN] {
    match FORMAT {
        LongDoubleFormat::Double => encode_double(value),
        LongDoubleFormat::X87Extended => encode_x87(value),
        LongDoubleFormat::Binary128 => encode_binary128(value),
    }
}

/// `bytes` must hold at least `size_of(long double)` bytes
pub fn decode(bytes: &[u8]) -> f64 {
    let mut buf = [0u8; ENCODED_LEN];
    let n = bytes.len().min(ENCODED_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    match FORMAT {
        LongDoubleFormat::Double => decode_double(&buf),
        LongDoubleFormat::X87Extended => decode_x87(&buf),
        LongDoubleFormat::Binary128 => decode_binary128(&buf),
    }
}

fn encode_double(value: f64) -> [u8; ENCODED_LEN] {
    let mut out = [0u8; ENCODED_LEN];
    out[..8].copy_from_slice(&value.to_ne_bytes());
    out
}

fn decode_double(bytes: &[u8; ENCODED_LEN]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_ne_bytes(raw)
}

fn encode_x87(value: f64) -> [u8; ENCODED_LEN] {
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & FRAC_MASK;

    // x87 stores the integer bit explicitly at bit 63.
    let (exponent, mantissa): (u16, u64) = if exp == 0x7ff {
        if frac == 0 {
            (0x7fff, 1 << 63)
        } else {
            (0x7fff, (3 << 62) | (frac << 11))
        }
    } else if exp == 0 {
        if frac == 0 {
            (0, 0)
        } else {
            let lz = frac.leading_zeros() as i32;
            ((15372 - lz) as u16, frac << lz)
        }
    } else {
        ((exp - 1023 + 16383) as u16, (1 << 63) | (frac << 11))
    };

    let mut out = [0u8; ENCODED_LEN];
    out[..8].copy_from_slice(&mantissa.to_le_bytes());
    out[8..10].copy_from_slice(&(sign | exponent).to_le_bytes());
    out
}

fn decode_x87(bytes: &[u8; ENCODED_LEN]) -> f64 {
    let mut m = [0u8; 8];
    m.copy_from_slice(&bytes[..8]);
    let mantissa = u64::from_le_bytes(m);
    let se = u16::from_le_bytes([bytes[8], bytes[9]]);
    let sign = if se & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = (se & 0x7fff) as i32;

    if exp == 0x7fff {
        return if mantissa << 1 == 0 {
            sign * f64::INFINITY
        } else {
            f64::NAN
        };
    }
    if mantissa == 0 {
        return sign * 0.0;
    }
    let exp = if exp == 0 { 1 } else { exp };
    sign * scale(mantissa as f64, exp - 16383 - 63)
}

fn encode_binary128(value: f64) -> [u8; ENCODED_LEN] {
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u128) << 127;
    let exp = ((bits >> 52) & 0x7ff) as u32;
    let frac = bits & FRAC_MASK;

    let (exponent, fraction): (u128, u128) = if exp == 0x7ff {
        if frac == 0 {
            (0x7fff, 0)
        } else {
            (0x7fff, (1 << 111) | ((frac as u128) << 60))
        }
    } else if exp == 0 {
        if frac == 0 {
            (0, 0)
        } else {
            // Subnormal doubles are normal in binary128.
            let top = 63 - frac.leading_zeros();
            let rest = frac & !(1u64 << top);
            ((top + 16383 - 1074) as u128, (rest as u128) << (112 - top))
        }
    } else {
        ((exp + 16383 - 1023) as u128, (frac as u128) << 60)
    };

    (sign | (exponent << 112) | fraction).to_ne_bytes()
}

fn decode_binary128(bytes: &[u8; ENCODED_LEN]) -> f64 {
    let raw = u128::from_ne_bytes(*bytes);
    let sign = if raw >> 127 != 0 { -1.0 } else { 1.0 };
    let exp = ((raw >> 112) & 0x7fff) as i32;
    let fraction = raw & ((1u128 << 112) - 1);

    if exp == 0x7fff {
        return if fraction == 0 {
            sign * f64::INFINITY
        } else {
            f64::NAN
        };
    }
    if exp == 0 && fraction == 0 {
        return sign * 0.0;
    }
    let top = (fraction >> 60) as u64;
    let (mantissa, exp) = if exp == 0 {
        (top, 1)
    } else {
        ((1u64 << 52) | top, exp)
    };
    sign * scale(mantissa as f64, exp - 16383 - 52)
}

/// `value * 2^exp` without intermediate overflow or underflow
fn scale(mut value: f64, mut exp: i32) -> f64 {
    let up = 2f64.powi(1000);
    let down = 2f64.powi(-1000);
    while exp > 1000 && value.is_finite() {
        value *= up;
        exp -= 1000;
    }
    while exp < -1000 && value != 0.0 {
        value *= down;
        exp += 1000;
    }
    value * 2f64.powi(exp.clamp(-1100, 1100))
}
