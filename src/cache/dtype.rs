//! Element and storage dtypes, plus the scalar quantization codecs.
//!
//! FP8 formats:
//! - **E4M3** (OCP E4M3FN): 4-bit exponent, 3-bit mantissa, bias 7,
//!   max ±448, no infinities, `S.1111.111` is NaN.
//! - **E5M2**: 5-bit exponent, 2-bit mantissa, bias 15, max ±57344,
//!   IEEE-style infinities and NaNs.
//!
//! Conversions into the narrow formats saturate at the format max and round
//! half to even.

use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A native (unquantized) element type that key/value inputs arrive in.
pub trait Element: Copy + Send + Sync + bytemuck::Pod + 'static {
    const NATIVE: StorageDtype;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    const NATIVE: StorageDtype = StorageDtype::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    const NATIVE: StorageDtype = StorageDtype::F16;

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for bf16 {
    const NATIVE: StorageDtype = StorageDtype::Bf16;

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// The physical element type of a cache tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDtype {
    F32,
    F16,
    Bf16,
    Fp8E4m3,
    Fp8E5m2,
    Int8,
}

impl StorageDtype {
    pub fn element_bytes(&self) -> usize {
        match self {
            StorageDtype::F32 => 4,
            StorageDtype::F16 | StorageDtype::Bf16 => 2,
            StorageDtype::Fp8E4m3 | StorageDtype::Fp8E5m2 | StorageDtype::Int8 => 1,
        }
    }

    /// Whether values are stored scaled and need a scale to be read back.
    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            StorageDtype::Fp8E4m3 | StorageDtype::Fp8E5m2 | StorageDtype::Int8
        )
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, StorageDtype::Fp8E4m3 | StorageDtype::Fp8E5m2)
    }

    /// Largest representable magnitude in the scaled domain.
    pub fn max_value(&self) -> f32 {
        match self {
            StorageDtype::F32 => f32::MAX,
            StorageDtype::F16 => f16::MAX.to_f32(),
            StorageDtype::Bf16 => bf16::MAX.to_f32(),
            StorageDtype::Fp8E4m3 => E4M3.max,
            StorageDtype::Fp8E5m2 => E5M2.max,
            StorageDtype::Int8 => 127.0,
        }
    }

    /// Packing factor of the x-split cache layouts: elements per 16 bytes.
    pub fn pack_factor(&self) -> usize {
        16 / self.element_bytes()
    }
}

impl std::fmt::Display for StorageDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageDtype::F32 => "f32",
            StorageDtype::F16 => "f16",
            StorageDtype::Bf16 => "bf16",
            StorageDtype::Fp8E4m3 => "fp8_e4m3",
            StorageDtype::Fp8E5m2 => "fp8_e5m2",
            StorageDtype::Int8 => "int8",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageDtype {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32" | "float32" => Ok(StorageDtype::F32),
            "f16" | "float16" | "half" => Ok(StorageDtype::F16),
            "bf16" | "bfloat16" => Ok(StorageDtype::Bf16),
            "fp8" | "fp8_e4m3" => Ok(StorageDtype::Fp8E4m3),
            "fp8_e5m2" => Ok(StorageDtype::Fp8E5m2),
            "int8" => Ok(StorageDtype::Int8),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown storage dtype '{other}'"
            ))),
        }
    }
}

/// The `kv_cache_dtype` string accepted by the cache operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheDtype {
    /// Store in the cache tensor's own native dtype; scales are ignored.
    Auto,
    #[serde(alias = "fp8")]
    Fp8E4m3,
    Fp8E5m2,
    Int8,
}

impl KvCacheDtype {
    /// The storage dtype a cache must have to accept this mode, if fixed.
    pub fn storage(&self) -> Option<StorageDtype> {
        match self {
            KvCacheDtype::Auto => None,
            KvCacheDtype::Fp8E4m3 => Some(StorageDtype::Fp8E4m3),
            KvCacheDtype::Fp8E5m2 => Some(StorageDtype::Fp8E5m2),
            KvCacheDtype::Int8 => Some(StorageDtype::Int8),
        }
    }

    /// Resolve the storage dtype for a cache whose native dtype is `native`.
    pub fn resolve(&self, native: StorageDtype) -> StorageDtype {
        self.storage().unwrap_or(native)
    }
}

impl FromStr for KvCacheDtype {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(KvCacheDtype::Auto),
            "fp8" | "fp8_e4m3" => Ok(KvCacheDtype::Fp8E4m3),
            "fp8_e5m2" => Ok(KvCacheDtype::Fp8E5m2),
            "int8" => Ok(KvCacheDtype::Int8),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown kv_cache_dtype '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for KvCacheDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KvCacheDtype::Auto => "auto",
            KvCacheDtype::Fp8E4m3 => "fp8_e4m3",
            KvCacheDtype::Fp8E5m2 => "fp8_e5m2",
            KvCacheDtype::Int8 => "int8",
        };
        f.write_str(name)
    }
}

/// Bit layout of a small float format.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fp8Format {
    exp_bits: u32,
    man_bits: u32,
    bias: i32,
    max: f32,
    has_inf: bool,
}

pub(crate) const E4M3: Fp8Format = Fp8Format {
    exp_bits: 4,
    man_bits: 3,
    bias: 7,
    max: 448.0,
    has_inf: false,
};

pub(crate) const E5M2: Fp8Format = Fp8Format {
    exp_bits: 5,
    man_bits: 2,
    bias: 15,
    max: 57344.0,
    has_inf: true,
};

impl Fp8Format {
    fn nan_code(&self) -> u8 {
        // All-ones exponent and mantissa is NaN in both formats.
        0x7F
    }

    fn min_normal_exp(&self) -> i32 {
        1 - self.bias
    }

    /// Saturating, round-half-even encode.
    pub(crate) fn encode(&self, x: f32) -> u8 {
        if x.is_nan() {
            return self.nan_code();
        }
        let sign: u8 = if x.is_sign_negative() { 0x80 } else { 0 };
        let a = x.abs().min(self.max);
        if a == 0.0 {
            return sign;
        }

        let man_one = 1u32 << self.man_bits;
        let min_exp = self.min_normal_exp();

        if a < pow2(min_exp) {
            // Subnormal range: fixed step below the smallest normal.
            let step = pow2(min_exp - self.man_bits as i32);
            let m = (a / step).round_ties_even() as u32;
            // m == man_one rolls over into the smallest normal: exponent field 1.
            return sign | m as u8;
        }

        let mut exp = f32_exponent(a);
        let step = pow2(exp - self.man_bits as i32);
        let mut q = (a / step).round_ties_even() as u32;
        if q == man_one << 1 {
            exp += 1;
            q = man_one;
        }
        let exp_field = (exp + self.bias) as u32;
        let code = (exp_field << self.man_bits) | (q - man_one);
        sign | code as u8
    }

    pub(crate) fn decode(&self, code: u8) -> f32 {
        let negative = code & 0x80 != 0;
        let exp_mask = (1u8 << self.exp_bits) - 1;
        let man_mask = (1u8 << self.man_bits) - 1;
        let exp_field = (code >> self.man_bits) & exp_mask;
        let man = code & man_mask;

        let magnitude = if exp_field == exp_mask {
            if self.has_inf {
                if man == 0 {
                    f32::INFINITY
                } else {
                    f32::NAN
                }
            } else if man == man_mask {
                f32::NAN
            } else {
                normal_value(exp_field, man, self)
            }
        } else if exp_field == 0 {
            man as f32 * pow2(self.min_normal_exp() - self.man_bits as i32)
        } else {
            normal_value(exp_field, man, self)
        };

        if negative {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Spacing between adjacent representable values around `magnitude`.
    fn step(&self, magnitude: f32) -> f32 {
        let a = magnitude.abs().min(self.max);
        let exp = if a < pow2(self.min_normal_exp()) {
            self.min_normal_exp()
        } else {
            f32_exponent(a)
        };
        pow2(exp - self.man_bits as i32)
    }
}

fn normal_value(exp_field: u8, man: u8, fmt: &Fp8Format) -> f32 {
    let frac = 1.0 + man as f32 / (1u32 << fmt.man_bits) as f32;
    frac * pow2(exp_field as i32 - fmt.bias)
}

fn pow2(e: i32) -> f32 {
    2f32.powi(e)
}

/// Unbiased binary exponent of a normal positive f32.
fn f32_exponent(a: f32) -> i32 {
    ((a.to_bits() >> 23) & 0xff) as i32 - 127
}

/// Encode an already-scaled value into the one-byte storage code of `dtype`.
pub(crate) fn encode_byte(dtype: StorageDtype, scaled: f32) -> u8 {
    match dtype {
        StorageDtype::Fp8E4m3 => E4M3.encode(scaled),
        StorageDtype::Fp8E5m2 => E5M2.encode(scaled),
        StorageDtype::Int8 => {
            let q = if scaled.is_nan() {
                0.0
            } else {
                scaled.round_ties_even().clamp(-127.0, 127.0)
            };
            (q as i8) as u8
        }
        _ => unreachable!("encode_byte called with wide dtype {dtype}"),
    }
}

/// Decode a one-byte storage code of `dtype` into the scaled domain.
pub(crate) fn decode_byte(dtype: StorageDtype, code: u8) -> f32 {
    match dtype {
        StorageDtype::Fp8E4m3 => E4M3.decode(code),
        StorageDtype::Fp8E5m2 => E5M2.decode(code),
        StorageDtype::Int8 => (code as i8) as f32,
        _ => unreachable!("decode_byte called with wide dtype {dtype}"),
    }
}

/// One quantization step of `dtype` at the given scaled magnitude.
///
/// `|x - dequant(quant(x, s), s)| <= s * quantization_step(dtype, |x| / s)`
/// holds for every in-range `x`.
pub fn quantization_step(dtype: StorageDtype, scaled_magnitude: f32) -> f32 {
    match dtype {
        StorageDtype::Fp8E4m3 => E4M3.step(scaled_magnitude),
        StorageDtype::Fp8E5m2 => E5M2.step(scaled_magnitude),
        StorageDtype::Int8 => 1.0,
        StorageDtype::F16 => {
            let a = f16::from_f32(scaled_magnitude.abs());
            (f16::from_bits(a.to_bits() + 1).to_f32() - a.to_f32()).abs()
        }
        StorageDtype::Bf16 => {
            let a = bf16::from_f32(scaled_magnitude.abs());
            (bf16::from_bits(a.to_bits() + 1).to_f32() - a.to_f32()).abs()
        }
        StorageDtype::F32 => 0.0,
    }
}

/// Per-token scale for a slice of values: `absmax / dtype_max`, or 1.0 for an
/// all-zero slice so that quantizing never divides by zero.
pub fn absmax_scale(values: impl IntoIterator<Item = f32>, dtype: StorageDtype) -> f32 {
    let absmax = values.into_iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if absmax == 0.0 || !absmax.is_finite() {
        1.0
    } else {
        absmax / dtype.max_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e4m3_known_codes() {
        assert_eq!(E4M3.encode(0.0), 0x00);
        assert_eq!(E4M3.encode(1.0), 0x38);
        assert_eq!(E4M3.encode(-2.0), 0xC0);
        assert_eq!(E4M3.encode(448.0), 0x7E);
        // Saturation instead of NaN.
        assert_eq!(E4M3.encode(1.0e6), 0x7E);
        assert_eq!(E4M3.decode(0x7E), 448.0);
        assert!(E4M3.decode(0x7F).is_nan());
        // Smallest subnormal: 2^-9.
        assert_eq!(E4M3.decode(0x01), 2f32.powi(-9));
    }

    #[test]
    fn test_e5m2_known_codes() {
        assert_eq!(E5M2.encode(1.0), 0x3C);
        assert_eq!(E5M2.decode(0x3C), 1.0);
        assert_eq!(E5M2.encode(57344.0), 0x7B);
        assert_eq!(E5M2.decode(0x7C), f32::INFINITY);
    }

    #[test]
    fn test_fp8_decode_encode_is_identity_on_codes() {
        for fmt in [E4M3, E5M2] {
            for code in 0u8..=255 {
                let v = fmt.decode(code);
                if !v.is_finite() {
                    continue;
                }
                let back = fmt.encode(v);
                // +0 and -0 are distinct codes that decode equal.
                assert_eq!(fmt.decode(back), v, "code {code:#04x}");
            }
        }
    }

    #[test]
    fn test_fp8_error_within_one_step() {
        for dtype in [StorageDtype::Fp8E4m3, StorageDtype::Fp8E5m2] {
            let mut x = -440.0f32;
            while x < 440.0 {
                let q = decode_byte(dtype, encode_byte(dtype, x));
                let step = quantization_step(dtype, x.abs());
                assert!((x - q).abs() <= step, "{dtype}: x={x} q={q} step={step}");
                x += 0.37;
            }
        }
    }

    #[test]
    fn test_round_half_even() {
        // 1.0625 sits exactly between 1.0 and 1.125 in E4M3; ties go to the even mantissa.
        assert_eq!(E4M3.decode(E4M3.encode(1.0625)), 1.0);
        assert_eq!(E4M3.decode(E4M3.encode(1.1875)), 1.25);
    }

    #[test]
    fn test_int8_codec() {
        assert_eq!(decode_byte(StorageDtype::Int8, encode_byte(StorageDtype::Int8, 3.4)), 3.0);
        assert_eq!(
            decode_byte(StorageDtype::Int8, encode_byte(StorageDtype::Int8, -300.0)),
            -127.0
        );
    }

    #[test]
    fn test_kv_cache_dtype_parse() {
        assert_eq!("auto".parse::<KvCacheDtype>().unwrap(), KvCacheDtype::Auto);
        assert_eq!("fp8".parse::<KvCacheDtype>().unwrap(), KvCacheDtype::Fp8E4m3);
        assert!("fp4".parse::<KvCacheDtype>().is_err());
        assert_eq!(
            KvCacheDtype::Auto.resolve(StorageDtype::Bf16),
            StorageDtype::Bf16
        );
    }

    #[test]
    fn test_absmax_scale() {
        let s = absmax_scale([1.0, -4.0, 2.0], StorageDtype::Int8);
        assert!((s - 4.0 / 127.0).abs() < 1e-9);
        assert_eq!(absmax_scale([0.0, 0.0], StorageDtype::Fp8E4m3), 1.0);
    }

    #[test]
    fn test_pack_factor() {
        assert_eq!(StorageDtype::F32.pack_factor(), 4);
        assert_eq!(StorageDtype::F16.pack_factor(), 8);
        assert_eq!(StorageDtype::Fp8E4m3.pack_factor(), 16);
    }
}
