//! `rust-aec-encoder` is a pure Rust encoder for **CCSDS 121.0-B-2 Adaptive
//! Entropy Coding (AEC)**.
//!
//! Primary goal: produce bitstreams for **GRIB2 Data Representation Template
//! 5.0 = 42 (CCSDS/AEC)** without requiring native `libaec`.
//!
//! # Quick start
//!
//! ```
//! use rust_aec_encoder::{encode, flags_from_grib2_ccsds_flags, AecParams};
//!
//! // In a real GRIB2 pipeline, samples come from Section 7 packing and the
//! // parameters go into Section 5. This snippet focuses on API shape.
//! let samples: Vec<u8> = vec![0; 32 * 128 * 2];
//!
//! let params = AecParams::new(12, 32, 128, flags_from_grib2_ccsds_flags(0x0e));
//! let payload = encode(&samples, params);
//! assert!(payload.is_ok());
//! ```
//!
//! For chunked input or output use [`Encoder`] directly: push bytes with
//! [`Encoder::push_input`], drain coded bytes with [`Encoder::encode`], and
//! pass [`Flush::Flush`] once the input is complete.

mod bitwriter;
mod encoder;
pub mod error;
mod extract;
pub mod params;
mod preprocess;

pub use crate::error::AecError;
pub use crate::params::{AecFlags, AecParams};

pub use crate::encoder::{EncodeStatus, Encoder, Flush};

/// Encode a buffer of packed samples into an AEC bitstream.
///
/// - `input`: raw samples, `bytes_per_sample` bytes each, where
///   `bytes_per_sample = ceil(bits_per_sample / 8)` (subject to
///   `AecFlags::DATA_3BYTE` rules) and byte order follows `AecFlags::MSB`.
/// - `params`: bit width, block size, RSI, and flags.
///
/// A trailing partial block is padded by repeating the last sample; the
/// decoder relies on the sample count to drop the padding again. Returns the
/// complete Coded Data Set byte stream, final byte zero-padded.
pub fn encode(input: &[u8], params: AecParams) -> Result<Vec<u8>, AecError> {
    encoder::encode(input, params)
}

/// Helper: convert GRIB2 `ccsdsFlags` (template 5.42) to `AecFlags`.
pub fn flags_from_grib2_ccsds_flags(ccsds_flags: u8) -> AecFlags {
    let table = [
        (1u8 << 0, AecFlags::DATA_SIGNED),
        (1 << 1, AecFlags::DATA_3BYTE),
        (1 << 2, AecFlags::MSB),
        (1 << 3, AecFlags::DATA_PREPROCESS),
        (1 << 4, AecFlags::RESTRICTED),
        (1 << 5, AecFlags::PAD_RSI),
    ];

    let mut flags = AecFlags::empty();
    for (bit, flag) in table {
        if ccsds_flags & bit != 0 {
            flags |= flag;
        }
    }
    flags
}
