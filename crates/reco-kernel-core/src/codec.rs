//! Raw fixed-width packing for catalog-aligned arrays.
//!
//! Arrays are stored without framing: one byte per bool, four little-endian
//! bytes per `i32`/`u32`. The element count is recovered from the byte length.

use crate::{CatalogIndex, RecoError};

const WORD: usize = 4;

#[must_use]
pub fn pack_bools(values: &[bool]) -> Vec<u8> {
    values.iter().map(|value| u8::from(*value)).collect()
}

#[must_use]
pub fn unpack_bools(bytes: &[u8]) -> Vec<bool> {
    bytes.iter().map(|byte| *byte != 0).collect()
}

#[must_use]
pub fn pack_i32s(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * WORD);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// # Errors
/// Returns [`RecoError::Malformed`] when the byte length is not a multiple of 4.
pub fn unpack_i32s(bytes: &[u8]) -> Result<Vec<i32>, RecoError> {
    Ok(words(bytes, "i32")?.map(i32::from_le_bytes).collect())
}

#[must_use]
pub fn pack_indices(values: &[CatalogIndex]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * WORD);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// # Errors
/// Returns [`RecoError::Malformed`] when the byte length is not a multiple of 4.
pub fn unpack_indices(bytes: &[u8]) -> Result<Vec<CatalogIndex>, RecoError> {
    Ok(words(bytes, "index")?.map(CatalogIndex::from_le_bytes).collect())
}

fn words<'a>(
    bytes: &'a [u8],
    element: &str,
) -> Result<impl Iterator<Item = [u8; WORD]> + 'a, RecoError> {
    if bytes.len() % WORD != 0 {
        return Err(RecoError::Malformed(format!(
            "packed {element} array has {} bytes, not a multiple of {WORD}",
            bytes.len()
        )));
    }
    Ok(bytes.chunks_exact(WORD).map(|chunk| {
        let mut word = [0_u8; WORD];
        word.copy_from_slice(chunk);
        word
    }))
}

/// Parse a decimal counter or index stored as text.
///
/// # Errors
/// Returns [`RecoError::Malformed`] when the bytes are not a non-negative decimal.
pub fn parse_decimal(bytes: &[u8]) -> Result<CatalogIndex, RecoError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.trim().parse::<CatalogIndex>().ok())
        .ok_or_else(|| {
            RecoError::Malformed(format!(
                "expected decimal integer, got {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

#[must_use]
pub fn format_decimal(value: CatalogIndex) -> Vec<u8> {
    value.to_string().into_bytes()
}
