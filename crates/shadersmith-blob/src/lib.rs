/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Container framing for shader blob files.
//!
//! A blob packs several compiled permutations of one shader under a common
//! name. The layout is a fixed signature followed by one entry per
//! permutation: two little-endian `u32` lengths (defines string, bytecode),
//! the defines string, then the bytecode. The driver writes blobs through
//! [`write_file_header`]/[`write_permutation`] with an arbitrary byte sink,
//! so the same framing lands in raw binaries and in generated C headers.


use std::io::Write;

use thiserror::Error;

/// First bytes of every blob file.
pub const BLOB_SIGNATURE: [u8; 8] = *b"SSMBLOB1";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob is truncated at byte {0}")]
    Truncated(usize),
    #[error("blob signature mismatch")]
    BadSignature,
    #[error("permutation defines are not valid UTF-8")]
    BadDefines,
    #[error("entry length overflows the blob")]
    BadLength,
}

/// One decoded entry of a blob file, borrowing from the file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permutation<'a> {
    pub defines: &'a str,
    pub data: &'a [u8],
}

/// Writes the blob signature. Must be called exactly once per file, before
/// any permutation entry.
pub fn write_file_header(out: &mut dyn Write) -> std::io::Result<()> {
    out.write_all(&BLOB_SIGNATURE)
}

/// Appends one permutation entry: entry header, defines string, bytecode.
pub fn write_permutation(out: &mut dyn Write, defines: &str, data: &[u8]) -> std::io::Result<()> {
    out.write_all(&(defines.len() as u32).to_le_bytes())?;
    out.write_all(&(data.len() as u32).to_le_bytes())?;
    out.write_all(defines.as_bytes())?;
    out.write_all(data)
}

fn read_u32(blob: &[u8], offset: usize) -> Result<u32, BlobError> {
    let bytes = blob
        .get(offset..offset + 4)
        .ok_or(BlobError::Truncated(offset))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Decodes every entry of `blob`, in file order.
pub fn enumerate_permutations(blob: &[u8]) -> Result<Vec<Permutation<'_>>, BlobError> {
    if blob.len() < BLOB_SIGNATURE.len() {
        return Err(BlobError::Truncated(blob.len()));
    }
    if blob[..BLOB_SIGNATURE.len()] != BLOB_SIGNATURE {
        return Err(BlobError::BadSignature);
    }

    let mut entries = Vec::new();
    let mut offset = BLOB_SIGNATURE.len();
    while offset < blob.len() {
        let defines_len = read_u32(blob, offset)? as usize;
        let data_len = read_u32(blob, offset + 4)? as usize;
        offset += 8;

        let end = offset
            .checked_add(defines_len)
            .and_then(|o| o.checked_add(data_len))
            .ok_or(BlobError::BadLength)?;
        if end > blob.len() {
            return Err(BlobError::Truncated(offset));
        }

        let defines =
            std::str::from_utf8(&blob[offset..offset + defines_len]).map_err(|_| BlobError::BadDefines)?;
        let data = &blob[offset + defines_len..end];
        entries.push(Permutation { defines, data });
        offset = end;
    }

    Ok(entries)
}

/// Returns the bytecode of the entry whose defines string matches exactly,
/// or `None` if the blob holds no such permutation.
pub fn find_permutation<'a>(blob: &'a [u8], defines: &str) -> Result<Option<&'a [u8]>, BlobError> {
    Ok(enumerate_permutations(blob)?
        .into_iter()
        .find(|p| p.defines == defines)
        .map(|p| p.data))
}
