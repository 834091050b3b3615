/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Blob assembly: after the pool drains, pack the compiled permutations of
//! each registered group into binary and/or header blob files. Framing is
//! owned by the `blob` crate; this module only feeds it bytes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use colored::Colorize;

use crate::options::Options;
use crate::output::{
    HeaderSink, append_ext, header_symbol, write_header_epilog, write_header_preamble,
};
use crate::plan::BlobEntry;

/// Walks the blob registry in order and returns the number of groups that
/// failed. Under `--continue` a failed group is skipped; otherwise the
/// first failure stops the walk.
pub fn assemble_blobs(options: &Options, blobs: &BTreeMap<PathBuf, Vec<BlobEntry>>) -> u32 {
    let mut failed = 0;
    for (blob_path, entries) in blobs {
        if let Err(e) = assemble_group(options, blob_path, entries) {
            println!("{}", format!("ERROR: {:#}", e).red());
            failed += 1;
            if !options.continue_on_error {
                break;
            }
        }
    }
    failed
}

fn assemble_group(options: &Options, blob_path: &PathBuf, entries: &[BlobEntry]) -> Result<()> {
    // A single permutation without defines compiles straight to the blob
    // file name; packing it would wrap a file in itself.
    if entries.len() == 1 && entries[0].defines.is_empty() {
        return Ok(());
    }
    if entries.iter().any(|entry| entry.defines.is_empty()) {
        let shader = blob_path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        bail!(
            "shader '{}' mixes a permutation without defines into a blob group, \
             its output file would alias the blob",
            shader
        );
    }

    let ext = &options.output_ext;
    let binary_file = append_ext(blob_path, ext);
    let header_file = append_ext(&binary_file, ".h");

    let mut binary_out = match options.binary_blob {
        true => Some(BufWriter::new(File::create(&binary_file).with_context(|| {
            format!("can't create blob file '{}'", binary_file.display())
        })?)),
        false => None,
    };
    let mut header_out = match options.header_blob {
        true => {
            let mut out = BufWriter::new(File::create(&header_file).with_context(|| {
                format!("can't create blob file '{}'", header_file.display())
            })?);
            write_header_preamble(&mut out, &header_symbol(blob_path, ext))
                .with_context(|| format!("can't write blob file '{}'", header_file.display()))?;
            Some(HeaderSink::new(out))
        }
        false => None,
    };

    if let Some(out) = binary_out.as_mut() {
        blob::write_file_header(out)
            .with_context(|| format!("can't write blob file '{}'", binary_file.display()))?;
    }
    if let Some(out) = header_out.as_mut() {
        blob::write_file_header(out)
            .with_context(|| format!("can't write blob file '{}'", header_file.display()))?;
    }

    for entry in entries {
        let file = append_ext(&entry.permutation_path, ext);
        let data = fs::read(&file)
            .with_context(|| format!("can't open file source '{}'", file.display()))?;
        if data.is_empty() {
            bail!("binary file '{}' is empty", file.display());
        }
        if data.len() > 64 << 20 {
            println!(
                "{}",
                format!("WARNING: binary file '{}' is too large!", file.display()).yellow()
            );
        }

        if let Some(out) = binary_out.as_mut() {
            blob::write_permutation(out, &entry.defines, &data)
                .with_context(|| format!("can't write blob file '{}'", binary_file.display()))?;
        }
        if let Some(out) = header_out.as_mut() {
            blob::write_permutation(out, &entry.defines, &data)
                .with_context(|| format!("can't write blob file '{}'", header_file.display()))?;
        }
    }

    if let Some(mut out) = binary_out {
        out.flush()
            .with_context(|| format!("can't write blob file '{}'", binary_file.display()))?;
    }
    if let Some(sink) = header_out {
        let mut out = sink.into_inner();
        write_header_epilog(&mut out)
            .and_then(|_| out.flush())
            .with_context(|| format!("can't write blob file '{}'", header_file.display()))?;
    }

    // The per-permutation binaries were only blob inputs unless --binary
    // asked to keep them.
    if !options.binary {
        for entry in entries {
            let _ = fs::remove_file(append_ext(&entry.permutation_path, ext));
        }
    }

    Ok(())
}
