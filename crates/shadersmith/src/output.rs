/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Writing compiled bytecode to disk, in raw binary form and as C headers
//! embedding the bytes as a `const uint8_t` array.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::options::Options;
use crate::plan::Task;

/// Appends an extension-like suffix verbatim (`set_extension` would eat a
/// permutation hash that happens to look like an extension).
pub fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut out = path.to_path_buf().into_os_string();
    out.push(ext);
    PathBuf::from(out)
}

/// C identifier embedded in generated headers: the output file's basename
/// with dots flattened, e.g. `blit.vs` + `.dxil` -> `g_blit_vs_dxil`.
pub fn header_symbol(output_path: &Path, ext: &str) -> String {
    let name = output_path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .replace('.', "_");
    format!("g_{}_{}", name, ext.trim_start_matches('.'))
}

/// Byte sink that renders every byte as a decimal literal followed by
/// `", "`, breaking the line with a 4-space indent whenever the running
/// width would pass 128 columns. Wrapping a `Write` lets the blob framing
/// code stream through it unchanged.
pub struct HeaderSink<W: Write> {
    inner: W,
    column: u32,
}

impl<W: Write> HeaderSink<W> {
    pub fn new(inner: W) -> Self {
        // Start past the limit so the first byte opens a fresh line.
        Self { inner, column: u32::MAX }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn put(&mut self, byte: u8) -> io::Result<()> {
        if self.column > 128 {
            self.inner.write_all(b"\n    ")?;
            self.column = 0;
        }
        write!(self.inner, "{}, ", byte)?;
        self.column += match byte {
            0..=9 => 3,
            10..=99 => 4,
            _ => 5,
        };
        Ok(())
    }
}

impl<W: Write> Write for HeaderSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.put(byte)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub fn write_header_preamble(out: &mut dyn Write, symbol: &str) -> io::Result<()> {
    write!(out, "const uint8_t {}[] = {{", symbol)
}

pub fn write_header_epilog(out: &mut dyn Write) -> io::Result<()> {
    out.write_all(b"\n};\n")
}

/// Writes `data` as a complete C header file declaring `symbol`.
pub fn write_header_file(file: &Path, symbol: &str, data: &[u8]) -> io::Result<()> {
    let mut sink = HeaderSink::new(BufWriter::new(File::create(file)?));
    write_header_preamble(&mut sink.inner, symbol)?;
    sink.write_all(data)?;
    let mut out = sink.into_inner();
    write_header_epilog(&mut out)?;
    out.flush()
}

/// Writes the requested output forms for one compiled task. The raw binary
/// doubles as the blob assembler's input, so any blob form produces it too;
/// the header form is only written directly when no blob will cover it.
pub fn dump_output(options: &Options, task: &Task, data: &[u8]) -> io::Result<()> {
    let defines_empty = task.defines.is_empty();
    let output_file = append_ext(&task.output_path, &options.output_ext);

    if options.binary_wanted(defines_empty) {
        fs::write(&output_file, data)?;
    }

    if options.header_wanted(defines_empty) {
        let header_file = append_ext(&output_file, ".h");
        let symbol = header_symbol(&task.output_path, &options.output_ext);
        write_header_file(&header_file, &symbol, data)?;
    }

    Ok(())
}
