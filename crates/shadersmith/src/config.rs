/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Config file syntax: line normalization, the conditional-inclusion
//! preprocessor, brace expansion and per-line option parsing.
//!
//! One logical line describes one shader:
//!
//! ```text
//! path/to/shader.hlsl -T profile [-E entry] [-O 2] [-o subdir] [-D DEF=1 ...]
//! ```
//!
//! Braces perform Cartesian expansion (`-D MODE={0,1}` yields two lines) and
//! `#ifdef NAME` / `#if 0` / `#if 1` / `#else` / `#endif` gate lines on the
//! global define set.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;

/// One fully-expanded config line.
#[derive(Debug, Parser)]
#[command(name = "config line", no_binary_name = true, disable_help_flag = true)]
pub struct ConfigLine {
    pub source: PathBuf,
    #[arg(short = 'T')]
    pub profile: String,
    #[arg(short = 'E', default_value = "main")]
    pub entry_point: String,
    #[arg(short = 'o')]
    pub output_dir: Option<PathBuf>,
    /// Per-line override; absent means "inherit the global level".
    #[arg(short = 'O', value_parser = clap::value_parser!(u32).range(0..=3))]
    pub optimization: Option<u32>,
    #[arg(short = 'D')]
    pub defines: Vec<String>,
}

impl ConfigLine {
    pub fn parse_tokens(tokens: &[String]) -> Result<Self> {
        Self::try_parse_from(tokens).map_err(|e| anyhow!("can't parse config line: {}", e))
    }
}

/// Strips both ends, turns tabs into spaces and collapses space runs, so
/// the rest of the parser only ever sees single spaces.
pub fn trim_config_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut previous_space = false;
    for ch in line.trim().chars() {
        let ch = if ch == '\t' { ' ' } else { ch };
        if ch == ' ' && previous_space {
            continue;
        }
        previous_space = ch == ' ';
        out.push(ch);
    }
    out
}

/// Splits a line into tokens on spaces, keeping double-quoted spans intact
/// (the quotes themselves are dropped).
pub fn tokenize_config_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut in_string = false;
    for ch in line.chars() {
        match ch {
            '"' => in_string = !in_string,
            ' ' if !in_string => {
                if !token.is_empty() {
                    tokens.push(std::mem::take(&mut token));
                }
            }
            _ => token.push(ch),
        }
    }
    if !token.is_empty() {
        tokens.push(token);
    }
    tokens
}

/// Expands the leftmost `{a,b,c}` alternative list and recurses, producing
/// the full Cartesian product of every brace group on the line.
pub fn expand_braces(line: &str, expanded: &mut Vec<String>) -> Result<()> {
    let Some(opening) = line.find('{') else {
        expanded.push(line.to_string());
        return Ok(());
    };
    let closing = line[opening..]
        .find('}')
        .map(|offset| opening + offset)
        .ok_or_else(|| anyhow!("missing '}}'"))?;

    let mut current = opening + 1;
    loop {
        let comma = match line[current..closing].find(',') {
            Some(offset) => current + offset,
            None => closing,
        };
        let alternative =
            format!("{}{}{}", &line[..opening], &line[current..comma], &line[closing + 1..]);
        expand_braces(&alternative, expanded)?;
        if comma >= closing {
            break;
        }
        current = comma + 1;
    }

    Ok(())
}

/// Conditional-inclusion state over the config line stream. The stack starts
/// at `[true]`; every `#ifdef`/`#if` pushes, `#endif` pops, and a line is
/// live only while the whole stack is true.
///
/// Directives are recognized anywhere in the line, which matches how shader
/// authors actually paste them and keeps the scan trivially cheap.
pub struct LineFilter {
    blocks: Vec<bool>,
}

impl LineFilter {
    pub fn new() -> Self {
        Self { blocks: vec![true] }
    }

    /// Consumes one trimmed line. `Ok(true)` means the line is an ordinary
    /// active line the caller should process; `Ok(false)` means it was a
    /// directive or sits in a dead block. Stray `#else`/`#endif` produce an
    /// `Err` diagnostic but leave the stack untouched.
    pub fn filter(&mut self, line: &str, defines: &[String]) -> Result<bool, String> {
        let top = *self.blocks.last().unwrap();
        if let Some(position) = line.find("#ifdef") {
            let name = line[position + 6..].trim();
            self.blocks.push(top && defines.iter().any(|d| d == name));
            Ok(false)
        } else if line.contains("#if 1") {
            self.blocks.push(top);
            Ok(false)
        } else if line.contains("#if 0") {
            self.blocks.push(false);
            Ok(false)
        } else if line.contains("#endif") {
            if self.blocks.len() == 1 {
                Err("unexpected '#endif'".to_string())
            } else {
                self.blocks.pop();
                Ok(false)
            }
        } else if line.contains("#else") {
            if self.blocks.len() < 2 {
                Err("unexpected '#else'".to_string())
            } else {
                if self.blocks[self.blocks.len() - 2] {
                    let top = self.blocks.last_mut().unwrap();
                    *top = !*top;
                }
                Ok(false)
            }
        } else {
            Ok(top)
        }
    }
}

impl Default for LineFilter {
    fn default() -> Self {
        Self::new()
    }
}
