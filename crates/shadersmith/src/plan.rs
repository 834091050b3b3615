/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! The task planner: turns the config file into the concrete set of compile
//! tasks and blob groups, skipping work whose outputs are still fresh.
//!
//! Freshness is decided against the *hierarchical* time of a source file:
//! the maximum last-write-time across the file and every transitively
//! `#include`d dependency, memoized per absolute path. The scan is textual,
//! so an include sitting inside a comment or a dead `#if 0` block still
//! counts; over-rebuilding is the safe direction.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use regex::Regex;

use crate::config::{ConfigLine, LineFilter, expand_braces, tokenize_config_line, trim_config_line};
use crate::options::{Options, PDB_DIR, Platform};
use crate::output::append_ext;

/// One fully-resolved unit of work, self-contained so it can be re-queued
/// and reprocessed identically on retry.
#[derive(Clone, Debug)]
pub struct Task {
    /// Shader path as written in the config, relative to the source root.
    pub source: PathBuf,
    pub entry_point: String,
    pub profile: String,
    /// Permutation output path, without extension.
    pub output_path: PathBuf,
    /// Local defines, space-joined in config order.
    pub combined_defines: String,
    pub defines: Vec<String>,
    pub optimization_level: u32,
}

/// One permutation of a blob group.
#[derive(Clone, Debug)]
pub struct BlobEntry {
    /// Compiled permutation file, without extension.
    pub permutation_path: PathBuf,
    pub defines: String,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<Task>,
    /// Blob path without extension -> permutations, in registration order.
    pub blobs: BTreeMap<PathBuf, Vec<BlobEntry>>,
}

/// 32-bit fold of a 64-bit FNV-1a over the combined defines string. The
/// fold keeps permutation file names short; FNV keeps them stable across
/// runs and toolchains, which the freshness check depends on.
pub fn permutation_hash(combined_defines: &str) -> u32 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in combined_defines.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash as u32) ^ ((hash >> 32) as u32)
}

/// Drops leading `..` components so outputs of sources above the source
/// root still land inside the output directory.
pub fn strip_leading_dotdots(path: &Path) -> PathBuf {
    let mut components = path.components().peekable();
    while matches!(components.peek(), Some(Component::ParentDir)) {
        components.next();
    }
    components.collect()
}

fn modified(file: &Path) -> Result<SystemTime> {
    fs::metadata(file)
        .and_then(|metadata| metadata.modified())
        .with_context(|| format!("can't read the write time of '{}'", file.display()))
}

fn format_call_stack(call_stack: &[PathBuf]) -> String {
    call_stack
        .iter()
        .rev()
        .map(|file| format!("\t{}", file.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

struct Planner<'a> {
    options: &'a Options,
    /// Upper bound on non-source staleness signals: config write time and
    /// the driver binary's own write time.
    stamp: SystemTime,
    times: HashMap<PathBuf, SystemTime>,
    tasks: Vec<Task>,
    blobs: BTreeMap<PathBuf, Vec<BlobEntry>>,
}

/// Reads the config file and produces the task set and blob registry.
/// Parse and include-resolution problems are fatal; stray `#else`/`#endif`
/// directives only draw a diagnostic.
pub fn plan(options: &Options) -> Result<Plan> {
    let config_time = modified(&options.config)?;
    let stamp = std::env::current_exe()
        .ok()
        .and_then(|exe| fs::metadata(exe).ok())
        .and_then(|metadata| metadata.modified().ok())
        .map_or(config_time, |exe_time| config_time.max(exe_time));

    let text = fs::read_to_string(&options.config)
        .with_context(|| format!("can't read config file '{}'", options.config.display()))?;

    let mut planner = Planner {
        options,
        stamp,
        times: HashMap::new(),
        tasks: Vec::new(),
        blobs: BTreeMap::new(),
    };

    let mut filter = LineFilter::new();
    for (line_index, raw_line) in text.lines().enumerate() {
        let line = trim_config_line(raw_line);
        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        match filter.filter(&line, &options.defines) {
            Ok(false) => {}
            Ok(true) => {
                let mut expanded = Vec::new();
                expand_braces(&line, &mut expanded).map_err(|e| {
                    anyhow!("{}({},0): {}", options.config.display(), line_index + 1, e)
                })?;
                for line in &expanded {
                    planner.process_line(line_index, line)?;
                }
            }
            Err(diagnostic) => {
                println!(
                    "{}",
                    format!(
                        "{}({},0): ERROR: {}",
                        options.config.display(),
                        line_index + 1,
                        diagnostic
                    )
                    .red()
                );
            }
        }
    }

    Ok(Plan { tasks: planner.tasks, blobs: planner.blobs })
}

impl Planner<'_> {
    fn process_line(&mut self, line_index: usize, line: &str) -> Result<()> {
        let tokens = tokenize_config_line(line);
        let config_line = ConfigLine::parse_tokens(&tokens).map_err(|e| {
            anyhow!("{}({},0): {}", self.options.config.display(), line_index + 1, e)
        })?;

        // DXBC has no library, mesh or amplification pipeline.
        if self.options.platform == Platform::Dxbc
            && matches!(config_line.profile.as_str(), "lib" | "ms" | "as")
        {
            return Ok(());
        }

        let combined_defines = config_line.defines.join(" ");

        // Compiled shader name: config-relative path without extension,
        // reduced to the bare file name when flattening or redirecting.
        let mut shader_name = strip_leading_dotdots(&config_line.source);
        shader_name.set_extension("");
        if self.options.flatten || config_line.output_dir.is_some() {
            if let Some(file_name) = shader_name.file_name() {
                shader_name = PathBuf::from(file_name);
            }
        }
        if config_line.entry_point != "main" {
            let mut file_name = shader_name.file_name().unwrap_or_default().to_os_string();
            file_name.push(format!("_{}", config_line.entry_point));
            shader_name.set_file_name(file_name);
        }

        // Permutation name: shader name plus a hash of the define set.
        let mut permutation_name = shader_name.clone();
        if !config_line.defines.is_empty() {
            let mut file_name = permutation_name.file_name().unwrap_or_default().to_os_string();
            file_name.push(format!("_{:08X}", permutation_hash(&combined_defines)));
            permutation_name.set_file_name(file_name);
        }

        let dest_dir = match &config_line.output_dir {
            Some(subdir) => self.options.out.join(subdir),
            None => self.options.out.clone(),
        };

        // A freshly-created output directory cannot hold up-to-date outputs.
        let mut force = self.options.force;
        let mut end_path = dest_dir.clone();
        if let Some(parent) = shader_name.parent() {
            end_path = end_path.join(parent);
        }
        if self.options.pdb {
            end_path = end_path.join(PDB_DIR);
        }
        if !end_path.as_os_str().is_empty() && !end_path.exists() {
            fs::create_dir_all(&end_path).with_context(|| {
                format!("can't create output directory '{}'", end_path.display())
            })?;
            force = true;
        }

        let source_file = self.options.source_file(&config_line.source);
        let permutation_file = dest_dir.join(&permutation_name);
        let blob_file = dest_dir.join(&shader_name);
        let ext = self.options.output_ext.clone();

        let mut required = Vec::new();
        if self.options.binary {
            required.push(append_ext(&permutation_file, &ext));
        }
        if self.options.header {
            required.push(append_ext(&append_ext(&permutation_file, &ext), ".h"));
        }
        if self.options.binary_blob {
            required.push(append_ext(&blob_file, &ext));
        }
        if self.options.header_blob {
            required.push(append_ext(&append_ext(&blob_file, &ext), ".h"));
        }

        let up_to_date = if force {
            false
        } else {
            self.outputs_up_to_date(&required, &source_file)?
        };

        // Blob membership is decided here, unconditionally: the assembler
        // reads permutation files from disk, so even a task that is skipped
        // as up-to-date contributes its entry.
        if self.options.any_blob() {
            self.blobs.entry(blob_file).or_default().push(BlobEntry {
                permutation_path: permutation_file.clone(),
                defines: combined_defines.clone(),
            });
        }

        if up_to_date {
            return Ok(());
        }

        let optimization_level =
            config_line.optimization.unwrap_or(self.options.optimization).min(3);

        self.tasks.push(Task {
            source: config_line.source,
            entry_point: config_line.entry_point,
            profile: config_line.profile,
            output_path: permutation_file,
            combined_defines,
            defines: config_line.defines,
            optimization_level,
        });

        Ok(())
    }

    /// True when every required output exists and the oldest of them is
    /// newer than every staleness signal.
    fn outputs_up_to_date(&mut self, required: &[PathBuf], source_file: &Path) -> Result<bool> {
        let mut output_time: Option<SystemTime> = None;
        for file in required {
            let Ok(time) = fs::metadata(file).and_then(|metadata| metadata.modified()) else {
                return Ok(false);
            };
            output_time = Some(output_time.map_or(time, |t| t.min(time)));
        }
        let Some(output_time) = output_time else {
            return Ok(false);
        };

        let mut call_stack = Vec::new();
        let source_time = self.hierarchical_time(source_file, &mut call_stack)?;
        Ok(output_time > source_time.max(self.stamp))
    }

    /// Maximum write time across `file` and its transitive non-relaxed
    /// includes. Memoization both caches and terminates cyclic include
    /// graphs; the call stack exists purely for readable diagnostics.
    fn hierarchical_time(
        &mut self,
        file: &Path,
        call_stack: &mut Vec<PathBuf>,
    ) -> Result<SystemTime> {
        static INCLUDE_PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = INCLUDE_PATTERN
            .get_or_init(|| Regex::new(r#"^\s*#include\s+["<]([^">]+)[">]"#).unwrap());

        if let Some(time) = self.times.get(file) {
            return Ok(*time);
        }

        let text = fs::read_to_string(file).map_err(|_| {
            anyhow!(
                "can't open file '{}', included in:\n{}",
                file.display(),
                format_call_stack(call_stack)
            )
        })?;

        call_stack.push(file.to_path_buf());
        let parent = file.parent().unwrap_or(Path::new("")).to_path_buf();
        let mut time = modified(file)?;

        for line in text.lines() {
            let Some(captures) = pattern.captures(line) else {
                continue;
            };
            let include_name = PathBuf::from(&captures[1]);
            if self.options.relaxed_includes.iter().any(|relaxed| *relaxed == include_name) {
                continue;
            }

            let mut include_file = parent.join(&include_name);
            if !include_file.exists() {
                include_file = self
                    .options
                    .include_dirs
                    .iter()
                    .map(|dir| dir.join(&include_name))
                    .find(|candidate| candidate.exists())
                    .ok_or_else(|| {
                        anyhow!(
                            "can't find include file '{}', included in:\n{}",
                            include_name.display(),
                            format_call_stack(call_stack)
                        )
                    })?;
            }

            let dependency_time = self.hierarchical_time(&include_file, call_stack)?;
            time = time.max(dependency_time);
        }

        call_stack.pop();
        self.times.insert(file.to_path_buf(), time);
        Ok(time)
    }
}
