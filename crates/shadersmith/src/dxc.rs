/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! In-process DXC backend (Windows): drives `dxcompiler.dll` through
//! hassle-rs instead of spawning a child per task. Each worker owns one
//! compiler and one library instance for its whole lifetime.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::sync::atomic::Ordering;

use anyhow::Context;
use hassle_rs::{Dxc, DxcBlob, DxcCompiler, DxcIncludeHandler, DxcLibrary, DxcOperationResult};

use colored::Colorize;

use crate::options::{Options, PDB_DIR, Platform, SPIRV_SPACES};
use crate::output::dump_output;
use crate::plan::Task;
use crate::worker::{BuildState, TaskOutcome, update_progress};

const OPTIMIZATION_ARGS: [&str; 4] = ["-Od", "-O1", "-O2", "-O3"];

/// Resolves includes the way the planner does: the source file's directory
/// first, then the configured include directories.
struct IncludeHandler {
    search_dirs: Vec<PathBuf>,
}

impl IncludeHandler {
    fn new(source_file: &Path, options: &Options) -> Self {
        let mut search_dirs = Vec::with_capacity(options.include_dirs.len() + 1);
        search_dirs.push(source_file.parent().unwrap_or(Path::new("")).to_path_buf());
        search_dirs.extend(options.include_dirs.iter().cloned());
        Self { search_dirs }
    }
}

impl DxcIncludeHandler for IncludeHandler {
    fn load_source(&mut self, filename: String) -> Option<String> {
        // DXC hands over paths it already resolved as well as bare names.
        if let Ok(text) = fs::read_to_string(Path::new(&filename)) {
            return Some(text);
        }
        let name = filename.strip_prefix("./").unwrap_or(&filename);
        self.search_dirs
            .iter()
            .find_map(|dir| fs::read_to_string(dir.join(name)).ok())
    }
}

/// One message no matter how many workers lose the race to load DXC.
fn fail_init(state: &BuildState, error: &dyn std::fmt::Display) {
    static REPORTED: Once = Once::new();
    REPORTED.call_once(|| {
        println!("{}", format!("ERROR: can't create a DXC compiler instance: {}", error).red());
    });
    state.terminate.store(true, Ordering::Relaxed);
}

fn dxcompiler_path(options: &Options) -> Option<PathBuf> {
    options
        .compiler
        .as_ref()
        .and_then(|compiler| compiler.parent())
        .map(|dir| dir.join("dxcompiler.dll"))
}

/// The DXC API backend is useless without dxcompiler; load it up front so a
/// broken installation fails once, before any worker starts.
pub fn preload(options: &Options) -> anyhow::Result<()> {
    Dxc::new(dxcompiler_path(options))
        .map(|_| ())
        .context("can't load dxcompiler.dll")
}

pub fn run_worker(state: &BuildState) {
    let options = state.options;

    let dxc = match Dxc::new(dxcompiler_path(options)) {
        Ok(dxc) => dxc,
        Err(e) => return fail_init(state, &e),
    };
    let compiler = match dxc.create_compiler() {
        Ok(compiler) => compiler,
        Err(e) => return fail_init(state, &e),
    };
    let library = match dxc.create_library() {
        Ok(library) => library,
        Err(e) => return fail_init(state, &e),
    };

    // The 4 register classes replicated over every descriptor space.
    let mut shift_args = Vec::new();
    if options.platform == Platform::Spirv && !options.no_reg_shifts {
        for (flag, base) in options.register_shift_classes() {
            for space in 0..SPIRV_SPACES {
                shift_args.push(flag.to_string());
                shift_args.push(base.to_string());
                shift_args.push(space.to_string());
            }
        }
    }

    while let Some(task) = state.next_task() {
        compile_task(state, &compiler, &library, &shift_args, &task);
    }
}

fn build_args(options: &Options, task: &Task, shift_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(16 + shift_args.len());

    args.push(OPTIMIZATION_ARGS[task.optimization_level.min(3) as usize].to_string());

    if options.shader_model_index >= 62 {
        args.push("-enable-16bit-types".to_string());
    }
    if options.warnings_are_errors {
        args.push("-WX".to_string());
    }
    if options.all_resources_bound {
        args.push("-all_resources_bound".to_string());
    }
    if options.matrix_row_major {
        args.push("-Zpr".to_string());
    }
    if options.hlsl_2021 {
        args.push("-HV".to_string());
        args.push("2021".to_string());
    }
    if options.pdb || options.embed_pdb {
        args.push("-Zi".to_string());
        args.push("-Zsb".to_string()); // only binary code affects the hash
    }
    if options.embed_pdb {
        args.push("-Qembed_debug".to_string());
    }

    for dir in &options.include_dirs {
        args.push("-I".to_string());
        args.push(dir.display().to_string());
    }

    if options.platform == Platform::Spirv {
        args.push("-spirv".to_string());
        args.push(format!("-fspv-target-env=vulkan{}", options.vulkan_version));
        if let Some(layout) = options.vulkan_memory_layout {
            args.push(format!("-fvk-use-{}-layout", layout.name()));
        }
        for extension in &options.spirv_extensions {
            args.push(format!("-fspv-extension={}", extension));
        }
        args.extend(shift_args.iter().cloned());
    } else if options.strip_reflection {
        args.push("-Qstrip_reflect".to_string());
    }

    args
}

fn split_define(define: &str) -> (&str, Option<&str>) {
    match define.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (define, None),
    }
}

fn error_text(library: &DxcLibrary, result: &DxcOperationResult) -> String {
    result
        .get_error_buffer()
        .ok()
        .and_then(|buffer| library.get_blob_as_string(&buffer.into()).ok())
        .unwrap_or_default()
}

fn write_pdb(task: &Task, name: &str, pdb: DxcBlob) -> std::io::Result<()> {
    let file = task.output_path.parent().unwrap_or(Path::new("")).join(PDB_DIR).join(name);
    fs::write(file, pdb.to_vec())
}

fn compile_task(
    state: &BuildState,
    compiler: &DxcCompiler,
    library: &DxcLibrary,
    shift_args: &[String],
    task: &Task,
) {
    let options = state.options;
    let source_file = options.source_file(&task.source);

    let source = match fs::read_to_string(&source_file) {
        Ok(source) => source,
        Err(e) => {
            let diagnostics = format!("can't open file '{}': {}", source_file.display(), e);
            return update_progress(state, task, TaskOutcome::Failed { diagnostics: &diagnostics });
        }
    };
    let source_blob = match library.create_blob_with_encoding_from_str(&source) {
        Ok(blob) => blob,
        Err(e) => {
            let diagnostics = format!("can't create a source blob: {}", e);
            return update_progress(state, task, TaskOutcome::Failed { diagnostics: &diagnostics });
        }
    };

    let profile = options.profile_string(&task.profile);
    let args = build_args(options, task, shift_args);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let defines: Vec<(&str, Option<&str>)> = options
        .defines
        .iter()
        .chain(&task.defines)
        .map(|define| split_define(define))
        .collect();

    let mut include_handler = IncludeHandler::new(&source_file, options);
    let source_name = source_file.display().to_string();

    let compiled = if options.pdb {
        compiler
            .compile_with_debug(
                &source_blob,
                &source_name,
                &task.entry_point,
                &profile,
                &arg_refs,
                Some(&mut include_handler),
                &defines,
            )
            .map(|(result, pdb_name, pdb)| (result, Some((pdb_name, pdb))))
    } else {
        compiler
            .compile(
                &source_blob,
                &source_name,
                &task.entry_point,
                &profile,
                &arg_refs,
                Some(&mut include_handler),
                &defines,
            )
            .map(|result| (result, None))
    };

    match compiled {
        Ok((result, pdb)) => {
            if state.terminated() {
                return;
            }
            if let Some((pdb_name, pdb_blob)) = pdb {
                if let Err(e) = write_pdb(task, &pdb_name, pdb_blob) {
                    let diagnostics = format!("can't write PDB '{}': {}", pdb_name, e);
                    return update_progress(
                        state,
                        task,
                        TaskOutcome::Failed { diagnostics: &diagnostics },
                    );
                }
            }
            let code: Vec<u8> = match result.get_result() {
                Ok(blob) => blob.to_vec(),
                Err(e) => {
                    let diagnostics = format!("can't fetch the compiled blob: {}", e);
                    return update_progress(
                        state,
                        task,
                        TaskOutcome::Failed { diagnostics: &diagnostics },
                    );
                }
            };
            if let Err(e) = dump_output(options, task, &code) {
                let diagnostics = format!("can't write outputs: {}", e);
                return update_progress(state, task, TaskOutcome::Failed { diagnostics: &diagnostics });
            }
            let warnings = error_text(library, &result);
            let warnings = warnings.trim();
            update_progress(
                state,
                task,
                TaskOutcome::Success { warnings: (!warnings.is_empty()).then_some(warnings) },
            );
        }
        Err((result, _status)) => {
            let diagnostics = error_text(library, &result);
            update_progress(state, task, TaskOutcome::Failed { diagnostics: diagnostics.trim() });
        }
    }
}
