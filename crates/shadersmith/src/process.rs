/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! External-process backend: composes a FXC/DXC or Slang command line and
//! runs it through the platform shell, which expands the `COMPILER`
//! environment variable set by the orchestrator.
//!
//! A child that ran and failed is a hard compile error. A child that could
//! not be spawned at all (or a 127 from the shell) is transient: the task
//! goes back on the queue while the retry budget lasts.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::Context;

use crate::options::{Options, PDB_DIR, Platform, SPIRV_SPACES, VulkanMemoryLayout};
use crate::output::{append_ext, header_symbol, write_header_file};
use crate::plan::Task;
use crate::worker::{BuildState, TaskOutcome, update_progress};

#[cfg(windows)]
const COMPILER_VAR: &str = "%COMPILER%";
#[cfg(not(windows))]
const COMPILER_VAR: &str = "$COMPILER";

const OPTIMIZATION_ARGS: [&str; 4] = [" -Od", " -O1", " -O2", " -O3"];

enum Execution {
    Success(String),
    HardFailure(String),
    Transient,
}

pub fn run_worker(state: &BuildState) {
    while let Some(task) = state.next_task() {
        compile_task(state, &task);
    }
}

fn compile_task(state: &BuildState, task: &Task) {
    let options = state.options;

    let mut command = if options.slang {
        slang_command_line(options, task)
    } else {
        compiler_command_line(options, task)
    };
    command.push_str(" 2>&1");

    if options.verbose {
        println!("{}", command);
    }

    match execute(&command) {
        Execution::Success(text) => {
            if options.slang {
                if let Err(e) = convert_slang_outputs(options, task) {
                    let diagnostics = format!("{:#}", e);
                    update_progress(state, task, TaskOutcome::Failed { diagnostics: &diagnostics });
                    return;
                }
            }
            let warnings = text.trim();
            update_progress(
                state,
                task,
                TaskOutcome::Success { warnings: (!warnings.is_empty()).then_some(warnings) },
            );
        }
        Execution::HardFailure(text) => {
            update_progress(state, task, TaskOutcome::Failed { diagnostics: text.trim() });
        }
        Execution::Transient => {
            if state.requeue_for_retry(task) {
                update_progress(state, task, TaskOutcome::Requeued);
            } else {
                update_progress(
                    state,
                    task,
                    TaskOutcome::Failed {
                        diagnostics:
                            "the compiler process could not be started and the retry budget is exhausted",
                    },
                );
            }
        }
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut shell = Command::new("cmd");
        shell.arg("/C").arg(command);
        shell
    }
    #[cfg(not(windows))]
    {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command);
        shell
    }
}

fn execute(command: &str) -> Execution {
    let mut child = match shell_command(command).stdout(Stdio::piped()).spawn() {
        Ok(child) => child,
        Err(_) => return Execution::Transient,
    };

    let mut text = String::new();
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            // Unmutable FXC chatter, useless in diagnostics.
            if line.contains("compilation object save succeeded") {
                continue;
            }
            text.push_str(&line);
            text.push('\n');
        }
    }

    let status = match child.wait() {
        Ok(status) => status,
        Err(_) => return Execution::Transient,
    };

    if status.success() {
        return Execution::Success(text);
    }
    // The shell itself reports 127 when the compiler binary is not found.
    #[cfg(unix)]
    if status.code() == Some(127) {
        return Execution::Transient;
    }
    Execution::HardFailure(text)
}

fn push_register_shifts(cmd: &mut String, options: &Options) {
    for (flag, base) in options.register_shift_classes() {
        for space in 0..SPIRV_SPACES {
            cmd.push_str(&format!(" {} {} {}", flag, base, space));
        }
    }
}

/// FXC/DXC command line, in the option order the compilers document.
pub fn compiler_command_line(options: &Options, task: &Task) -> String {
    let mut cmd = String::with_capacity(1024);
    cmd.push_str(COMPILER_VAR);
    cmd.push_str(" -nologo");

    let defines_empty = task.defines.is_empty();
    let output_file = append_ext(&task.output_path, &options.output_ext);
    if options.binary_wanted(defines_empty) {
        cmd.push_str(&format!(" -Fo {}", output_file.display()));
    }
    if options.header_wanted(defines_empty) {
        cmd.push_str(&format!(
            " -Fh {}.h -Vn {}",
            output_file.display(),
            header_symbol(&task.output_path, &options.output_ext)
        ));
    }

    cmd.push_str(&format!(" -T {}", options.profile_string(&task.profile)));
    cmd.push_str(&format!(" -E {}", task.entry_point));

    for define in options.defines.iter().chain(&task.defines) {
        cmd.push_str(&format!(" -D {}", define));
    }
    for dir in &options.include_dirs {
        cmd.push_str(&format!(" -I {}", dir.display()));
    }

    cmd.push_str(OPTIMIZATION_ARGS[task.optimization_level.min(3) as usize]);

    if options.platform != Platform::Dxbc && options.shader_model_index >= 62 {
        cmd.push_str(" -enable-16bit-types");
    }
    if options.warnings_are_errors {
        cmd.push_str(" -WX");
    }
    if options.all_resources_bound {
        cmd.push_str(" -all_resources_bound");
    }
    if options.matrix_row_major {
        cmd.push_str(" -Zpr");
    }
    if options.hlsl_2021 {
        cmd.push_str(" -HV 2021");
    }
    if options.pdb || options.embed_pdb {
        cmd.push_str(" -Zi -Zsb"); // only binary code affects the hash
    }
    if options.embed_pdb {
        cmd.push_str(" -Qembed_debug");
    }

    if options.platform == Platform::Spirv {
        cmd.push_str(" -spirv");
        cmd.push_str(&format!(" -fspv-target-env=vulkan{}", options.vulkan_version));
        if let Some(layout) = options.vulkan_memory_layout {
            cmd.push_str(&format!(" -fvk-use-{}-layout", layout.name()));
        }
        for extension in &options.spirv_extensions {
            cmd.push_str(&format!(" -fspv-extension={}", extension));
        }
        if !options.no_reg_shifts {
            push_register_shifts(&mut cmd, options);
        }
    } else {
        // Not supported by the SPIR-V generator.
        if options.strip_reflection {
            cmd.push_str(" -Qstrip_reflect");
        }
        if options.pdb {
            let pdb_dir = task.output_path.parent().unwrap_or(Path::new("")).join(PDB_DIR);
            cmd.push_str(&format!(" -Fd {}/", pdb_dir.display()));
        }
    }

    cmd.push_str(&format!(" {}", options.source_file(&task.source).display()));
    cmd
}

/// Slang command line. Slang has no header emission, so header forms are
/// post-converted from the binary in [`convert_slang_outputs`].
pub fn slang_command_line(options: &Options, task: &Task) -> String {
    let mut cmd = String::with_capacity(1024);
    cmd.push_str(COMPILER_VAR);

    cmd.push_str(&format!(" -profile {}", options.profile_string(&task.profile)));
    cmd.push_str(&format!(" -target {}", options.platform.slang_target()));

    let output_file = append_ext(&task.output_path, &options.output_ext);
    cmd.push_str(&format!(" -o {}", output_file.display()));
    cmd.push_str(&format!(" -entry {}", task.entry_point));

    for define in options.defines.iter().chain(&task.defines) {
        cmd.push_str(&format!(" -D {}", define));
    }
    for dir in &options.include_dirs {
        cmd.push_str(&format!(" -I {}", dir.display()));
    }

    cmd.push_str(&format!(" -O{}", task.optimization_level.min(3)));

    if options.warnings_are_errors {
        cmd.push_str(" -warnings-as-errors");
    }
    cmd.push_str(if options.matrix_row_major {
        " -matrix-layout-row-major"
    } else {
        " -matrix-layout-column-major"
    });

    if options.platform == Platform::Spirv {
        match options.vulkan_memory_layout {
            Some(VulkanMemoryLayout::Scalar) => cmd.push_str(" -force-glsl-scalar-layout"),
            Some(VulkanMemoryLayout::Gl) => cmd.push_str(" -fvk-use-gl-layout"),
            _ => {}
        }
        if !options.no_reg_shifts {
            push_register_shifts(&mut cmd, options);
        }
    }

    cmd.push_str(&format!(" {}", options.source_file(&task.source).display()));
    cmd
}

/// Turns the binary Slang just wrote into the requested header form, and
/// drops the binary again when nothing else needs it.
fn convert_slang_outputs(options: &Options, task: &Task) -> anyhow::Result<()> {
    let defines_empty = task.defines.is_empty();
    if !options.header_wanted(defines_empty) {
        return Ok(());
    }

    let binary_file = append_ext(&task.output_path, &options.output_ext);
    let data = fs::read(&binary_file)
        .with_context(|| format!("can't read compiled binary '{}'", binary_file.display()))?;

    let header_file = append_ext(&binary_file, ".h");
    let symbol = header_symbol(&task.output_path, &options.output_ext);
    write_header_file(&header_file, &symbol, &data)
        .with_context(|| format!("can't write header '{}'", header_file.display()))?;

    if !options.binary_wanted(defines_empty) {
        fs::remove_file(&binary_file)
            .with_context(|| format!("can't remove intermediate '{}'", binary_file.display()))?;
    }
    Ok(())
}
