/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Command-line surface and global configuration.
//!
//! [`Options`] is parsed once at startup, validated and absolutized by
//! [`Options::finalize`], and never mutated afterwards; everything else in
//! the driver takes it by shared reference.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum Platform {
    Dxbc,
    Dxil,
    Spirv,
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Dxbc => "DXBC",
            Platform::Dxil => "DXIL",
            Platform::Spirv => "SPIRV",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Platform::Dxbc => ".dxbc",
            Platform::Dxil => ".dxil",
            Platform::Spirv => ".spirv",
        }
    }

    /// Target name understood by `slangc -target`.
    pub fn slang_target(&self) -> &'static str {
        match self {
            Platform::Dxbc => "dxbc",
            Platform::Dxil => "dxil",
            Platform::Spirv => "spirv",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum VulkanMemoryLayout {
    Dx,
    Gl,
    Scalar,
}

impl VulkanMemoryLayout {
    pub fn name(&self) -> &'static str {
        match self {
            VulkanMemoryLayout::Dx => "dx",
            VulkanMemoryLayout::Gl => "gl",
            VulkanMemoryLayout::Scalar => "scalar",
        }
    }
}

/// Number of descriptor spaces each SPIR-V register shift is replicated to.
pub const SPIRV_SPACES: u32 = 8;

/// Subdirectory of the output directory where PDB files land.
pub const PDB_DIR: &str = "PDB";

#[derive(Debug, Parser)]
#[command(
    name = "shadersmith",
    version,
    about = "Multi-threaded shader compiling & processing tool"
)]
pub struct Options {
    #[arg(short, long, help_heading = "Required options", help = "DXBC, DXIL or SPIRV")]
    pub platform: Platform,
    #[arg(
        short,
        long,
        help_heading = "Required options",
        help = "Configuration file with the list of shaders to compile"
    )]
    pub config: PathBuf,
    #[arg(short, long, help_heading = "Required options", help = "Output directory")]
    pub out: PathBuf,
    #[arg(long, help_heading = "Required options", help = "Output native binary files")]
    pub binary: bool,
    #[arg(long, help_heading = "Required options", help = "Output header files")]
    pub header: bool,
    #[arg(
        long = "binaryBlob",
        help_heading = "Required options",
        help = "Output binary blob files packing all permutations of a shader"
    )]
    pub binary_blob: bool,
    #[arg(
        long = "headerBlob",
        help_heading = "Required options",
        help = "Output header blob files packing all permutations of a shader"
    )]
    pub header_blob: bool,
    #[arg(
        long,
        help_heading = "Required options",
        help = "Path to a specific FXC/DXC/Slang compiler"
    )]
    pub compiler: Option<PathBuf>,

    #[arg(
        short = 'm',
        long = "shaderModel",
        default_value = "6_5",
        help_heading = "Compiler settings",
        help = "Shader model for DXIL/SPIRV in 'X_Y' form (always SM 5.0 for DXBC)"
    )]
    pub shader_model: String,
    #[arg(
        short = 'O',
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(0..=3),
        help_heading = "Compiler settings",
        help = "Optimization level 0-3 (default = 3, disabled = 0)"
    )]
    pub optimization: u32,
    #[arg(long = "WX", help_heading = "Compiler settings", help = "Warnings are errors")]
    pub warnings_are_errors: bool,
    #[arg(
        long = "allResourcesBound",
        help_heading = "Compiler settings",
        help = "Assume all resources are bound for the shader duration"
    )]
    pub all_resources_bound: bool,
    #[arg(
        long = "PDB",
        help_heading = "Compiler settings",
        help = "Output PDB files in an 'out/PDB/' folder"
    )]
    pub pdb: bool,
    #[arg(
        long = "embedPDB",
        help_heading = "Compiler settings",
        help = "Embed PDB with the shader binary"
    )]
    pub embed_pdb: bool,
    #[arg(
        long = "stripReflection",
        help_heading = "Compiler settings",
        help = "Strip reflection information from the shader binary"
    )]
    pub strip_reflection: bool,
    #[arg(
        long = "matrixRowMajor",
        help_heading = "Compiler settings",
        help = "Pack matrices in row-major order"
    )]
    pub matrix_row_major: bool,
    #[arg(long = "hlsl2021", help_heading = "Compiler settings", help = "Enable HLSL 2021")]
    pub hlsl_2021: bool,
    #[arg(
        long = "vulkanMemoryLayout",
        value_enum,
        help_heading = "Compiler settings",
        help = "Memory layout for Vulkan resources (SPIRV only)"
    )]
    pub vulkan_memory_layout: Option<VulkanMemoryLayout>,
    #[arg(
        long,
        help_heading = "Compiler settings",
        help = "Compile with Slang instead of FXC/DXC"
    )]
    pub slang: bool,

    #[arg(
        short = 'I',
        long = "include",
        help_heading = "Defines & include directories",
        help = "Include directory(s)"
    )]
    pub include_dirs: Vec<PathBuf>,
    #[arg(
        short = 'D',
        long = "define",
        help_heading = "Defines & include directories",
        help = "Macro definition(s) in forms 'M=value' or 'M'"
    )]
    pub defines: Vec<String>,

    #[arg(
        short,
        long,
        help_heading = "Other options",
        help = "Treat all source files as modified"
    )]
    pub force: bool,
    #[arg(
        long = "sourceDir",
        default_value = "",
        value_parser = clap::builder::ValueParser::new(|s: &str| -> Result<PathBuf, std::convert::Infallible> {
            Ok(PathBuf::from(s))
        }),
        help_heading = "Other options",
        help = "Source code directory, relative to the config file"
    )]
    pub source_dir: PathBuf,
    #[arg(
        long = "relaxedInclude",
        help_heading = "Other options",
        help = "Include file(s) not invoking re-compilation"
    )]
    pub relaxed_includes: Vec<PathBuf>,
    #[arg(
        long = "outputExt",
        help_heading = "Other options",
        help = "Extension for output files, default is one of .dxbc, .dxil, .spirv"
    )]
    pub output_ext_override: Option<String>,
    #[arg(long, help_heading = "Other options", help = "Disable multi-threading")]
    pub serial: bool,
    #[arg(
        long,
        help_heading = "Other options",
        help = "Flatten the source directory structure in the output directory"
    )]
    pub flatten: bool,
    #[arg(
        long = "continue",
        help_heading = "Other options",
        help = "Continue compilation if an error occurred"
    )]
    pub continue_on_error: bool,
    #[arg(
        long = "useAPI",
        help_heading = "Other options",
        help = "Use the FXC (d3dcompiler) or DXC (dxcompiler) API instead of a child process (Windows only)"
    )]
    pub use_api: bool,
    #[arg(long, help_heading = "Other options", help = "Colorize console output")]
    pub colorize: bool,
    #[arg(
        long,
        help_heading = "Other options",
        help = "Print commands before they are executed"
    )]
    pub verbose: bool,
    #[arg(
        long = "retryCount",
        default_value_t = 3,
        help_heading = "Other options",
        help = "Retry budget for transient child process failures"
    )]
    pub retry_count: u32,

    #[arg(
        long = "vulkanVersion",
        default_value = "1.3",
        help_heading = "SPIRV options",
        help = "Vulkan environment version (default = 1.3)"
    )]
    pub vulkan_version: String,
    #[arg(
        long = "spirvExt",
        help_heading = "SPIRV options",
        help = "Additional SPIR-V extension permitted in the output"
    )]
    pub spirv_extensions: Vec<String>,
    #[arg(
        long = "sRegShift",
        default_value_t = 100,
        help_heading = "SPIRV options",
        help = "Register shift for sampler (s#) resources"
    )]
    pub s_reg_shift: u32,
    #[arg(
        long = "tRegShift",
        default_value_t = 200,
        help_heading = "SPIRV options",
        help = "Register shift for texture (t#) resources"
    )]
    pub t_reg_shift: u32,
    #[arg(
        long = "bRegShift",
        default_value_t = 300,
        help_heading = "SPIRV options",
        help = "Register shift for constant (b#) resources"
    )]
    pub b_reg_shift: u32,
    #[arg(
        long = "uRegShift",
        default_value_t = 400,
        help_heading = "SPIRV options",
        help = "Register shift for UAV (u#) resources"
    )]
    pub u_reg_shift: u32,
    #[arg(
        long = "noRegShifts",
        help_heading = "SPIRV options",
        help = "Do not apply register shifts"
    )]
    pub no_reg_shifts: bool,

    /// Effective extension of compiled outputs, set by `finalize`.
    #[arg(skip)]
    pub output_ext: String,
    /// Shader model as two digits (e.g. 65), set by `finalize`.
    #[arg(skip)]
    pub shader_model_index: u32,
}

impl Options {
    /// Validates the parsed options and resolves everything path-like.
    /// The config path is absolutized against the working directory, include
    /// directories against the config file's parent.
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        if !self.binary && !self.header && !self.binary_blob && !self.header_blob {
            bail!("at least one of '--binary', '--header', '--binaryBlob' or '--headerBlob' must be set");
        }

        // The in-process compiler APIs only exist on Windows; everywhere else
        // the external compiler process is the single backend.
        #[cfg(not(windows))]
        if self.use_api {
            log::debug!("--useAPI is not available on this platform, falling back to the external compiler");
            self.use_api = false;
        }

        if !self.use_api {
            let Some(compiler) = &self.compiler else {
                bail!("compiler not specified");
            };
            if !compiler.exists() {
                bail!("compiler '{}' does not exist", compiler.display());
            }
        }

        let digits: Vec<char> = self.shader_model.chars().collect();
        if digits.len() != 3
            || !digits[0].is_ascii_digit()
            || digits[1] != '_'
            || !digits[2].is_ascii_digit()
        {
            bail!("shader model ('{}') must have the format 'X_Y'", self.shader_model);
        }
        self.shader_model_index =
            digits[0].to_digit(10).unwrap() * 10 + digits[2].to_digit(10).unwrap();

        if !self.config.exists() {
            bail!("config file '{}' does not exist", self.config.display());
        }

        // Absolute paths keep compiler diagnostics clickable in terminals
        // and IDEs regardless of where the driver was started from.
        let cwd = std::env::current_dir().context("cannot get the working directory")?;
        self.config = cwd.join(&self.config);

        let config_parent = self.config.parent().unwrap_or(Path::new("")).to_path_buf();
        for dir in &mut self.include_dirs {
            *dir = config_parent.join(&*dir);
        }

        self.output_ext = match &self.output_ext_override {
            Some(ext) => ext.clone(),
            None => self.platform.extension().to_string(),
        };

        // User extensions extend the always-permitted set.
        let mut extensions = vec!["SPV_EXT_descriptor_indexing".to_string(), "KHR".to_string()];
        extensions.append(&mut self.spirv_extensions);
        self.spirv_extensions = extensions;

        Ok(())
    }

    /// Resolves a config-relative shader path against the source root.
    pub fn source_file(&self, source: &Path) -> PathBuf {
        let parent = self.config.parent().unwrap_or(Path::new(""));
        parent.join(&self.source_dir).join(source)
    }

    pub fn any_blob(&self) -> bool {
        self.binary_blob || self.header_blob
    }

    /// Whether a task with the given defines emptiness must produce the raw
    /// binary file. Blob assembly reads permutation binaries back from disk,
    /// so any blob form forces the intermediate except for the degenerate
    /// no-defines header blob.
    pub fn binary_wanted(&self, defines_empty: bool) -> bool {
        self.binary || self.binary_blob || (self.header_blob && !defines_empty)
    }

    /// Whether a task with the given defines emptiness must produce the C
    /// header form directly.
    pub fn header_wanted(&self, defines_empty: bool) -> bool {
        self.header || (self.header_blob && defines_empty)
    }

    /// Full target string for a profile prefix; DXBC is pinned to SM 5.0.
    pub fn profile_string(&self, profile: &str) -> String {
        if self.platform == Platform::Dxbc {
            format!("{}_5_0", profile)
        } else {
            format!("{}_{}", profile, self.shader_model)
        }
    }

    /// The four Vulkan register-shift classes with their configured bases.
    pub fn register_shift_classes(&self) -> [(&'static str, u32); 4] {
        [
            ("-fvk-s-shift", self.s_reg_shift),
            ("-fvk-t-shift", self.t_reg_shift),
            ("-fvk-b-shift", self.b_reg_shift),
            ("-fvk-u-shift", self.u_reg_shift),
        ]
    }
}
