/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Build engine of the `shadersmith` driver: config parsing and permutation
//! expansion, include-aware freshness, the worker pool with its three
//! compilation backends, and blob assembly. The binary in `main.rs` only
//! wires these together.

pub mod blobs;
pub mod config;
pub mod options;
pub mod output;
pub mod plan;
pub mod process;
pub mod worker;

#[cfg(windows)]
pub mod dxc;
#[cfg(windows)]
pub mod fxc;

#[cfg(test)]
mod tests;
