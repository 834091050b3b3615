/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! Orchestrator: options, signal handling, compiler environment, then
//! plan -> worker pool -> blob assembly -> summary.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use clap::Parser;
use colored::Colorize;

use shadersmith::options::Options;
use shadersmith::worker::{BuildState, run_pool, select_backend};
use shadersmith::{blobs, plan};

fn main() -> ExitCode {
    let start = Instant::now();

    let mut options = Options::parse();
    colored::control::set_override(options.colorize);

    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .try_init();

    if let Err(e) = options.finalize() {
        println!("{}", format!("ERROR: {:#}", e).red());
        return ExitCode::FAILURE;
    }

    let terminate = Arc::new(AtomicBool::new(false));
    {
        let terminate = terminate.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            terminate.store(true, Ordering::Relaxed);
            println!("{}", "Aborting...".yellow());
        }) {
            log::warn!("can't install the signal handler: {}", e);
        }
    }

    if !options.use_api {
        if let Some(compiler) = &options.compiler {
            // Command lines reference the compiler through %COMPILER% /
            // $COMPILER; quote it on Windows where the path may hold spaces.
            #[cfg(windows)]
            let value = format!("\"{}\"", compiler.display());
            #[cfg(not(windows))]
            let value = compiler.display().to_string();

            // No threads exist yet, mutating the environment is safe here.
            unsafe { std::env::set_var("COMPILER", &value) };

            if options.verbose {
                println!("COMPILER={}", value);
            }
        }
    }

    #[cfg(windows)]
    {
        use shadersmith::options::Platform;

        // Make the configured compiler's directory win the DLL search so
        // its dxcompiler/dxil pair is the one actually loaded.
        if options.platform != Platform::Dxbc {
            if let Some(dir) = options
                .compiler
                .as_ref()
                .and_then(|compiler| compiler.parent())
                .filter(|dir| !dir.as_os_str().is_empty())
            {
                if let Err(e) = shadersmith::fxc::add_dll_search_path(dir) {
                    log::warn!("{:#}", e);
                }
            }
        }

        if options.use_api {
            let preloaded = match options.platform {
                Platform::Dxbc => shadersmith::fxc::preload_d3dcompiler(),
                _ => shadersmith::dxc::preload(&options),
            };
            if let Err(e) = preloaded {
                println!("{}", format!("ERROR: {:#}", e).red());
                return ExitCode::FAILURE;
            }
        }
    }

    let plan = match plan::plan(&options) {
        Ok(plan) => plan,
        Err(e) => {
            println!("{}", format!("ERROR: {:#}", e).red());
            return ExitCode::FAILURE;
        }
    };

    if plan.tasks.is_empty() {
        println!("All {} shaders are up to date.", options.platform.name());
        return ExitCode::SUCCESS;
    }

    let total = plan.tasks.len() as u32;
    let state = BuildState::new(&options, plan.tasks, terminate);
    run_pool(&state, select_backend(&options));

    let mut failed = state.failed.load(Ordering::Relaxed);
    if !state.terminated() && failed == 0 && options.any_blob() {
        failed += blobs::assemble_blobs(&options, &plan.blobs);
    }

    if failed > 0 {
        println!("{}", format!("WARNING: {} task(s) failed to complete!", failed).yellow());
    } else {
        println!("{} task(s) completed successfully.", total);
    }
    println!("Elapsed time {:.2} ms\n", start.elapsed().as_secs_f64() * 1000.0);

    if state.terminated() || failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
