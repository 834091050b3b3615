/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime};

use clap::Parser;

use crate::config::{ConfigLine, LineFilter, expand_braces, tokenize_config_line, trim_config_line};
use crate::options::Options;
use crate::output::{dump_output, header_symbol, write_header_file};
use crate::plan::{self, BlobEntry, Task, permutation_hash, strip_leading_dotdots};
use crate::process::{compiler_command_line, slang_command_line};
use crate::worker::BuildState;
use crate::{blobs, options};

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn set_mtime(&self, name: &str, time: SystemTime) {
        let file = fs::OpenOptions::new().write(true).open(self.path(name)).unwrap();
        file.set_modified(time).unwrap();
    }

    /// Parsed and finalized options over this fixture's config/out/compiler
    /// paths; `extra` supplies at least one output form.
    fn options(&self, platform: &str, extra: &[&str]) -> Options {
        let compiler = self.path("dxc");
        if !compiler.exists() {
            fs::write(&compiler, "").unwrap();
        }
        let config = self.path("shaders.cfg");
        let out = self.path("out");

        let mut args: Vec<String> = vec![
            "shadersmith".into(),
            "-p".into(),
            platform.into(),
            "-c".into(),
            config.to_str().unwrap().into(),
            "-o".into(),
            out.to_str().unwrap().into(),
            "--compiler".into(),
            compiler.to_str().unwrap().into(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));

        let mut options = Options::try_parse_from(args).unwrap();
        options.finalize().unwrap();
        options
    }
}

fn hour() -> Duration {
    Duration::from_secs(3600)
}

// ---------------------------------------------------------------------------
// Config syntax
// ---------------------------------------------------------------------------

#[test]
pub fn trim_collapses_whitespace() {
    assert_eq!(trim_config_line("  a\t\tb   c  "), "a b c");
    assert_eq!(trim_config_line("\t"), "");
    assert_eq!(trim_config_line("plain"), "plain");
}

#[test]
pub fn tokenize_respects_quotes() {
    assert_eq!(
        tokenize_config_line(r#"a.hlsl -o "dir with spaces" -T ps"#),
        vec!["a.hlsl", "-o", "dir with spaces", "-T", "ps"]
    );
    assert_eq!(tokenize_config_line(""), Vec::<String>::new());
}

#[test]
pub fn braces_expand_to_cartesian_product() {
    let mut expanded = Vec::new();
    expand_braces("s -D A={1,2} -D B={x,y,z}", &mut expanded).unwrap();
    assert_eq!(
        expanded,
        vec![
            "s -D A=1 -D B=x",
            "s -D A=1 -D B=y",
            "s -D A=1 -D B=z",
            "s -D A=2 -D B=x",
            "s -D A=2 -D B=y",
            "s -D A=2 -D B=z",
        ]
    );
}

#[test]
pub fn brace_without_line_passes_through() {
    let mut expanded = Vec::new();
    expand_braces("plain line", &mut expanded).unwrap();
    assert_eq!(expanded, vec!["plain line"]);
}

#[test]
pub fn unbalanced_brace_is_an_error() {
    let mut expanded = Vec::new();
    assert!(expand_braces("s -D A={1,2", &mut expanded).is_err());
}

#[test]
pub fn preprocessor_gates_lines() {
    let defines = vec!["FOO".to_string()];
    let mut filter = LineFilter::new();

    assert_eq!(filter.filter("a.hlsl -T ps", &defines), Ok(true));

    assert_eq!(filter.filter("#if 0", &defines), Ok(false));
    assert_eq!(filter.filter("dead.hlsl -T ps", &defines), Ok(false));
    assert_eq!(filter.filter("#else", &defines), Ok(false));
    assert_eq!(filter.filter("alive.hlsl -T ps", &defines), Ok(true));
    assert_eq!(filter.filter("#endif", &defines), Ok(false));

    assert_eq!(filter.filter("#ifdef FOO", &defines), Ok(false));
    assert_eq!(filter.filter("x", &defines), Ok(true));
    // Nested state ANDs with the parent.
    assert_eq!(filter.filter("#ifdef BAR", &defines), Ok(false));
    assert_eq!(filter.filter("y", &defines), Ok(false));
    // Inverting a false block under a false parent stays false.
    assert_eq!(filter.filter("#endif", &defines), Ok(false));
    assert_eq!(filter.filter("#endif", &defines), Ok(false));
}

#[test]
pub fn ifdef_matches_the_define_verbatim() {
    // 'FOO=1' does not satisfy '#ifdef FOO'; the comparison is textual.
    let defines = vec!["FOO=1".to_string()];
    let mut filter = LineFilter::new();
    assert_eq!(filter.filter("#ifdef FOO", &defines), Ok(false));
    assert_eq!(filter.filter("x", &defines), Ok(false));
}

#[test]
pub fn stray_directives_are_diagnosed() {
    let defines = Vec::new();
    let mut filter = LineFilter::new();
    assert!(filter.filter("#endif", &defines).is_err());
    assert!(filter.filter("#else", &defines).is_err());
    // The stack survives the diagnostics.
    assert_eq!(filter.filter("a", &defines), Ok(true));
}

#[test]
pub fn config_line_defaults() {
    let tokens = tokenize_config_line("a.hlsl -T ps");
    let line = ConfigLine::parse_tokens(&tokens).unwrap();
    assert_eq!(line.source, PathBuf::from("a.hlsl"));
    assert_eq!(line.profile, "ps");
    assert_eq!(line.entry_point, "main");
    assert_eq!(line.output_dir, None);
    assert_eq!(line.optimization, None);
    assert!(line.defines.is_empty());
}

#[test]
pub fn config_line_full() {
    let tokens = tokenize_config_line("a.hlsl -T cs -E blur -O 1 -o sub -D X=1 -D Y");
    let line = ConfigLine::parse_tokens(&tokens).unwrap();
    assert_eq!(line.entry_point, "blur");
    assert_eq!(line.optimization, Some(1));
    assert_eq!(line.output_dir, Some(PathBuf::from("sub")));
    assert_eq!(line.defines, vec!["X=1", "Y"]);
}

#[test]
pub fn config_line_rejects_garbage() {
    let stray = tokenize_config_line("a.hlsl stray -T ps");
    assert!(ConfigLine::parse_tokens(&stray).is_err());
    let no_profile = tokenize_config_line("a.hlsl");
    assert!(ConfigLine::parse_tokens(&no_profile).is_err());
}

// ---------------------------------------------------------------------------
// Names and hashes
// ---------------------------------------------------------------------------

#[test]
pub fn permutation_hashes_are_stable_and_distinct() {
    let hashes: Vec<u32> =
        ["MODE=0", "MODE=1", "MODE=2", ""].iter().map(|d| permutation_hash(d)).collect();
    for (i, a) in hashes.iter().enumerate() {
        assert_eq!(*a, permutation_hash(["MODE=0", "MODE=1", "MODE=2", ""][i]));
        for b in &hashes[i + 1..] {
            assert_ne!(a, b);
        }
    }
    assert_eq!(format!("{:08X}", permutation_hash("MODE=0")).len(), 8);
}

#[test]
pub fn leading_dotdots_are_stripped() {
    assert_eq!(strip_leading_dotdots(&PathBuf::from("../../x/y.hlsl")), PathBuf::from("x/y.hlsl"));
    assert_eq!(strip_leading_dotdots(&PathBuf::from("x/../y.hlsl")), PathBuf::from("x/../y.hlsl"));
}

#[test]
pub fn header_symbols_flatten_dots() {
    assert_eq!(header_symbol(&PathBuf::from("out/blit.vs"), ".dxil"), "g_blit_vs_dxil");
    assert_eq!(header_symbol(&PathBuf::from("x"), ".spirv"), "g_x_spirv");
}

// ---------------------------------------------------------------------------
// Header emission
// ---------------------------------------------------------------------------

#[test]
pub fn header_file_layout() {
    let fx = Fixture::new();
    let file = fx.path("small.h");
    write_header_file(&file, "g_t_dxil", &[0, 1, 2]).unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "const uint8_t g_t_dxil[] = {\n    0, 1, 2, \n};\n");
}

#[test]
pub fn header_bytes_round_trip_with_wrapping() {
    let fx = Fixture::new();
    let data: Vec<u8> = (0..=255).cycle().take(600).map(|b| b as u8).collect();
    let file = fx.path("big.h");
    write_header_file(&file, "g_big_dxil", &data).unwrap();

    let text = fs::read_to_string(&file).unwrap();
    assert!(text.starts_with("const uint8_t g_big_dxil[] = {\n"));
    assert!(text.ends_with("\n};\n"));

    let body = &text["const uint8_t g_big_dxil[] = {".len()..text.len() - "\n};\n".len()];
    let decoded: Vec<u8> = body
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| token.parse().unwrap())
        .collect();
    assert_eq!(decoded, data);

    for line in body.lines().filter(|line| !line.is_empty()) {
        // 128-column limit, plus the indent and one last 5-wide entry.
        assert!(line.len() <= 137, "overlong line: {:?}", line);
    }
}

#[test]
pub fn dump_output_writes_requested_forms() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binary", "--header"]);
    fs::create_dir_all(fx.path("out")).unwrap();

    let task = Task {
        source: PathBuf::from("x.hlsl"),
        entry_point: "main".into(),
        profile: "ps".into(),
        output_path: fx.path("out/x"),
        combined_defines: String::new(),
        defines: Vec::new(),
        optimization_level: 3,
    };
    dump_output(&options, &task, &[1, 2, 3]).unwrap();

    assert_eq!(fs::read(fx.path("out/x.dxil")).unwrap(), vec![1, 2, 3]);
    let header = fs::read_to_string(fx.path("out/x.dxil.h")).unwrap();
    assert!(header.starts_with("const uint8_t g_x_dxil[] = {"));
}

#[test]
pub fn header_blob_without_defines_degenerates_to_a_header() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--headerBlob"]);
    fs::create_dir_all(fx.path("out")).unwrap();

    let task = Task {
        source: PathBuf::from("x.hlsl"),
        entry_point: "main".into(),
        profile: "ps".into(),
        output_path: fx.path("out/x"),
        combined_defines: String::new(),
        defines: Vec::new(),
        optimization_level: 3,
    };
    dump_output(&options, &task, &[9]).unwrap();

    assert!(!fx.path("out/x.dxil").exists());
    assert!(fx.path("out/x.dxil.h").exists());
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[test]
pub fn single_shader_plans_one_task() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    fx.write("a.hlsl", "float4 main() : SV_Target { return 0; }\n");
    fx.set_mtime("a.hlsl", SystemTime::now() - hour());

    let options = fx.options("DXIL", &["--binary"]);
    let plan = plan::plan(&options).unwrap();

    assert_eq!(plan.tasks.len(), 1);
    let task = &plan.tasks[0];
    assert_eq!(task.output_path, fx.path("out/a"));
    assert_eq!(task.profile, "ps");
    assert_eq!(task.entry_point, "main");
    assert_eq!(task.combined_defines, "");
    assert_eq!(task.optimization_level, 3);
    assert!(fx.path("out").is_dir());
}

#[test]
pub fn fresh_outputs_plan_nothing() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    fx.write("a.hlsl", "float4 main() : SV_Target { return 0; }\n");
    fx.set_mtime("a.hlsl", SystemTime::now() - hour());

    let options = fx.options("DXIL", &["--binary"]);
    assert_eq!(plan::plan(&options).unwrap().tasks.len(), 1);

    fx.write("out/a.dxil", "bytecode");
    fx.set_mtime("out/a.dxil", SystemTime::now() + hour());
    assert_eq!(plan::plan(&options).unwrap().tasks.len(), 0);

    // --force re-plans regardless.
    let forced = fx.options("DXIL", &["--binary", "-f"]);
    assert_eq!(plan::plan(&forced).unwrap().tasks.len(), 1);
}

#[test]
pub fn touched_include_triggers_a_rebuild_unless_relaxed() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    fx.write("a.hlsl", "#include \"log.hlsli\"\nfloat4 main() : SV_Target { return 0; }\n");
    fx.write("log.hlsli", "// logging helpers\n");
    fx.write("out/a.dxil", "bytecode");

    fx.set_mtime("a.hlsl", SystemTime::now() - hour());
    fx.set_mtime("out/a.dxil", SystemTime::now() + hour());
    fx.set_mtime("log.hlsli", SystemTime::now() + 2 * hour());

    let options = fx.options("DXIL", &["--binary"]);
    assert_eq!(plan::plan(&options).unwrap().tasks.len(), 1);

    let relaxed = fx.options("DXIL", &["--binary", "--relaxedInclude", "log.hlsli"]);
    assert_eq!(plan::plan(&relaxed).unwrap().tasks.len(), 0);
}

#[test]
pub fn includes_resolve_through_include_dirs() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    fx.write("a.hlsl", "#include <common.hlsli>\nfloat4 main() : SV_Target { return 0; }\n");
    fx.write("inc/common.hlsli", "#define COMMON 1\n");
    fx.write("out/a.dxil", "bytecode");
    fx.set_mtime("out/a.dxil", SystemTime::now() + hour());

    // Relative include dirs are resolved against the config file's parent;
    // with them the hierarchy walk succeeds and finds the output fresh.
    let options = fx.options("DXIL", &["--binary", "-I", "inc"]);
    assert_eq!(plan::plan(&options).unwrap().tasks.len(), 0);

    let unresolvable = fx.options("DXIL", &["--binary"]);
    assert!(plan::plan(&unresolvable).is_err());
}

#[test]
pub fn missing_include_is_fatal_with_context() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    fx.write("a.hlsl", "#include \"nope.hlsli\"\n");
    fx.write("out/a.dxil", "bytecode");
    fx.set_mtime("out/a.dxil", SystemTime::now() + hour());

    let options = fx.options("DXIL", &["--binary"]);
    let error = format!("{:#}", plan::plan(&options).unwrap_err());
    assert!(error.contains("nope.hlsli"));
    assert!(error.contains("included in"));
    assert!(error.contains("a.hlsl"));
}

#[test]
pub fn brace_permutations_become_tasks_and_one_blob_group() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "b.hlsl -T cs -D MODE={0,1,2}\n");
    fx.write("b.hlsl", "[numthreads(1,1,1)] void main() {}\n");
    fx.set_mtime("b.hlsl", SystemTime::now() - hour());

    let options = fx.options("DXIL", &["--binaryBlob"]);
    let plan = plan::plan(&options).unwrap();

    assert_eq!(plan.tasks.len(), 3);
    let mut outputs: Vec<_> = plan.tasks.iter().map(|t| t.output_path.clone()).collect();
    outputs.sort();
    outputs.dedup();
    assert_eq!(outputs.len(), 3, "permutation hashes must keep outputs distinct");

    assert_eq!(plan.blobs.len(), 1);
    let entries = &plan.blobs[&fx.path("out/b")];
    let defines: Vec<_> = entries.iter().map(|e| e.defines.as_str()).collect();
    assert_eq!(defines, vec!["MODE=0", "MODE=1", "MODE=2"]);
}

#[test]
pub fn blob_registration_covers_up_to_date_tasks() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "b.hlsl -T cs -D MODE={0,1,2}\n");
    fx.write("b.hlsl", "[numthreads(1,1,1)] void main() {}\n");
    fx.write("out/b.dxil", "blob");
    fx.set_mtime("b.hlsl", SystemTime::now() - hour());
    fx.set_mtime("out/b.dxil", SystemTime::now() + hour());

    let options = fx.options("DXIL", &["--binaryBlob"]);
    let plan = plan::plan(&options).unwrap();

    assert_eq!(plan.tasks.len(), 0);
    assert_eq!(plan.blobs[&fx.path("out/b")].len(), 3);
}

#[test]
pub fn preprocessor_gates_config_lines() {
    let fx = Fixture::new();
    fx.write(
        "shaders.cfg",
        "#if 0\nskipped.hlsl -T ps\n#endif\n#ifdef FOO\nf.hlsl -T ps\n#endif\na.hlsl -T ps\n",
    );
    fx.write("a.hlsl", "float4 main() : SV_Target { return 0; }\n");
    fx.write("f.hlsl", "float4 main() : SV_Target { return 1; }\n");

    let options = fx.options("DXIL", &["--binary"]);
    assert_eq!(plan::plan(&options).unwrap().tasks.len(), 1);

    let with_foo = fx.options("DXIL", &["--binary", "-D", "FOO"]);
    assert_eq!(plan::plan(&with_foo).unwrap().tasks.len(), 2);
}

#[test]
pub fn dxbc_skips_unsupported_profiles() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "r.hlsl -T lib\n");
    fx.write("r.hlsl", "// raytracing\n");

    let options = fx.options("DXBC", &["--binary"]);
    assert_eq!(plan::plan(&options).unwrap().tasks.len(), 0);
}

#[test]
pub fn entry_points_and_subdirs_shape_output_names() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps -E blur\nsub/c.hlsl -T vs -o nested\n");
    fx.write("a.hlsl", "float4 blur() : SV_Target { return 0; }\n");
    fx.write("sub/c.hlsl", "float4 main() : SV_Position { return 0; }\n");

    let options = fx.options("DXIL", &["--binary"]);
    let plan = plan::plan(&options).unwrap();
    let outputs: Vec<_> = plan.tasks.iter().map(|t| t.output_path.clone()).collect();

    assert!(outputs.contains(&fx.path("out/a_blur")));
    // A per-line output dir flattens the source path to its file name.
    assert!(outputs.contains(&fx.path("out/nested/c")));
}

#[test]
pub fn flatten_drops_source_directories() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "sub/c.hlsl -T vs\n");
    fx.write("sub/c.hlsl", "float4 main() : SV_Position { return 0; }\n");

    let options = fx.options("DXIL", &["--binary", "--flatten"]);
    let plan = plan::plan(&options).unwrap();
    assert_eq!(plan.tasks[0].output_path, fx.path("out/c"));
}

// ---------------------------------------------------------------------------
// Command lines
// ---------------------------------------------------------------------------

fn single_task(fx: &Fixture, options: &Options) -> Task {
    fx.write("a.hlsl", "float4 main() : SV_Target { return 0; }\n");
    let plan = plan::plan(options).unwrap();
    plan.tasks.into_iter().next().unwrap()
}

#[test]
pub fn dxc_command_line_shape() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    let options = fx.options("DXIL", &["--binary"]);
    let task = single_task(&fx, &options);

    let cmd = compiler_command_line(&options, &task);
    assert!(cmd.contains(" -nologo"));
    assert!(cmd.contains(" -Fo "));
    assert!(!cmd.contains(" -Fh "));
    assert!(cmd.contains(" -T ps_6_5"));
    assert!(cmd.contains(" -E main"));
    assert!(cmd.contains(" -O3"));
    assert!(cmd.ends_with(&format!(" {}", fx.path("a.hlsl").display())));
}

#[test]
pub fn dxbc_pins_the_shader_model() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    let options = fx.options("DXBC", &["--binary"]);
    let task = single_task(&fx, &options);

    assert!(compiler_command_line(&options, &task).contains(" -T ps_5_0"));
}

#[test]
pub fn sixteen_bit_types_follow_the_shader_model() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");

    let new_model = fx.options("DXIL", &["--binary", "-m", "6_7"]);
    let task = single_task(&fx, &new_model);
    assert!(compiler_command_line(&new_model, &task).contains("-enable-16bit-types"));

    let old_model = fx.options("DXIL", &["--binary", "-m", "6_0"]);
    assert!(!compiler_command_line(&old_model, &task).contains("-enable-16bit-types"));
}

#[test]
pub fn spirv_command_line_carries_shifts_and_extensions() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    let options = fx.options("SPIRV", &["--binary", "--vulkanMemoryLayout", "scalar"]);
    let task = single_task(&fx, &options);

    let cmd = compiler_command_line(&options, &task);
    assert!(cmd.contains(" -spirv"));
    assert!(cmd.contains(" -fspv-target-env=vulkan1.3"));
    assert!(cmd.contains(" -fvk-use-scalar-layout"));
    assert!(cmd.contains(" -fspv-extension=SPV_EXT_descriptor_indexing"));
    assert!(cmd.contains(" -fspv-extension=KHR"));
    for class in ["s", "t", "b", "u"] {
        assert_eq!(cmd.matches(&format!(" -fvk-{}-shift ", class)).count(), 8);
    }
    assert!(cmd.contains(" -fvk-s-shift 100 0"));
    assert!(cmd.contains(" -fvk-u-shift 400 7"));
}

#[test]
pub fn no_reg_shifts_suppresses_the_table() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    let options = fx.options("SPIRV", &["--binary", "--noRegShifts"]);
    let task = single_task(&fx, &options);

    assert!(!compiler_command_line(&options, &task).contains("-fvk-s-shift"));
}

#[test]
pub fn slang_command_line_shape() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    let options = fx.options("DXIL", &["--binary", "--slang"]);
    let task = single_task(&fx, &options);

    let cmd = slang_command_line(&options, &task);
    assert!(cmd.contains(" -profile ps_6_5"));
    assert!(cmd.contains(" -target dxil"));
    assert!(cmd.contains(" -o "));
    assert!(cmd.contains(" -entry main"));
    assert!(cmd.contains(" -O3"));
    assert!(cmd.contains(" -matrix-layout-column-major"));
    assert!(cmd.ends_with(&format!(" {}", fx.path("a.hlsl").display())));
}

#[test]
pub fn header_output_maps_to_fh_and_vn() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "a.hlsl -T ps\n");
    let options = fx.options("DXIL", &["--header"]);
    let task = single_task(&fx, &options);

    let cmd = compiler_command_line(&options, &task);
    assert!(!cmd.contains(" -Fo "));
    assert!(cmd.contains(" -Fh "));
    assert!(cmd.contains(" -Vn g_a_dxil"));
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

#[test]
pub fn retry_budget_is_decremented_and_bounded() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binary", "--retryCount", "2"]);

    let task = Task {
        source: PathBuf::from("a.hlsl"),
        entry_point: "main".into(),
        profile: "ps".into(),
        output_path: fx.path("out/a"),
        combined_defines: String::new(),
        defines: Vec::new(),
        optimization_level: 3,
    };

    let state = BuildState::new(&options, Vec::new(), Arc::new(AtomicBool::new(false)));
    assert!(state.requeue_for_retry(&task));
    assert!(state.requeue_for_retry(&task));
    assert!(!state.requeue_for_retry(&task), "exhausted budget reclassifies as hard failure");
    assert_eq!(state.queue.lock().unwrap().tasks.len(), 2);
}

#[test]
pub fn queue_drains_lifo_and_respects_terminate() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binary"]);

    let task = |name: &str| Task {
        source: PathBuf::from(name),
        entry_point: "main".into(),
        profile: "ps".into(),
        output_path: fx.path(name),
        combined_defines: String::new(),
        defines: Vec::new(),
        optimization_level: 3,
    };

    let terminate = Arc::new(AtomicBool::new(false));
    let state = BuildState::new(&options, vec![task("first"), task("second")], terminate.clone());

    assert_eq!(state.next_task().unwrap().source, PathBuf::from("second"));
    terminate.store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(state.next_task().is_none(), "cancellation wins over remaining work");
}

// ---------------------------------------------------------------------------
// Blob assembly
// ---------------------------------------------------------------------------

fn blob_group(fx: &Fixture, entries: &[(&str, &str, &[u8])]) -> BTreeMap<PathBuf, Vec<BlobEntry>> {
    fs::create_dir_all(fx.path("out")).unwrap();
    let mut group = Vec::new();
    for (name, defines, data) in entries {
        if !data.is_empty() {
            fs::write(fx.path(&format!("out/{}.dxil", name)), data).unwrap();
        }
        group.push(BlobEntry {
            permutation_path: fx.path(&format!("out/{}", name)),
            defines: defines.to_string(),
        });
    }
    BTreeMap::from([(fx.path("out/b"), group)])
}

#[test]
pub fn binary_blob_round_trips_and_cleans_intermediates() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binaryBlob"]);
    let groups = blob_group(&fx, &[("b_0", "MODE=0", b"one"), ("b_1", "MODE=1", b"two")]);

    assert_eq!(blobs::assemble_blobs(&options, &groups), 0);

    let data: Vec<u8> = fs::read(fx.path("out/b.dxil")).unwrap();
    assert!(data.starts_with(&blob::BLOB_SIGNATURE));
    let entries = blob::enumerate_permutations(&data).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].defines, "MODE=0");
    assert_eq!(entries[0].data, b"one");
    assert_eq!(blob::find_permutation(&data, "MODE=1").unwrap(), Some(&b"two"[..]));

    // Without --binary the per-permutation files are only blob inputs.
    assert!(!fx.path("out/b_0.dxil").exists());
    assert!(!fx.path("out/b_1.dxil").exists());
}

#[test]
pub fn binary_flag_keeps_intermediates() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binary", "--binaryBlob"]);
    let groups = blob_group(&fx, &[("b_0", "MODE=0", b"one"), ("b_1", "MODE=1", b"two")]);

    assert_eq!(blobs::assemble_blobs(&options, &groups), 0);
    assert!(fx.path("out/b_0.dxil").exists());
    assert!(fx.path("out/b_1.dxil").exists());
}

#[test]
pub fn header_blob_is_a_decodable_c_array() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--headerBlob"]);
    let groups = blob_group(&fx, &[("b_0", "MODE=0", b"one"), ("b_1", "MODE=1", b"two")]);

    assert_eq!(blobs::assemble_blobs(&options, &groups), 0);

    let text = fs::read_to_string(fx.path("out/b.dxil.h")).unwrap();
    assert!(text.starts_with("const uint8_t g_b_dxil[] = {"));
    assert!(text.ends_with("\n};\n"));

    let body = &text["const uint8_t g_b_dxil[] = {".len()..text.len() - "\n};\n".len()];
    let bytes: Vec<u8> = body
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| token.parse().unwrap())
        .collect();
    let entries = blob::enumerate_permutations(&bytes).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].defines, "MODE=1");
    assert_eq!(entries[1].data, b"two");
}

#[test]
pub fn degenerate_single_permutation_blob_is_skipped() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binaryBlob"]);
    let groups = blob_group(&fx, &[("b", "", b"only")]);

    assert_eq!(blobs::assemble_blobs(&options, &groups), 0);
    // The permutation file *is* the would-be blob path; it must survive.
    assert_eq!(fs::read(fx.path("out/b.dxil")).unwrap(), b"only");
}

#[test]
pub fn aliasing_permutation_fails_the_group() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("DXIL", &["--binaryBlob", "--continue"]);
    let groups = blob_group(&fx, &[("b", "", b"plain" as &[u8]), ("b_1", "MODE=1", b"two")]);

    assert_eq!(blobs::assemble_blobs(&options, &groups), 1);
}

#[test]
pub fn options_validation_catches_bad_input() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let compiler = fx.write("dxc", "");

    let no_output_form = Options::try_parse_from([
        "shadersmith",
        "-p",
        "DXIL",
        "-c",
        fx.path("shaders.cfg").to_str().unwrap(),
        "-o",
        fx.path("out").to_str().unwrap(),
        "--compiler",
        compiler.to_str().unwrap(),
    ]);
    assert!(no_output_form.unwrap().finalize().is_err());

    let bad_model = Options::try_parse_from([
        "shadersmith",
        "-p",
        "DXIL",
        "-c",
        fx.path("shaders.cfg").to_str().unwrap(),
        "-o",
        fx.path("out").to_str().unwrap(),
        "--compiler",
        compiler.to_str().unwrap(),
        "--binary",
        "-m",
        "6.5",
    ]);
    assert!(bad_model.unwrap().finalize().is_err());
}

#[test]
pub fn spirv_extension_defaults_are_kept_alongside_user_entries() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let options = fx.options("SPIRV", &["--binary", "--spirvExt", "SPV_KHR_ray_tracing"]);
    assert_eq!(
        options.spirv_extensions,
        vec!["SPV_EXT_descriptor_indexing", "KHR", "SPV_KHR_ray_tracing"]
    );
}

#[test]
pub fn profile_strings_follow_the_platform() {
    let fx = Fixture::new();
    fx.write("shaders.cfg", "");
    let dxil = fx.options("DXIL", &["--binary"]);
    assert_eq!(dxil.profile_string("cs"), "cs_6_5");
    let dxbc = fx.options("DXBC", &["--binary"]);
    assert_eq!(dxbc.profile_string("cs"), "cs_5_0");
}

#[test]
pub fn pdb_directory_name_is_part_of_the_contract() {
    assert_eq!(options::PDB_DIR, "PDB");
}
