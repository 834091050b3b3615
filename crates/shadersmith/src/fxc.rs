/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! In-process FXC backend (Windows): drives `d3dcompiler_47.dll` for DXBC.
//!
//! `ID3DInclude` is not an IUnknown-style interface, so the include resolver
//! is a hand-laid COM object: a `#[repr(C)]` struct leading with its vtable
//! pointer. Open pushes the opened file's directory onto the search stack so
//! sub-includes resolve relative to the file currently being read; Close
//! pops it and releases the buffer, in LIFO order.

use std::ffi::{CStr, CString, c_void};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use windows::Win32::Foundation::{E_FAIL, S_OK};
use windows::Win32::Graphics::Direct3D::Fxc::{
    D3DCOMPILE_ALL_RESOURCES_BOUND, D3DCOMPILE_DEBUG, D3DCOMPILE_DEBUG_NAME_FOR_BINARY,
    D3DCOMPILE_OPTIMIZATION_LEVEL1, D3DCOMPILE_OPTIMIZATION_LEVEL2, D3DCOMPILE_OPTIMIZATION_LEVEL3,
    D3DCOMPILE_PACK_MATRIX_ROW_MAJOR, D3DCOMPILE_SKIP_OPTIMIZATION, D3DCOMPILE_WARNINGS_ARE_ERRORS,
    D3DCOMPILER_STRIP_DEBUG_INFO, D3DCOMPILER_STRIP_REFLECTION_DATA, D3DCompileFromFile,
    D3DGetBlobPart, D3DStripShader, D3D_BLOB_DEBUG_NAME, D3D_BLOB_PDB,
};
use windows::Win32::Graphics::Direct3D::{D3D_INCLUDE_TYPE, D3D_SHADER_MACRO, ID3DBlob, ID3DInclude};
use windows::Win32::System::LibraryLoader::{LoadLibraryW, SetDllDirectoryW};
use windows::core::{HRESULT, PCSTR, PCWSTR, w};

use crate::options::{Options, PDB_DIR};
use crate::output::dump_output;
use crate::plan::Task;
use crate::worker::{BuildState, TaskOutcome, update_progress};

fn to_wide(s: &std::ffi::OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Prepends `dir` to the DLL search order so the configured compiler's
/// `dxcompiler.dll`/`dxil.dll` win over any system copies.
pub fn add_dll_search_path(dir: &Path) -> anyhow::Result<()> {
    let wide = to_wide(dir.as_os_str());
    unsafe { SetDllDirectoryW(PCWSTR(wide.as_ptr())) }
        .with_context(|| format!("can't add '{}' to the DLL search path", dir.display()))
}

/// The DXBC API backend is useless without d3dcompiler; load it up front so
/// a broken installation fails once, before any worker starts.
pub fn preload_d3dcompiler() -> anyhow::Result<()> {
    unsafe { LoadLibraryW(w!("d3dcompiler_47.dll")) }
        .map(|_| ())
        .context("can't load d3dcompiler_47.dll")
}

#[repr(C)]
struct IncludeVtbl {
    open: unsafe extern "system" fn(
        this: *mut IncludeResolver,
        include_type: D3D_INCLUDE_TYPE,
        file_name: PCSTR,
        parent_data: *const c_void,
        out_data: *mut *const c_void,
        out_bytes: *mut u32,
    ) -> HRESULT,
    close: unsafe extern "system" fn(this: *mut IncludeResolver, data: *const c_void) -> HRESULT,
}

static INCLUDE_VTBL: IncludeVtbl = IncludeVtbl { open: resolver_open, close: resolver_close };

#[repr(C)]
struct IncludeResolver {
    vtable: *const IncludeVtbl,
    /// Search stack: source parent, configured include dirs, then one entry
    /// per include currently open.
    search_dirs: Vec<PathBuf>,
    /// Buffers handed to the compiler, alive until the matching Close.
    buffers: Vec<Box<[u8]>>,
}

impl IncludeResolver {
    fn new(source_file: &Path, options: &Options) -> Box<Self> {
        let mut search_dirs = Vec::with_capacity(options.include_dirs.len() + 9);
        search_dirs.push(source_file.parent().unwrap_or(Path::new("")).to_path_buf());
        search_dirs.extend(options.include_dirs.iter().cloned());
        Box::new(Self { vtable: &INCLUDE_VTBL, search_dirs, buffers: Vec::new() })
    }
}

unsafe extern "system" fn resolver_open(
    this: *mut IncludeResolver,
    _include_type: D3D_INCLUDE_TYPE,
    file_name: PCSTR,
    _parent_data: *const c_void,
    out_data: *mut *const c_void,
    out_bytes: *mut u32,
) -> HRESULT {
    unsafe {
        *out_data = std::ptr::null();
        *out_bytes = 0;

        let resolver = &mut *this;
        let Ok(name) = CStr::from_ptr(file_name.0.cast()).to_str() else {
            return E_FAIL;
        };

        for index in 0..resolver.search_dirs.len() {
            let candidate = resolver.search_dirs[index].join(name);
            let Ok(data) = fs::read(&candidate) else {
                continue;
            };

            // Sub-includes resolve relative to the file just opened.
            let parent = candidate.parent().unwrap_or(Path::new("")).to_path_buf();
            resolver.search_dirs.push(parent);

            let buffer = data.into_boxed_slice();
            *out_data = buffer.as_ptr().cast();
            *out_bytes = buffer.len() as u32;
            resolver.buffers.push(buffer);

            return S_OK;
        }

        E_FAIL
    }
}

unsafe extern "system" fn resolver_close(
    this: *mut IncludeResolver,
    data: *const c_void,
) -> HRESULT {
    unsafe {
        let resolver = &mut *this;
        resolver.search_dirs.pop();
        if let Some(index) =
            resolver.buffers.iter().position(|buffer| buffer.as_ptr().cast() == data)
        {
            resolver.buffers.swap_remove(index);
        }
        S_OK
    }
}

fn c_string(s: &str) -> CString {
    // Config tokens cannot carry interior NULs.
    CString::new(s).unwrap_or_default()
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    }
}

fn compile_flags(options: &Options, task: &Task) -> u32 {
    const OPTIMIZATION_FLAGS: [u32; 4] = [
        D3DCOMPILE_SKIP_OPTIMIZATION,
        D3DCOMPILE_OPTIMIZATION_LEVEL1,
        D3DCOMPILE_OPTIMIZATION_LEVEL2,
        D3DCOMPILE_OPTIMIZATION_LEVEL3,
    ];

    let mut flags = OPTIMIZATION_FLAGS[task.optimization_level.min(3) as usize];
    if options.pdb {
        flags |= D3DCOMPILE_DEBUG | D3DCOMPILE_DEBUG_NAME_FOR_BINARY;
    }
    if options.all_resources_bound {
        flags |= D3DCOMPILE_ALL_RESOURCES_BOUND;
    }
    if options.warnings_are_errors {
        flags |= D3DCOMPILE_WARNINGS_ARE_ERRORS;
    }
    if options.matrix_row_major {
        flags |= D3DCOMPILE_PACK_MATRIX_ROW_MAJOR;
    }
    flags
}

/// Extracts the debug info part and the compiler's suggested file name from
/// a compiled blob and persists it under `<out>/PDB/`. The name blob starts
/// with two u16 fields (flags, name length) followed by the UTF-8 name.
fn write_pdb(task: &Task, code: &ID3DBlob) -> anyhow::Result<()> {
    unsafe {
        let mut pdb: Option<ID3DBlob> = None;
        let mut pdb_name: Option<ID3DBlob> = None;
        D3DGetBlobPart(
            code.GetBufferPointer(),
            code.GetBufferSize(),
            D3D_BLOB_PDB,
            0,
            &mut pdb,
        )
        .context("can't extract the PDB blob")?;
        D3DGetBlobPart(
            code.GetBufferPointer(),
            code.GetBufferSize(),
            D3D_BLOB_DEBUG_NAME,
            0,
            &mut pdb_name,
        )
        .context("can't extract the PDB name")?;

        let (Some(pdb), Some(pdb_name)) = (pdb, pdb_name) else {
            anyhow::bail!("the compiled blob carries no debug info");
        };

        let name_bytes = blob_bytes(&pdb_name);
        if name_bytes.len() < 4 {
            anyhow::bail!("malformed debug name blob");
        }
        let name_len = u16::from_le_bytes([name_bytes[2], name_bytes[3]]) as usize;
        let name = name_bytes
            .get(4..4 + name_len)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .context("malformed debug name blob")?;

        let file = task.output_path.parent().unwrap_or(Path::new("")).join(PDB_DIR).join(name);
        fs::write(&file, blob_bytes(&pdb))
            .with_context(|| format!("can't write PDB '{}'", file.display()))
    }
}

pub fn run_worker(state: &BuildState) {
    while let Some(task) = state.next_task() {
        compile_task(state, &task);
    }
}

fn compile_task(state: &BuildState, task: &Task) {
    let options = state.options;
    let source_file = options.source_file(&task.source);
    let wide_source = to_wide(source_file.as_os_str());

    // Keep every CString alive for the duration of the call; the macro
    // array only borrows them.
    let define_storage: Vec<(CString, Option<CString>)> = options
        .defines
        .iter()
        .chain(&task.defines)
        .map(|define| match define.split_once('=') {
            Some((name, value)) => (c_string(name), Some(c_string(value))),
            None => (c_string(define), None),
        })
        .collect();
    let mut macros: Vec<D3D_SHADER_MACRO> = define_storage
        .iter()
        .map(|(name, value)| D3D_SHADER_MACRO {
            Name: PCSTR(name.as_ptr().cast()),
            Definition: value
                .as_ref()
                .map_or(PCSTR::null(), |value| PCSTR(value.as_ptr().cast())),
        })
        .collect();
    macros.push(D3D_SHADER_MACRO { Name: PCSTR::null(), Definition: PCSTR::null() });

    let entry_point = c_string(&task.entry_point);
    let profile = c_string(&options.profile_string(&task.profile));

    let mut resolver = IncludeResolver::new(&source_file, options);
    let include = std::mem::ManuallyDrop::new(unsafe {
        ID3DInclude::from_raw((&mut *resolver as *mut IncludeResolver).cast())
    });

    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    let status = unsafe {
        D3DCompileFromFile(
            PCWSTR(wide_source.as_ptr()),
            Some(macros.as_ptr()),
            &*include,
            PCSTR(entry_point.as_ptr().cast()),
            PCSTR(profile.as_ptr().cast()),
            compile_flags(options, task),
            0,
            &mut code,
            Some(&mut errors),
        )
    };

    let diagnostics = errors
        .as_ref()
        .map(|blob| String::from_utf8_lossy(unsafe { blob_bytes(blob) }).into_owned())
        .unwrap_or_default();

    let (Ok(()), Some(mut code)) = (status, code) else {
        return update_progress(state, task, TaskOutcome::Failed { diagnostics: diagnostics.trim() });
    };

    if state.terminated() {
        return;
    }

    if options.pdb {
        if let Err(e) = write_pdb(task, &code) {
            let diagnostics = format!("{:#}", e);
            return update_progress(state, task, TaskOutcome::Failed { diagnostics: &diagnostics });
        }
    }

    if options.strip_reflection {
        let mut stripped: Option<ID3DBlob> = None;
        let result = unsafe {
            D3DStripShader(
                code.GetBufferPointer(),
                code.GetBufferSize(),
                (D3DCOMPILER_STRIP_REFLECTION_DATA.0 | D3DCOMPILER_STRIP_DEBUG_INFO.0) as u32,
                &mut stripped,
            )
        };
        if let (Ok(()), Some(stripped)) = (result, stripped) {
            code = stripped;
        }
    }

    let data = unsafe { blob_bytes(&code) };
    if let Err(e) = dump_output(options, task, data) {
        let diagnostics = format!("can't write outputs: {}", e);
        return update_progress(state, task, TaskOutcome::Failed { diagnostics: &diagnostics });
    }

    let warnings = diagnostics.trim();
    update_progress(
        state,
        task,
        TaskOutcome::Success { warnings: (!warnings.is_empty()).then_some(warnings) },
    );
}
