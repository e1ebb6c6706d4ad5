//! Process-lifecycle plumbing: native image loading, dispatch-table
//! extraction, simulator child spawning and endpoint resolution.
//!
//! The load order is a two-step contract: the dispatch image first, lazily
//! bound and globally visible, because it exports the runtime helpers user
//! code depends on; then the user DPI image, eagerly bound and globally
//! visible, so helpers resolve into it and its exports satisfy the
//! dispatch wrappers' unresolved externs. The reverse order fails with
//! unresolved helpers.

use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use libloading::os::unix::{Library, Symbol, RTLD_GLOBAL, RTLD_LAZY, RTLD_NOW};
use log::{debug, info};

use crate::dpi::{DpiCallback, DpiFunc};

/// Dispatch image name inside the work directory.
pub const DISPATCH_IMAGE: &str = "dispatch.so";
/// Symbols exported by the generated dispatch image.
const DPI_TABLE_SYMBOL: &[u8] = b"loom_dpi_funcs";
const DPI_COUNT_SYMBOL: &[u8] = b"loom_dpi_n_funcs";

/// Entry layout of the generated `loom_dpi_funcs` array.
#[repr(C)]
pub struct RawDpiFunc {
    pub name: *const c_char,
    pub n_args: u32,
    pub ret_width: u32,
    pub call_at_init: u32,
    pub out_arg_words: u32,
    pub func: Option<unsafe extern "C" fn(args: *const u32, out: *mut u32) -> u64>,
}

/// Holds the dlopen handles for the process lifetime. Dropped last, after
/// disconnect, so no in-flight call can outlive its code.
pub struct LoadedImages {
    pub dispatch: Option<Library>,
    pub user: Option<Library>,
}

/// Loads the dispatch and user images in the required order and reads the
/// dispatch table.
pub fn load_images(
    work_dir: &Path,
    sv_lib: Option<&str>,
) -> anyhow::Result<(LoadedImages, Vec<DpiFunc>)> {
    let mut images = LoadedImages { dispatch: None, user: None };
    let dispatch_path = work_dir.join(DISPATCH_IMAGE);
    if dispatch_path.exists() {
        let lib = unsafe { Library::open(Some(&dispatch_path), RTLD_LAZY | RTLD_GLOBAL) }
            .with_context(|| format!("loading dispatch image {}", dispatch_path.display()))?;
        debug!("loaded dispatch image {}", dispatch_path.display());
        images.dispatch = Some(lib);
    }
    if let Some(name) = sv_lib {
        let path = resolve_sv_lib(name, work_dir)?;
        let lib = unsafe { Library::open(Some(&path), RTLD_NOW | RTLD_GLOBAL) }
            .with_context(|| format!("loading user DPI image {}", path.display()))?;
        debug!("loaded user DPI image {}", path.display());
        images.user = Some(lib);
    }
    let table = match &images.dispatch {
        Some(lib) => read_dispatch_table(lib)?,
        None => Vec::new(),
    };
    info!("dispatch table: {} functions", table.len());
    Ok((images, table))
}

fn read_dispatch_table(lib: &Library) -> anyhow::Result<Vec<DpiFunc>> {
    // SAFETY: the symbols are data exports of the generated dispatch image
    // with the layout fixed by the code generator; the table stays alive as
    // long as the library handle, which outlives the service.
    unsafe {
        let count: Symbol<*const u32> = lib
            .get(DPI_COUNT_SYMBOL)
            .context("dispatch image does not export `loom_dpi_n_funcs`")?;
        let n = **count as usize;
        let table: Symbol<*const RawDpiFunc> = lib
            .get(DPI_TABLE_SYMBOL)
            .context("dispatch image does not export `loom_dpi_funcs`")?;
        let raws = std::slice::from_raw_parts(*table, n);
        raws.iter()
            .enumerate()
            .map(|(i, raw)| -> anyhow::Result<DpiFunc> {
                let name = if raw.name.is_null() {
                    format!("func{i}")
                } else {
                    CStr::from_ptr(raw.name).to_string_lossy().into_owned()
                };
                let Some(func) = raw.func else {
                    bail!("dispatch entry {i} (`{name}`) has a null callback");
                };
                Ok(DpiFunc {
                    func_id: i as u32,
                    name,
                    n_args: raw.n_args,
                    ret_width: raw.ret_width,
                    call_at_init: raw.call_at_init != 0,
                    out_arg_words: raw.out_arg_words,
                    callback: DpiCallback::Native(func),
                })
            })
            .collect()
    }
}

/// Resolves a `-sv_lib` name: absolute paths as-is, otherwise `NAME.so`
/// then `libNAME.so`, in the current directory then the work directory.
pub fn resolve_sv_lib(name: &str, work_dir: &Path) -> anyhow::Result<PathBuf> {
    let direct = Path::new(name);
    if direct.is_absolute() {
        if direct.exists() {
            return Ok(direct.to_path_buf());
        }
        bail!("user DPI image {} does not exist", direct.display());
    }
    for candidate in [format!("{name}.so"), format!("lib{name}.so")] {
        let cwd_relative = PathBuf::from(&candidate);
        if cwd_relative.exists() {
            return Ok(cwd_relative);
        }
        let in_work = work_dir.join(&candidate);
        if in_work.exists() {
            return Ok(in_work);
        }
    }
    bail!("user DPI image `{name}` not found (tried {name}.so and lib{name}.so)")
}

/// Spawns the simulator child with the endpoint as an argument.
pub fn spawn_sim(
    sim: &str,
    endpoint: &Path,
    timeout_ns: Option<u64>,
    work_dir: &Path,
) -> anyhow::Result<Child> {
    let mut command = Command::new(sim);
    command.arg("-s").arg(endpoint).current_dir(work_dir);
    if let Some(ns) = timeout_ns {
        command.arg("-timeout").arg(ns.to_string());
    }
    let child = command.spawn().with_context(|| format!("spawning simulator `{sim}`"))?;
    info!("simulator `{sim}` running as pid {}", child.id());
    Ok(child)
}

/// Polls for the simulator's endpoint to appear.
pub fn wait_for_endpoint(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    path.exists()
}
