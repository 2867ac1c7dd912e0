//! Plugin module resolution and opening
//!
//! A plugin is named either by path or by a short name such as `icount`,
//! which is looked up in the installed plugin tree first:
//!
//! ```text
//! <plugin_dir>/<guest>/<mode>/libtpi_<name>.so
//! ```
//!
//! When that file is absent the name is handed to the dynamic linker as is,
//! so `LD_LIBRARY_PATH` and the usual search path still apply.

use libloading::Library;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::fmt;
use std::path::{Path, PathBuf};

use tpi_plugin::{InitFn, ENTRY_POINT};

use crate::error::LoadError;

/// Source of a plugin entry point.
///
/// All foreign symbol resolution happens behind this trait; the rest of the
/// engine only ever sees a typed [`InitFn`].
pub trait PluginModule: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Locate `tpi_init`. The returned pointer is valid while `self` lives.
    fn entry_point(&self) -> Result<InitFn, LoadError>;
}

/// Plugin opened from a shared object.
pub struct SharedLibrary {
    name: String,
    path: PathBuf,
    library: Library,
}

impl SharedLibrary {
    /// Open `path` with every symbol bound immediately.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let library = open_now(path).map_err(|e| LoadError::ModuleNotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        log::debug!("opened plugin module {}", path.display());

        Ok(Self {
            name: path.display().to_string(),
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn open_now(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_NOW};
    // SAFETY: running the plugin's initializers is what loading a plugin
    // means; the engine trusts the modules it is told to load.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_now(path: &Path) -> Result<Library, libloading::Error> {
    // SAFETY: see the unix variant.
    unsafe { Library::new(path) }
}

impl PluginModule for SharedLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_point(&self) -> Result<InitFn, LoadError> {
        // SAFETY: `tpi_init` is declared with the `InitFn` signature by
        // `declare_plugin!`; the pointer does not outlive `self.library`.
        let init = unsafe {
            let symbol: libloading::Symbol<InitFn> =
                self.library
                    .get(ENTRY_POINT)
                    .map_err(|e| LoadError::EntryPointMissing {
                        module: self.name.clone(),
                        symbol: String::from_utf8_lossy(ENTRY_POINT).into_owned(),
                        reason: e.to_string(),
                    })?;
            *symbol
        };
        Ok(init)
    }
}

impl fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLibrary")
            .field("path", &self.path)
            .finish()
    }
}

/// Plugin whose entry point is linked into the host.
#[derive(Debug, Clone)]
pub struct StaticModule {
    name: String,
    init: InitFn,
}

impl StaticModule {
    pub fn new(name: impl Into<String>, init: InitFn) -> Self {
        Self {
            name: name.into(),
            init,
        }
    }
}

impl PluginModule for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_point(&self) -> Result<InitFn, LoadError> {
        Ok(self.init)
    }
}

/// Names starting with `.` or `/`, or containing a separator, are paths.
pub fn is_short_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.starts_with('/')
        && !name.contains('/')
        && !name.contains(std::path::MAIN_SEPARATOR)
}

/// Where an installed plugin called `name` lives.
pub fn installed_path(plugin_dir: &Path, guest: &str, mode: &str, name: &str) -> PathBuf {
    plugin_dir
        .join(guest)
        .join(mode)
        .join(format!("{}tpi_{}{}", DLL_PREFIX, name, DLL_SUFFIX))
}

/// Expand a short name to its installed path when that file exists, and
/// leave everything else to the dynamic linker.
pub fn resolve_plugin_path(name: &str, plugin_dir: &Path, guest: &str, mode: &str) -> PathBuf {
    if is_short_name(name) {
        let installed = installed_path(plugin_dir, guest, mode, name);
        if installed.is_file() {
            return installed;
        }
        log::debug!(
            "{} not installed, falling back to the dynamic linker search path",
            installed.display()
        );
    }
    PathBuf::from(name)
}
