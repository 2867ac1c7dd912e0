//! Descriptor validation
//!
//! Runs right after `tpi_init` returns. Interface version and structure
//! sizes are hard requirements; guest and mode tags only produce warnings
//! since a plugin may still work on a neighbouring target.

use std::ffi::CStr;
use std::fmt;
use std::mem::size_of;

use tpi_plugin::{CpuState, PluginInterface, TranslationBlock, ANY, TPI_VERSION};

use crate::codegen::HostWordSize;
use crate::error::LoadError;

/// Build-time facts of the running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub guest: String,
    pub mode: String,
    pub sizeof_cpu_state: usize,
    pub sizeof_translation_block: usize,
    pub nb_cpus: u32,
    pub host_word: HostWordSize,
}

impl EngineInfo {
    pub fn new(guest: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            guest: guest.into(),
            mode: mode.into(),
            sizeof_cpu_state: size_of::<CpuState>(),
            sizeof_translation_block: size_of::<TranslationBlock>(),
            nb_cpus: 1,
            host_word: HostWordSize::native(),
        }
    }

    pub fn with_cpus(mut self, nb_cpus: u32) -> Self {
        self.nb_cpus = nb_cpus;
        self
    }

    pub fn with_host_word(mut self, word: HostWordSize) -> Self {
        self.host_word = word;
        self
    }
}

/// Proof that the loaded plugin declared the engine's structure layouts.
/// Required to hand `CpuState`/`TranslationBlock` to a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchAccess {
    _checked: (),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginClass {
    /// Guest and mode are both `any`; never sees architecture state
    Generic,
    ArchSpecific(ArchAccess),
}

impl PluginClass {
    pub fn arch_access(self) -> Option<ArchAccess> {
        match self {
            PluginClass::Generic => None,
            PluginClass::ArchSpecific(access) => Some(access),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiWarning {
    ArchitectureMismatch { plugin: String, engine: String },
    ModeMismatch { plugin: String, engine: String },
}

impl fmt::Display for AbiWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiWarning::ArchitectureMismatch { plugin, engine } => {
                write!(f, "incompatible guest CPU ({} != {})", plugin, engine)
            }
            AbiWarning::ModeMismatch { plugin, engine } => {
                write!(f, "incompatible emulation mode ({} != {})", plugin, engine)
            }
        }
    }
}

/// Outcome of a successful check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub class: PluginClass,
    pub warnings: Vec<AbiWarning>,
}

impl Activation {
    pub fn is_generic(&self) -> bool {
        self.class == PluginClass::Generic
    }
}

/// Validate `tpi` against `engine`.
///
/// On success `is_generic` is filled in. On failure the descriptor is reset
/// to its zero state, which disables every hook.
pub fn check(
    tpi: &mut PluginInterface,
    engine: &EngineInfo,
    module: &str,
) -> Result<Activation, LoadError> {
    match validate(tpi, engine, module) {
        Ok(activation) => {
            tpi.is_generic = activation.is_generic();
            Ok(activation)
        }
        Err(e) => {
            *tpi = PluginInterface::zeroed();
            Err(e)
        }
    }
}

fn validate(
    tpi: &PluginInterface,
    engine: &EngineInfo,
    module: &str,
) -> Result<Activation, LoadError> {
    let failed = || LoadError::InitializationFailed {
        module: module.to_string(),
    };

    if tpi.version == 0 {
        return Err(failed());
    }

    if tpi.version != TPI_VERSION {
        return Err(LoadError::VersionMismatch {
            found: tpi.version,
            expected: TPI_VERSION,
        });
    }

    if tpi.sizeof_cpu_state != 0 && tpi.sizeof_cpu_state != engine.sizeof_cpu_state {
        return Err(LoadError::LayoutMismatch {
            structure: "CpuState",
            found: tpi.sizeof_cpu_state,
            expected: engine.sizeof_cpu_state,
        });
    }

    if tpi.sizeof_translation_block != 0
        && tpi.sizeof_translation_block != engine.sizeof_translation_block
    {
        return Err(LoadError::LayoutMismatch {
            structure: "TranslationBlock",
            found: tpi.sizeof_translation_block,
            expected: engine.sizeof_translation_block,
        });
    }

    let guest = tag(tpi.guest()).ok_or_else(failed)?;
    let mode = tag(tpi.mode()).ok_or_else(failed)?;
    let is_any = |t: &str| t.as_bytes() == ANY.to_bytes();

    let mut warnings = Vec::new();
    if guest != engine.guest && !is_any(guest) {
        warnings.push(AbiWarning::ArchitectureMismatch {
            plugin: guest.to_string(),
            engine: engine.guest.clone(),
        });
    }
    if mode != engine.mode && !is_any(mode) {
        warnings.push(AbiWarning::ModeMismatch {
            plugin: mode.to_string(),
            engine: engine.mode.clone(),
        });
    }

    let class = if is_any(guest) && is_any(mode) {
        PluginClass::Generic
    } else {
        PluginClass::ArchSpecific(ArchAccess { _checked: () })
    };

    Ok(Activation { class, warnings })
}

fn tag(tag: Option<&CStr>) -> Option<&str> {
    tag.and_then(|t| t.to_str().ok())
}

/// `plugin: info:` lines describing an activated descriptor.
pub fn describe(tpi: &PluginInterface, output: &str) -> Vec<String> {
    fn callback(set: bool) -> &'static str {
        if set {
            "set"
        } else {
            "unset"
        }
    }

    let tag = |t: Option<&CStr>| t.map(|t| t.to_string_lossy().into_owned()).unwrap_or_default();

    vec![
        format!("version = {}", tpi.version),
        format!("guest = {}", tag(tpi.guest())),
        format!("mode = {}", tag(tpi.mode())),
        format!("sizeof(CpuState) = {}", tpi.sizeof_cpu_state),
        format!("sizeof(TranslationBlock) = {}", tpi.sizeof_translation_block),
        format!("output = {}", output),
        format!("nb cpus = {}", tpi.nb_cpus),
        format!("low pc = {:#018x}", tpi.low_pc),
        format!("high pc = {:#018x}", tpi.high_pc),
        format!("mutex protected = {}", tpi.mutex_protected),
        format!("cpus_stopped callback = {}", callback(tpi.cpus_stopped.is_some())),
        format!("before_gen_tb callback = {}", callback(tpi.before_gen_tb.is_some())),
        format!("after_gen_tb callback = {}", callback(tpi.after_gen_tb.is_some())),
        format!("after_gen_opc callback = {}", callback(tpi.after_gen_opc.is_some())),
        format!(
            "pre_tb_helper_code callback = {}",
            callback(tpi.pre_tb_helper_code.is_some())
        ),
        format!(
            "pre_tb_helper_data callback = {}",
            callback(tpi.pre_tb_helper_data.is_some())
        ),
        format!("is{} generic", if tpi.is_generic { "" } else { " not" }),
    ]
}
