//! The loaded plugin and everything it shares with the engine
//!
//! Loading takes `&mut self` and happens once, before any virtual CPU runs.
//! Afterwards the registry is shared by reference (or `Arc`) between the
//! code generator and every virtual CPU thread.

use tpi_plugin::{HelperInfo, PluginInterface};

use crate::abi::{self, Activation, EngineInfo};
use crate::codegen::HookDispatcher;
use crate::config::EngineConfig;
use crate::error::LoadError;
use crate::loader::{resolve_plugin_path, PluginModule, SharedLibrary};
use crate::output::PluginOutput;
use crate::region::AddressRange;
use crate::runtime::CallbackGuard;

pub struct PluginRegistry {
    // Drop order matters: the descriptor references the output sink and
    // code inside the module, so both outlive the dispatcher.
    dispatcher: HookDispatcher,
    guard: CallbackGuard,
    activation: Option<Activation>,
    output: Option<PluginOutput>,
    module: Option<Box<dyn PluginModule>>,
    config: EngineConfig,
    engine: EngineInfo,
}

impl PluginRegistry {
    pub fn new(config: EngineConfig, engine: EngineInfo) -> Self {
        Self {
            dispatcher: HookDispatcher::inactive(engine.host_word),
            guard: CallbackGuard::new(config.mutex_protected),
            activation: None,
            output: None,
            module: None,
            config,
            engine,
        }
    }

    /// Resolve `name`, open it and activate the plugin it contains.
    pub fn load(&mut self, name: &str) -> Result<Activation, LoadError> {
        let path = resolve_plugin_path(
            name,
            &self.config.plugin_dir,
            &self.engine.guest,
            &self.engine.mode,
        );
        let module = match SharedLibrary::open(&path) {
            Ok(module) => module,
            Err(e) => {
                log::error!("plugin: error: {}", e);
                return Err(e);
            }
        };
        self.load_module(Box::new(module))
    }

    /// Activate the plugin behind an already opened module.
    pub fn load_module(
        &mut self,
        module: Box<dyn PluginModule>,
    ) -> Result<Activation, LoadError> {
        if let Some(loaded) = &self.module {
            return Err(LoadError::AlreadyLoaded {
                module: loaded.name().to_string(),
            });
        }

        let output = PluginOutput::open(self.config.output_path.as_deref());
        for warning in &self.config.warnings {
            log::warn!("{}", warning);
            output.warning(format_args!("{}", warning));
        }

        // `output` is dropped, and so closed, on every early return.
        match self.activate(module.as_ref(), &output) {
            Ok((tpi, activation)) => {
                log::info!(
                    "plugin '{}' activated ({}, range {})",
                    module.name(),
                    if activation.is_generic() {
                        "generic"
                    } else {
                        "architecture specific"
                    },
                    AddressRange::new(tpi.low_pc, tpi.high_pc)
                );
                self.guard = CallbackGuard::new(self.config.mutex_protected);
                self.dispatcher =
                    HookDispatcher::new(tpi, activation.class, self.engine.host_word);
                self.activation = Some(activation.clone());
                self.output = Some(output);
                self.module = Some(module);
                Ok(activation)
            }
            Err(e) => {
                log::error!("plugin '{}' rejected: {}", module.name(), e);
                output.error(format_args!("{}", e));
                Err(e)
            }
        }
    }

    fn activate(
        &self,
        module: &dyn PluginModule,
        output: &PluginOutput,
    ) -> Result<(PluginInterface, Activation), LoadError> {
        let init = module.entry_point()?;

        let mut prefilled = PluginInterface::zeroed();
        prefilled.output = output.sink();
        prefilled.nb_cpus = self.engine.nb_cpus;
        prefilled.low_pc = self.config.low_pc;
        prefilled.high_pc = self.config.high_pc;
        prefilled.verbose = self.config.verbose;
        prefilled.mutex_protected = self.config.mutex_protected;

        let mut tpi = prefilled;
        init(&mut tpi);
        restore_common_parameters(&mut tpi, &prefilled, module.name());

        let activation = abi::check(&mut tpi, &self.engine, module.name())?;
        for warning in &activation.warnings {
            log::warn!("plugin '{}': {}", module.name(), warning);
            output.warning(format_args!("{}", warning));
        }

        if tpi.verbose {
            let destination = output.destination().to_string();
            for line in abi::describe(&tpi, &destination) {
                output.line(format_args!("plugin: info: {}", line));
            }
        }

        Ok((tpi, activation))
    }

    /// Whether a plugin passed every load-time check.
    pub fn is_active(&self) -> bool {
        self.dispatcher.descriptor().is_active()
    }

    pub fn descriptor(&self) -> &PluginInterface {
        self.dispatcher.descriptor()
    }

    pub fn activation(&self) -> Option<&Activation> {
        self.activation.as_ref()
    }

    pub fn dispatcher(&self) -> &HookDispatcher {
        &self.dispatcher
    }

    pub fn guard(&self) -> &CallbackGuard {
        &self.guard
    }

    pub fn output(&self) -> Option<&PluginOutput> {
        self.output.as_ref()
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module.as_deref().map(|m| m.name())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &EngineInfo {
        &self.engine
    }

    /// Entry point of the injected helper call: hand the block's data to
    /// the plugin's data-collection callback under the guard.
    pub fn call_tb_helper(&self, info: HelperInfo, address: u64, data1: u64, data2: u64) {
        let tpi = self.dispatcher.descriptor();
        if let Some(callback) = tpi.pre_tb_helper_code {
            self.guard.call(|| callback(tpi, info, address, data1, data2));
        }
    }

    /// All virtual CPUs stopped: run the shutdown hook once and flush the
    /// plugin output.
    pub fn cpus_stopped(&self) -> bool {
        let ran = self.dispatcher.cpus_stopped();
        if let Some(output) = &self.output {
            output.flush();
        }
        ran
    }
}

/// The plugin only fills in compatibility fields and callbacks; the common
/// parameters stay whatever the engine put there.
fn restore_common_parameters(
    tpi: &mut PluginInterface,
    prefilled: &PluginInterface,
    module: &str,
) {
    if tpi.low_pc != prefilled.low_pc
        || tpi.high_pc != prefilled.high_pc
        || tpi.nb_cpus != prefilled.nb_cpus
        || tpi.mutex_protected != prefilled.mutex_protected
        || tpi.verbose != prefilled.verbose
        || tpi.output != prefilled.output
    {
        log::warn!(
            "plugin '{}' changed engine parameters during initialization; ignored",
            module
        );
    }
    tpi.output = prefilled.output;
    tpi.nb_cpus = prefilled.nb_cpus;
    tpi.low_pc = prefilled.low_pc;
    tpi.high_pc = prefilled.high_pc;
    tpi.verbose = prefilled.verbose;
    tpi.mutex_protected = prefilled.mutex_protected;
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("module", &self.module_name())
            .field("descriptor", self.dispatcher.descriptor())
            .field("output", &self.output)
            .finish()
    }
}
