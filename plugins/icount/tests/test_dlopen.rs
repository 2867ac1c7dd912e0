//! Load the built icount shared object through the engine

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tpi_engine::output::output_file_name;
use tpi_engine::{
    BlockRunner, BlockTranslator, EngineConfig, EngineInfo, GuestInsn, PluginRegistry,
};

// Both tests open the same module and its counters.
static SERIAL: Mutex<()> = Mutex::new(());

/// `libtpi_icount.so` as cargo built it next to this test binary.
fn built_plugin() -> PathBuf {
    let file = format!("{}tpi_icount{}", DLL_PREFIX, DLL_SUFFIX);
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    [deps.join(&file), deps.parent().unwrap().join(&file)]
        .into_iter()
        .find(|path| path.is_file())
        .unwrap_or_else(|| panic!("{} not found near {}", file, deps.display()))
}

fn engine() -> EngineInfo {
    EngineInfo::new("lm32", "softmmu").with_cpus(1)
}

fn config(plugin_dir: &Path, output: &Path) -> EngineConfig {
    EngineConfig {
        plugin_dir: plugin_dir.to_path_buf(),
        output_path: Some(output.to_path_buf()),
        ..EngineConfig::default()
    }
}

#[test]
fn test_load_by_path_and_count() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    tpi_engine::logging::init_test();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("icount.out");
    let mut registry = PluginRegistry::new(config(dir.path(), &base), engine());

    let plugin = built_plugin();
    let activation = registry.load(plugin.to_str().unwrap()).unwrap();
    assert!(activation.is_generic());
    assert!(activation.warnings.is_empty());
    assert!(registry.is_active());
    assert!(registry.descriptor().pre_tb_helper_code.is_some());

    let translator = BlockTranslator::new(registry.dispatcher());
    let block = translator
        .translate(0, 0x1000, &GuestInsn::straight_line(0x1000, 4, 16))
        .unwrap();
    assert!(block.instrumented);

    let mut runner = BlockRunner::new(&registry);
    runner.run(&block);
    assert_eq!(runner.helper_calls(), 1);

    assert!(registry.cpus_stopped());
    let written = std::fs::read_to_string(output_file_name(&base, std::process::id())).unwrap();
    assert!(
        written.contains("tpi-icount")
            && written.contains("number of executed instructions on CPU #0 = 4"),
        "unexpected output: {}",
        written
    );
}

#[test]
fn test_load_by_short_name() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    tpi_engine::logging::init_test();
    let dir = tempfile::tempdir().unwrap();
    let installed = tpi_engine::loader::installed_path(dir.path(), "lm32", "softmmu", "icount");
    std::fs::create_dir_all(installed.parent().unwrap()).unwrap();
    std::fs::copy(built_plugin(), &installed).unwrap();

    let base = dir.path().join("icount.out");
    let mut registry = PluginRegistry::new(config(dir.path(), &base), engine());
    let activation = registry.load("icount").unwrap();

    assert!(activation.is_generic());
    assert!(registry.is_active());
    assert!(registry.descriptor().is_generic);
    assert_eq!(
        registry.module_name(),
        Some(installed.display().to_string().as_str())
    );
}
