//! Data-collection callbacks running on several virtual CPU threads

use std::cell::UnsafeCell;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use tpi_engine::output::output_file_name;
use tpi_engine::{
    BlockRunner, BlockTranslator, EngineConfig, EngineInfo, GeneratedBlock, GuestInsn,
    PluginRegistry, StaticModule,
};
use tpi_plugin::{HelperInfo, InitFn, PluginInterface};

const THREADS: u32 = 8;
const ROUNDS: u64 = 2_000;

/// Plain read-modify-write counter, deliberately not thread safe.
struct RacyCounter(UnsafeCell<u64>);

// SAFETY: only ever touched under the callback guard, which is what the
// test checks.
unsafe impl Sync for RacyCounter {}

impl RacyCounter {
    const fn new() -> Self {
        Self(UnsafeCell::new(0))
    }

    fn add(&self, n: u64) {
        // SAFETY: see the `Sync` impl.
        unsafe {
            let current = *self.0.get();
            thread::yield_now();
            *self.0.get() = current + n;
        }
    }

    fn get(&self) -> u64 {
        // SAFETY: read after every thread joined.
        unsafe { *self.0.get() }
    }
}

fn registry_with(name: &str, init: InitFn, config: EngineConfig) -> PluginRegistry {
    tpi_engine::logging::init_test();
    let engine = EngineInfo::new("lm32", "softmmu").with_cpus(THREADS);
    let mut registry = PluginRegistry::new(config, engine);
    registry
        .load_module(Box::new(StaticModule::new(name, init)))
        .unwrap();
    registry
}

fn translate_per_cpu(registry: &PluginRegistry) -> Vec<GeneratedBlock> {
    let translator = BlockTranslator::new(registry.dispatcher());
    (0..THREADS)
        .map(|cpu| {
            translator
                .translate(cpu, 0x1000, &GuestInsn::straight_line(0x1000, 4, 16))
                .unwrap()
        })
        .collect()
}

fn run_everywhere(registry: &PluginRegistry, blocks: &[GeneratedBlock]) {
    thread::scope(|scope| {
        for block in blocks {
            scope.spawn(move || {
                let mut runner = BlockRunner::new(registry);
                for _ in 0..ROUNDS {
                    runner.run(block);
                }
                assert_eq!(runner.helper_calls(), ROUNDS);
            });
        }
    });
}

// ============================================================================
// Guarded counting never loses updates
// ============================================================================

static GUARDED_TOTAL: RacyCounter = RacyCounter::new();

extern "C" fn guarded_count(_: &PluginInterface, info: HelperInfo, _: u64, _: u64, _: u64) {
    GUARDED_TOTAL.add(info.icount() as u64);
}

extern "C" fn guarded_init(tpi: &mut PluginInterface) {
    tpi.init_version_generic();
    tpi.pre_tb_helper_code = Some(guarded_count);
}

#[test]
fn test_guarded_counting_is_exact() {
    let registry = registry_with("guarded", guarded_init, EngineConfig::default());
    assert!(registry.guard().is_enabled());

    let blocks = translate_per_cpu(&registry);
    run_everywhere(&registry, &blocks);

    assert_eq!(GUARDED_TOTAL.get(), THREADS as u64 * ROUNDS * 4);
    assert_eq!(registry.guard().skipped(), 0);
}

// ============================================================================
// Unguarded calls still reach the plugin
// ============================================================================

static UNGUARDED_CALLS: AtomicU64 = AtomicU64::new(0);
static UNGUARDED_PER_CPU: [AtomicU64; THREADS as usize] =
    [const { AtomicU64::new(0) }; THREADS as usize];

extern "C" fn unguarded_count(_: &PluginInterface, info: HelperInfo, _: u64, _: u64, _: u64) {
    UNGUARDED_CALLS.fetch_add(1, Ordering::Relaxed);
    UNGUARDED_PER_CPU[info.cpu_index() as usize].fetch_add(info.icount() as u64, Ordering::Relaxed);
}

extern "C" fn unguarded_init(tpi: &mut PluginInterface) {
    tpi.init_version_generic();
    tpi.pre_tb_helper_code = Some(unguarded_count);
}

#[test]
fn test_unguarded_calls_run_concurrently() {
    let config = EngineConfig {
        mutex_protected: false,
        ..EngineConfig::default()
    };
    let registry = registry_with("unguarded", unguarded_init, config);
    assert!(!registry.guard().is_enabled());
    assert!(!registry.descriptor().mutex_protected);

    let blocks = translate_per_cpu(&registry);
    run_everywhere(&registry, &blocks);

    assert_eq!(UNGUARDED_CALLS.load(Ordering::Relaxed), THREADS as u64 * ROUNDS);
    for per_cpu in &UNGUARDED_PER_CPU {
        assert_eq!(per_cpu.load(Ordering::Relaxed), ROUNDS * 4);
    }
}

// ============================================================================
// Output lines never interleave
// ============================================================================

extern "C" fn chatty_code(tpi: &PluginInterface, info: HelperInfo, address: u64, _: u64, _: u64) {
    let mut out = tpi.output();
    let _ = write!(out, "cpu {} ", info.cpu_index());
    let _ = write!(out, "pc {:#x} ", address);
    let _ = writeln!(out, "icount {}", info.icount());
}

extern "C" fn chatty_init(tpi: &mut PluginInterface) {
    tpi.init_version_generic();
    tpi.pre_tb_helper_code = Some(chatty_code);
}

#[test]
fn test_output_lines_stay_whole() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("chatty");
    let config = EngineConfig {
        output_path: Some(base.clone()),
        mutex_protected: false,
        ..EngineConfig::default()
    };
    let registry = registry_with("chatty", chatty_init, config);

    let blocks = translate_per_cpu(&registry);
    thread::scope(|scope| {
        for block in &blocks {
            let registry = &registry;
            scope.spawn(move || {
                let mut runner = BlockRunner::new(registry);
                for _ in 0..100 {
                    runner.run(block);
                }
            });
        }
    });
    registry.cpus_stopped();

    let written = std::fs::read_to_string(output_file_name(&base, std::process::id())).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), THREADS as usize * 100);
    for line in lines {
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 6, "interleaved line: {:?}", line);
        assert_eq!(fields[0], "cpu");
        assert_eq!(&fields[2..], &["pc", "0x1000", "icount", "4"]);
    }
}
