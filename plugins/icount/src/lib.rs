//! Count executed guest instructions per virtual CPU.
//!
//! ```text
//! tpi-icount (4242): number of executed instructions on CPU #0 = 123456
//! ```

use parking_lot::Mutex;
use std::io::Write;

use tpi_plugin::{declare_plugin, HelperInfo, PluginInterface};

static COUNTS: Mutex<Vec<u64>> = parking_lot::const_mutex(Vec::new());

extern "C" fn on_block(_tpi: &PluginInterface, info: HelperInfo, _address: u64, _: u64, _: u64) {
    let mut counts = COUNTS.lock();
    if let Some(count) = counts.get_mut(info.cpu_index() as usize) {
        *count += info.icount() as u64;
    }
}

extern "C" fn on_cpus_stopped(tpi: &PluginInterface) {
    let counts = COUNTS.lock();
    let mut out = tpi.output();
    for (cpu, count) in counts.iter().enumerate() {
        let _ = writeln!(
            out,
            "{} ({}): number of executed instructions on CPU #{} = {}",
            env!("CARGO_PKG_NAME"),
            std::process::id(),
            cpu,
            count
        );
    }
}

fn init(tpi: &mut PluginInterface) {
    tpi.init_version_generic();
    tpi.pre_tb_helper_code = Some(on_block);
    tpi.cpus_stopped = Some(on_cpus_stopped);

    *COUNTS.lock() = vec![0; tpi.nb_cpus.max(1) as usize];
}

declare_plugin!(init);

/// Instructions counted so far, per virtual CPU.
pub fn counts() -> Vec<u64> {
    COUNTS.lock().clone()
}
