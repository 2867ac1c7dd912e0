//! Per-block execution profile.
//!
//! Statistics are attached to each block when it is generated, so the data
//! collection callback only bumps atomics and never takes the table lock.
//! The table is printed when every virtual CPU has stopped:
//!
//! ```text
//! ADDRESS            | #EXEC | #BYTES | #INSTR
//! --------------------------------------------
//! 0x0000000000001000 |    10 |    160 |     40
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use tpi_plugin::{declare_plugin, GenContext, HelperInfo, PluginInterface};

#[derive(Debug, Default)]
pub struct BlockStats {
    pub executions: AtomicU64,
    pub bytes: AtomicU64,
    pub instructions: AtomicU64,
}

impl BlockStats {
    fn record(&self, info: HelperInfo) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(info.size() as u64, Ordering::Relaxed);
        self.instructions
            .fetch_add(info.icount() as u64, Ordering::Relaxed);
    }
}

/// Snapshot of one profiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileRow {
    pub address: u64,
    pub executions: u64,
    pub bytes: u64,
    pub instructions: u64,
}

// Boxed so the address handed out as `data1` survives map rebalancing.
static BLOCKS: Mutex<BTreeMap<u64, Box<BlockStats>>> = parking_lot::const_mutex(BTreeMap::new());

extern "C" fn on_block_generated(
    _tpi: &PluginInterface,
    _ctx: &GenContext,
    _info: HelperInfo,
    address: u64,
    data1: &mut u64,
    _data2: &mut u64,
) {
    let mut blocks = BLOCKS.lock();
    let stats = blocks.entry(address).or_default();
    *data1 = &**stats as *const BlockStats as u64;
}

extern "C" fn on_block(_tpi: &PluginInterface, info: HelperInfo, _address: u64, data1: u64, _: u64) {
    // SAFETY: `data1` was produced by `on_block_generated` and entries are
    // never removed while the plugin is loaded.
    if let Some(stats) = unsafe { (data1 as *const BlockStats).as_ref() } {
        stats.record(info);
    }
}

extern "C" fn on_cpus_stopped(tpi: &PluginInterface) {
    let mut out = tpi.output();
    let _ = writeln!(out, "{} ({}):", env!("CARGO_PKG_NAME"), std::process::id());
    let _ = write_table(&mut out, &rows());
    let _ = out.flush();
}

fn init(tpi: &mut PluginInterface) {
    tpi.init_version_generic();
    tpi.pre_tb_helper_data = Some(on_block_generated);
    tpi.pre_tb_helper_code = Some(on_block);
    tpi.cpus_stopped = Some(on_cpus_stopped);
}

declare_plugin!(init);

/// Current statistics, sorted by block address.
pub fn rows() -> Vec<ProfileRow> {
    BLOCKS
        .lock()
        .iter()
        .map(|(&address, stats)| ProfileRow {
            address,
            executions: stats.executions.load(Ordering::Relaxed),
            bytes: stats.bytes.load(Ordering::Relaxed),
            instructions: stats.instructions.load(Ordering::Relaxed),
        })
        .collect()
}

/// Print `rows` as an aligned table with a dashed separator under the header.
pub fn write_table<W: Write>(out: &mut W, rows: &[ProfileRow]) -> io::Result<()> {
    const HEADER: [&str; 4] = ["ADDRESS", "#EXEC", "#BYTES", "#INSTR"];

    let cells: Vec<[String; 4]> = rows
        .iter()
        .map(|row| {
            [
                format!("{:#018x}", row.address),
                row.executions.to_string(),
                row.bytes.to_string(),
                row.instructions.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADER.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    writeln!(
        out,
        "{:<w0$} | {:>w1$} | {:>w2$} | {:>w3$}",
        HEADER[0],
        HEADER[1],
        HEADER[2],
        HEADER[3],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3]
    )?;
    let line_length = widths.iter().sum::<usize>() + 3 * (widths.len() - 1);
    writeln!(out, "{}", "-".repeat(line_length))?;

    for row in &cells {
        writeln!(
            out,
            "{:<w0$} | {:>w1$} | {:>w2$} | {:>w3$}",
            row[0],
            row[1],
            row[2],
            row[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3]
        )?;
    }
    Ok(())
}
