//! Instruction-fetch trace in DineroIV "din" format.
//!
//! Every executed block is split into fetches of its average instruction
//! size:
//!
//! ```text
//! i 0x0000000000001000 0x00000004 CPU #0
//! ```

use std::io::Write;

use tpi_plugin::{declare_plugin, HelperInfo, PluginInterface};

/// Split a block of `size` bytes and `icount` instructions into fetches.
///
/// Returns `(offset, length)` pairs; the last fetch is clipped to the end of
/// the block.
pub fn fetches(size: u16, icount: u32) -> impl Iterator<Item = (u64, u64)> {
    let size = size as u64;
    let step = (size / icount.max(1) as u64).max(1);
    (0..size)
        .step_by(step as usize)
        .map(move |offset| (offset, step.min(size - offset)))
}

pub fn fetch_line(address: u64, length: u64, cpu_index: u16) -> String {
    format!("i {:#018x} {:#010x} CPU #{}", address, length, cpu_index)
}

extern "C" fn on_block(tpi: &PluginInterface, info: HelperInfo, address: u64, _: u64, _: u64) {
    let mut out = tpi.output();
    for (offset, length) in fetches(info.size(), info.icount()) {
        let _ = writeln!(
            out,
            "{}",
            fetch_line(address.wrapping_add(offset), length, info.cpu_index())
        );
    }
}

fn init(tpi: &mut PluginInterface) {
    tpi.init_version_generic();
    tpi.pre_tb_helper_code = Some(on_block);
}

declare_plugin!(init);

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;
    use std::sync::Mutex;
    use tpi_plugin::OutputSink;

    extern "C" fn capture(ctx: *const c_void, buf: *const u8, len: usize) -> isize {
        // SAFETY: the test passes a `Mutex<String>` as context.
        let text = unsafe { &*(ctx as *const Mutex<String>) };
        let bytes = unsafe { std::slice::from_raw_parts(buf, len) };
        text.lock().unwrap().push_str(&String::from_utf8_lossy(bytes));
        len as isize
    }

    extern "C" fn no_flush(_: *const c_void) -> bool {
        true
    }

    #[test]
    fn test_even_split() {
        let chunks: Vec<_> = fetches(16, 4).collect();
        assert_eq!(chunks, vec![(0, 4), (4, 4), (8, 4), (12, 4)]);
    }

    #[test]
    fn test_last_fetch_is_clipped() {
        let chunks: Vec<_> = fetches(10, 3).collect();
        assert_eq!(chunks, vec![(0, 3), (3, 3), (6, 3), (9, 1)]);
    }

    #[test]
    fn test_empty_block() {
        assert_eq!(fetches(0, 0).count(), 0);
        assert_eq!(fetches(0, 4).count(), 0);
        // more instructions than bytes
        assert_eq!(fetches(2, 8).count(), 2);
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            fetch_line(0x1000, 4, 0),
            "i 0x0000000000001000 0x00000004 CPU #0"
        );
    }

    #[test]
    fn test_trace_of_one_block() {
        let text = Mutex::new(String::new());
        let sink = OutputSink {
            ctx: &text as *const _ as *const c_void,
            write: capture,
            flush: no_flush,
        };

        let mut tpi = PluginInterface::zeroed();
        tpi.output = &sink;
        tpi_init(&mut tpi);
        assert!(tpi.is_active());
        assert!(tpi.cpus_stopped.is_none());

        (tpi.pre_tb_helper_code.unwrap())(&tpi, HelperInfo::for_block(1, 8, 2), 0x2000, 0, 0);

        let text = text.into_inner().unwrap();
        assert_eq!(
            text,
            "i 0x0000000000002000 0x00000004 CPU #1\n\
             i 0x0000000000002004 0x00000004 CPU #1\n"
        );
    }
}
