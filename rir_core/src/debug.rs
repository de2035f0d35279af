//! Process-wide debug mask.
//!
//! The optimizer's observability is controlled by a bitset of named flags,
//! settable programmatically or through the `PIR_DEBUG` environment variable
//! (a comma-separated list of flag names, read once at startup). An unknown
//! name in `PIR_DEBUG` terminates the process with a listing of valid names.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        /// Run the optimizer but do not install the result.
        const DRY_RUN            = 1 << 0;
        /// Keep superseded versions in the dispatch table.
        const PRESERVE_VERSIONS  = 1 << 1;
        /// Report compilation aborts on stderr.
        const SHOW_WARNINGS      = 1 << 2;
        /// Trace the RIR input of a compilation.
        const PRINT_EARLY_RIR    = 1 << 3;
        /// Trace PIR straight after translation.
        const PRINT_EARLY_PIR    = 1 << 4;
        /// Trace PIR after the pass pipeline.
        const PRINT_OPTIMIZED_PIR = 1 << 5;
        /// Trace the specialized RIR output.
        const PRINT_FINAL_RIR    = 1 << 6;
        /// Trace each optimizer pass as it runs.
        const TRACE_PASSES       = 1 << 7;
    }
}

/// Flag names accepted in `PIR_DEBUG`, in bit order.
pub const FLAG_NAMES: &[(&str, DebugFlags)] = &[
    ("DryRun", DebugFlags::DRY_RUN),
    ("PreserveVersions", DebugFlags::PRESERVE_VERSIONS),
    ("ShowWarnings", DebugFlags::SHOW_WARNINGS),
    ("PrintEarlyRir", DebugFlags::PRINT_EARLY_RIR),
    ("PrintEarlyPir", DebugFlags::PRINT_EARLY_PIR),
    ("PrintOptimizedPir", DebugFlags::PRINT_OPTIMIZED_PIR),
    ("PrintFinalRir", DebugFlags::PRINT_FINAL_RIR),
    ("TracePasses", DebugFlags::TRACE_PASSES),
];

static MASK: AtomicU32 = AtomicU32::new(0);

/// The current process-wide mask.
#[must_use]
pub fn flags() -> DebugFlags {
    DebugFlags::from_bits_truncate(MASK.load(Ordering::Relaxed))
}

/// Replace the process-wide mask.
pub fn set_flags(f: DebugFlags) {
    MASK.store(f.bits(), Ordering::Relaxed);
}

/// Parse a comma-separated list of flag names. Empty segments are ignored.
pub fn parse_list(s: &str) -> Result<DebugFlags, String> {
    let mut flags = DebugFlags::empty();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match FLAG_NAMES.iter().find(|(name, _)| *name == part) {
            Some((_, f)) => flags |= *f,
            None => return Err(part.to_string()),
        }
    }
    Ok(flags)
}

/// Read `PIR_DEBUG` and install the resulting mask. Exits the process with
/// a listing of valid names if an unknown flag is present.
pub fn init_from_env() {
    let Ok(var) = std::env::var("PIR_DEBUG") else {
        return;
    };
    match parse_list(&var) {
        Ok(f) => set_flags(f),
        Err(unknown) => {
            eprintln!("Unknown PIR debug flag {unknown}");
            eprintln!("Valid flags are:");
            for (name, _) in FLAG_NAMES {
                eprintln!("- {name}");
            }
            std::process::exit(1);
        }
    }
}
