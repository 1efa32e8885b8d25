//! Runtime diagnostics for production debugging
//!
//! A SIGQUIT (kill -3) handler dumps heap statistics to stderr without
//! stopping the process:
//!
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! ## Signal Safety
//!
//! The dump does I/O and reads the statistics registry, which is not
//! async-signal-safe. A dedicated thread waits on signal-hook's iterator
//! and does the work there instead of inside the handler.

use cellvm_core::memory_stats::heap_registry;
use std::sync::Once;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT handler. Idempotent; does nothing off Unix or
/// without the `diagnostics` feature.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(all(unix, feature = "diagnostics"))]
        {
            use signal_hook::consts::SIGQUIT;
            use signal_hook::iterator::Signals;

            let mut signals = match Signals::new([SIGQUIT]) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "could not register SIGQUIT diagnostics");
                    return;
                }
            };

            let spawned = std::thread::Builder::new()
                .name("cellvm-diagnostics".to_string())
                .spawn(move || {
                    for sig in signals.forever() {
                        if sig == SIGQUIT {
                            dump_diagnostics();
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "could not start diagnostics thread");
            }
        }
    });
}

/// Write the diagnostics report to stderr.
pub fn dump_diagnostics() {
    use std::io::Write;
    let report = diagnostics_report();
    let _ = std::io::stderr().lock().write_all(report.as_bytes());
}

/// The report [`dump_diagnostics`] prints.
pub fn diagnostics_report() -> String {
    use std::fmt::Write;

    let registry = heap_registry();
    let stats = registry.aggregate_stats();
    let mut out = String::new();

    let _ = writeln!(out, "\n=== cellvm Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    let _ = writeln!(out, "\n[Heaps]");
    let _ = writeln!(
        out,
        "  Threads:     {} (of {} tracked)",
        stats.active_threads,
        registry.capacity()
    );
    let _ = writeln!(out, "  Live bytes:  {}", stats.total_heap_bytes);
    let _ = writeln!(out, "  Peak bytes:  {}", stats.total_peak_heap_bytes);
    let _ = writeln!(out, "  Live series: {}", stats.total_live_series);
    let _ = writeln!(out, "  Collections: {}", stats.total_collections);
    if stats.overflow_count > 0 {
        let _ = writeln!(
            out,
            "  WARNING: {} threads exceeded registry capacity (not tracked)",
            stats.overflow_count
        );
    }
    let _ = writeln!(out, "\n=== End Diagnostics ===");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::interpreter::Interpreter;

    #[test]
    fn test_report_counts_this_thread() {
        let mut interp = Interpreter::new(Config::default());
        interp.recycle();
        let report = diagnostics_report();
        assert!(report.contains("[Heaps]"));
        assert!(report.contains("Collections:"));
    }

    #[test]
    fn test_install_is_idempotent() {
        install_signal_handler();
        install_signal_handler();
    }
}
