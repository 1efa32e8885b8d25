//! cellvm CLI
//!
//! Runs a script file or a single expression:
//!
//! ```bash
//! cellvm script.cvm
//! cellvm --expr "1 + 2"
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`. Interpreter
//! settings come from `CELLVM_*` environment variables, overridden by the
//! flags below.

use cellvm_runtime::{Config, Flow, Interpreter, diagnostics, install_halt_handler};
use clap::Parser as ClapParser;
use std::io::Write;
use std::path::PathBuf;
use std::process;

/// Native stack reserved beyond the evaluator's own budget, for the
/// scanner, natives and reporting.
const STACK_HEADROOM: usize = 8 * 1024 * 1024;

#[derive(ClapParser, Debug)]
#[command(name = "cellvm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run cellvm scripts and expressions", long_about = None)]
struct Cli {
    /// Script file to run
    script: Option<PathBuf>,

    /// Evaluate an expression and print its result
    #[arg(short, long, conflicts_with = "script")]
    expr: Option<String>,

    /// Native stack bytes the evaluator may use
    #[arg(long, value_name = "BYTES")]
    stack_limit: Option<usize>,

    /// Disable garbage collection
    #[arg(long)]
    no_gc: bool,

    /// Print heap and arena statistics to stderr when done
    #[arg(long)]
    stats: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.script.is_none() && cli.expr.is_none() {
        eprintln!("cellvm: nothing to run (give a script or --expr)");
        process::exit(2);
    }

    let mut config = Config::from_env();
    if let Some(bytes) = cli.stack_limit {
        config = config.with_stack_limit(bytes);
    }
    if cli.no_gc {
        config = config.with_gc_disabled(true);
    }

    // the evaluator recurses on the native stack, so it gets a thread sized
    // for the configured limit
    let stack_size = config.stack_limit.saturating_add(STACK_HEADROOM);
    let worker = std::thread::Builder::new()
        .name("cellvm-main".to_string())
        .stack_size(stack_size)
        .spawn(move || run(cli, config));
    let code = match worker.map(|handle| handle.join()) {
        Ok(Ok(code)) => code,
        Ok(Err(_)) => {
            // the panic message was already printed by the default hook
            70
        }
        Err(e) => {
            eprintln!("cellvm: cannot start interpreter thread: {e}");
            71
        }
    };
    process::exit(code);
}

fn run(cli: Cli, config: Config) -> i32 {
    diagnostics::install_signal_handler();
    let mut interp = Interpreter::new(config);
    let halt = match install_halt_handler(&interp) {
        Ok(handler) => Some(handler),
        Err(e) => {
            tracing::warn!(error = %e, "SIGINT will not halt evaluation");
            None
        }
    };

    let result = match (&cli.expr, &cli.script) {
        (Some(expr), _) => interp.run_text(expr).map(|value| {
            if !value.is_void() {
                println!("== {}", interp.mold(&value));
            }
        }),
        (None, Some(path)) => interp.run_file(path).map(|_| ()),
        (None, None) => Ok(()),
    };

    let code = match result {
        Ok(()) => 0,
        Err(flow) => {
            let _ = std::io::stdout().flush();
            eprintln!("{}", interp.report(&flow));
            match flow {
                Flow::Halt => 130,
                _ => 1,
            }
        }
    };

    if cli.stats {
        let heap = interp.heap.stats();
        let arena = interp.arena_stats();
        eprintln!(
            "heap: {} live bytes ({} peak), {} series allocated, {} freed, {} collections",
            heap.live_bytes,
            heap.peak_bytes,
            heap.series_allocated,
            heap.series_freed,
            heap.collections
        );
        eprintln!(
            "arena: {} allocated, {} reused, {} stolen, {} discarded",
            arena.allocated, arena.reused, arena.stolen, arena.discarded
        );
    }

    if let Some(handler) = halt {
        handler.uninstall();
    }
    code
}
