//! SIGINT as a cooperative halt
//!
//! The handler only sets the interpreter's halt flag (signal-hook's
//! `flag::register`, which is async-signal-safe). The evaluator polls the
//! flag at each expression boundary and unwinds with `Flow::Halt`, so no
//! evaluator code ever runs in signal context.
//!
//! Off Unix, or without the `signals` feature, installing is a no-op and
//! halts can still be requested with [`Interpreter::request_halt`].

use crate::interpreter::Interpreter;

/// Handle returned by [`install_halt_handler`]; dropping it keeps the
/// handler installed, [`HaltHandler::uninstall`] removes it.
#[derive(Debug)]
pub struct HaltHandler {
    #[cfg(all(unix, feature = "signals"))]
    id: signal_hook::SigId,
}

impl HaltHandler {
    pub fn uninstall(self) {
        #[cfg(all(unix, feature = "signals"))]
        {
            let removed = signal_hook::low_level::unregister(self.id);
            tracing::debug!(removed, "SIGINT halt handler removed");
        }
    }
}

/// Make SIGINT request a halt of `interp`.
pub fn install_halt_handler(interp: &Interpreter) -> std::io::Result<HaltHandler> {
    #[cfg(all(unix, feature = "signals"))]
    {
        let id = signal_hook::flag::register(signal_hook::consts::SIGINT, interp.halt_flag())?;
        tracing::debug!("SIGINT halt handler installed");
        Ok(HaltHandler { id })
    }

    #[cfg(not(all(unix, feature = "signals")))]
    {
        let _ = interp;
        Ok(HaltHandler {})
    }
}
