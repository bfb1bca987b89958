//! Unix signal wiring for the interrupt flag
//!
//! Signal handlers run in an interrupt context where almost nothing is
//! safe; the only thing this module ever does there is set an atomic flag.
//! The evaluator polls that flag at every forcing and unwinds with
//! `EvalError::Interrupted`, restoring any claimed thunk on the way out.

#![cfg(all(unix, feature = "signals"))]

use std::io;

use crate::eval::Evaluator;

/// Route SIGINT to the evaluator's interrupt flag.
///
/// Registration lasts for the life of the process; clearing the flag
/// (`Evaluator::clear_interrupt`) re-arms evaluation after an interrupt.
pub fn install_sigint_handler(evaluator: &Evaluator) -> io::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, evaluator.interrupt_flag())?;
    Ok(())
}
