//! Operator confirmation
//!
//! Callers ask "retry?" after the engine reports a fatal failure. The engine
//! itself never prompts.

use inquire::Confirm as InquireConfirm;
use tracing::warn;

/// Synchronous yes/no question.
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// Asks on the terminal; defaults to yes, matching `(Y/n)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, question: &str) -> bool {
        match InquireConfirm::new(question).with_default(true).prompt() {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Prompt unavailable ({}), treating as no", e);
                false
            }
        }
    }
}

/// Never retries. Used for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Confirm for NonInteractive {
    fn confirm(&self, _question: &str) -> bool {
        false
    }
}
