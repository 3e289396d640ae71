//! Keyboard-Interactive Authentication (2FA) Support
//!
//! The protocol engine blocks inside its native call until every prompt of a
//! round has been answered, so prompts are relayed to a handler synchronously
//! rather than through events.
//!
//! # Flow
//!
//! ```text
//! Server                    Engine                     Handler
//!    │── INFO_REQUEST ──────▶│                            │
//!    │                       │── respond(name, prompts) ─▶│
//!    │                       │◀──────── responses ────────│
//!    │◀── INFO_RESPONSE ─────│                            │
//!    │        ... zero or more rounds ...                  │
//!    │── SUCCESS/FAILURE ───▶│                            │
//! ```

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// Answers one keyboard-interactive round
///
/// Must return one response per prompt, in order, and must return promptly:
/// it runs on the connection's worker thread inside a native call.
pub trait KeyboardInteractiveHandler {
    fn respond(&mut self, name: &str, instructions: &str, prompts: &[KbiPrompt]) -> Vec<String>;
}

impl<F> KeyboardInteractiveHandler for F
where
    F: FnMut(&str, &str, &[KbiPrompt]) -> Vec<String>,
{
    fn respond(&mut self, name: &str, instructions: &str, prompts: &[KbiPrompt]) -> Vec<String> {
        self(name, instructions, prompts)
    }
}

/// Answers every prompt of every round with the same secret
pub struct StaticResponse {
    response: Zeroizing<String>,
    rounds: usize,
}

impl StaticResponse {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: Zeroizing::new(response.into()),
            rounds: 0,
        }
    }

    /// Number of rounds answered so far
    pub fn rounds(&self) -> usize {
        self.rounds
    }
}

impl KeyboardInteractiveHandler for StaticResponse {
    fn respond(&mut self, _name: &str, _instructions: &str, prompts: &[KbiPrompt]) -> Vec<String> {
        self.rounds += 1;
        prompts.iter().map(|_| self.response.to_string()).collect()
    }
}
