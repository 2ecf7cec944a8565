//! Interactive password fallback
//!
//! Used only when no key authenticates and the configuration allows prompting.

use dialoguer::Password;
use tracing::debug;

/// Source of a gateway password. Called from a blocking thread.
pub trait PasswordPrompt: Send + Sync {
    /// `None` means the user declined or no terminal is available.
    fn password(&self, prompt: &str) -> Option<String>;
}

/// Reads the password from the controlling terminal without echo
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn password(&self, prompt: &str) -> Option<String> {
        match Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
        {
            Ok(password) => Some(password),
            Err(e) => {
                debug!("Password prompt unavailable: {}", e);
                None
            }
        }
    }
}

/// Never answers. For non-interactive callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl PasswordPrompt for NoPrompt {
    fn password(&self, _prompt: &str) -> Option<String> {
        None
    }
}
