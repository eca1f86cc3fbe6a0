//! Secret prompting
//!
//! [`SecretPrompter`] is the seam between the key request and whatever UI
//! collects the PIN. The binary uses [`PinentryPrompter`], which talks to a
//! pinentry program over the Assuan protocol.

pub mod pinentry;

use std::path::PathBuf;

use secrecy::SecretString;
use tracing::debug;

use crate::error::Result;

pub use pinentry::PinentryClient;

/// Texts shown by the prompt dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptText {
    pub title: String,
    pub description: String,
    pub ok: String,
    pub cancel: String,
}

impl PromptText {
    /// Dialog with the default button labels.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ok: "OK".to_string(),
            cancel: "Cancel".to_string(),
        }
    }

    pub fn with_buttons(mut self, ok: impl Into<String>, cancel: impl Into<String>) -> Self {
        self.ok = ok.into();
        self.cancel = cancel.into();
        self
    }
}

/// Collects a secret from the user.
pub trait SecretPrompter {
    /// Show the dialog and return what was typed.
    ///
    /// A cancelled dialog is [`crate::error::AdapterError::PinCancelled`].
    fn get_pin(&mut self, text: &PromptText) -> Result<SecretString>;
}

/// [`SecretPrompter`] backed by a pinentry program.
///
/// The pinentry session is opened on the first request and closed when the
/// prompter is dropped, so a run that never needs a PIN never starts one.
#[derive(Debug)]
pub struct PinentryPrompter {
    program: PathBuf,
    session: Option<PinentryClient>,
}

impl PinentryPrompter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            session: None,
        }
    }

    /// Whether a pinentry process has been started.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn session(&mut self) -> Result<&mut PinentryClient> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                debug!("Starting pinentry session: {}", self.program.display());
                PinentryClient::open(&self.program)?
            }
        };
        Ok(self.session.insert(session))
    }
}

impl SecretPrompter for PinentryPrompter {
    fn get_pin(&mut self, text: &PromptText) -> Result<SecretString> {
        let session = self.session()?;
        session.set_title(&text.title)?;
        session.set_description(&text.description)?;
        session.set_prompt(&text.title)?;
        session.set_ok(&text.ok)?;
        session.set_cancel(&text.cancel)?;
        session.get_pin()
    }
}

impl Drop for PinentryPrompter {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                debug!("pinentry did not close cleanly: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_text_defaults() {
        let text = PromptText::new("PIN", "Enter PIN");
        assert_eq!(text.ok, "OK");
        assert_eq!(text.cancel, "Cancel");

        let text = text.with_buttons("Unlock", "Abort");
        assert_eq!(text.ok, "Unlock");
        assert_eq!(text.cancel, "Abort");
    }

    #[test]
    fn test_prompter_is_lazy() {
        let prompter = PinentryPrompter::new("/nonexistent/pinentry");
        assert!(!prompter.is_open());
        // Dropping an unopened prompter must not try to spawn anything
        drop(prompter);
    }

    #[test]
    fn test_missing_pinentry_is_prompt_error() {
        let mut prompter = PinentryPrompter::new("/nonexistent/pinentry");
        let result = prompter.get_pin(&PromptText::new("PIN", "Enter PIN"));
        assert!(matches!(
            result,
            Err(crate::error::AdapterError::Prompt(_))
        ));
        assert!(!prompter.is_open());
    }
}
