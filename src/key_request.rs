//! Key request orchestration
//!
//! Opens a device session, lends it the user-interaction capability and asks
//! for the named key with the compiled-in derivation constants.
//!
//! # Ordering
//!
//! Device discovery happens before anything is shown to the user: with no
//! device attached the run fails without a PIN prompt.
//!
//! # Confirmation policy
//!
//! [`PromptInteraction::confirm`] always answers "no". A device asks for
//! confirmation when its session was lost mid-request; the run then fails
//! and the user restarts the command.

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::config::DerivationConstants;
use crate::error::{AdapterError, Result};
use crate::prompt::{PromptText, SecretPrompter};
use crate::wallet::{DerivedKey, KeyRequest, UserInteraction, WalletConnector};

/// [`UserInteraction`] over a [`SecretPrompter`].
pub struct PromptInteraction<'p> {
    prompter: &'p mut dyn SecretPrompter,
}

impl<'p> PromptInteraction<'p> {
    pub fn new(prompter: &'p mut dyn SecretPrompter) -> Self {
        Self { prompter }
    }
}

impl UserInteraction for PromptInteraction<'_> {
    fn request_pin(&mut self, prompt: &PromptText) -> Result<SecretString> {
        debug!("Device requested a secret: {}", prompt.title);
        self.prompter.get_pin(prompt)
    }

    fn confirm(&mut self, prompt: &PromptText) -> bool {
        warn!(
            "Refusing device confirmation request '{}'; restart the command to retry",
            prompt.title
        );
        false
    }
}

/// Derive the key named `key_name` from any attached device.
///
/// Failures are returned as-is; nothing here retries.
pub fn request_key(
    connector: &dyn WalletConnector,
    prompter: &mut dyn SecretPrompter,
    constants: &DerivationConstants,
    key_name: &str,
) -> Result<DerivedKey> {
    let mut wallet = connector.find_any()?;
    info!(
        "Requesting key '{}' at {} from the hardware wallet",
        key_name, constants.path
    );

    let request = KeyRequest {
        constants,
        key_name,
    };
    let mut interaction = PromptInteraction::new(prompter);
    let key = wallet.derive_key(&request, &mut interaction)?;
    drop(wallet);

    if key.is_empty() {
        return Err(AdapterError::derivation("device returned an empty key"));
    }
    debug!("Received {} key bytes", key.len());
    Ok(key)
}
