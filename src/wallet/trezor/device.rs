//! Trezor device session
//!
//! Drives the request/reply loop for one derivation. The device may answer a
//! request with its own requests (PIN matrix, passphrase, button press)
//! before it sends the result; each is answered here, with the user asked
//! through [`UserInteraction`].

use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::messages::{
    self, FieldValue, MessageType, TrezorMessage, FAILURE_ACTION_CANCELLED, FAILURE_PIN_CANCELLED,
    FAILURE_PIN_INVALID,
};
use super::transport::Link;
use crate::error::{AdapterError, Result};
use crate::prompt::PromptText;
use crate::wallet::{DerivedKey, KeyRequest, UserInteraction, WalletHandle};

const PIN_MATRIX_DESCRIPTION: &str = "Enter the PIN using the layout shown on the Trezor.\n\n\
     7 8 9\n4 5 6\n1 2 3";

/// Identity reported in `Features`, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub vendor: String,
    pub label: String,
    pub version: (u64, u64, u64),
}

impl DeviceFeatures {
    fn parse(payload: &[u8]) -> Self {
        let mut features = Self::default();
        let Ok(fields) = messages::decode_fields(payload) else {
            return features;
        };
        for (field, value) in fields {
            match (field, value) {
                (1, FieldValue::Bytes(v)) => features.vendor = String::from_utf8_lossy(v).into_owned(),
                (2, FieldValue::Varint(v)) => features.version.0 = v,
                (3, FieldValue::Varint(v)) => features.version.1 = v,
                (4, FieldValue::Varint(v)) => features.version.2 = v,
                (10, FieldValue::Bytes(v)) => features.label = String::from_utf8_lossy(v).into_owned(),
                _ => {}
            }
        }
        features
    }
}

/// An initialized session over some [`Link`].
pub struct TrezorDevice<L: Link> {
    link: L,
}

impl<L: Link> TrezorDevice<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    /// Reset the device session and read its features.
    pub fn initialize(&mut self) -> Result<DeviceFeatures> {
        let reply = self.exchange(&TrezorMessage::empty(MessageType::Initialize))?;
        if reply.msg_type != MessageType::Features {
            return Err(AdapterError::transport(format!(
                "expected Features, device sent {}",
                reply.msg_type
            )));
        }
        let features = DeviceFeatures::parse(&reply.payload);
        info!(
            "Trezor '{}' ({}) firmware {}.{}.{}",
            features.label,
            features.vendor,
            features.version.0,
            features.version.1,
            features.version.2
        );
        Ok(features)
    }

    fn exchange(&mut self, message: &TrezorMessage) -> Result<TrezorMessage> {
        self.link.write_message(message)?;
        self.link.read_message()
    }

    /// Send `request` and answer the device until it produces a result.
    ///
    /// A lost connection is only retried (once) if the user confirms it.
    pub fn call(
        &mut self,
        request: &TrezorMessage,
        interaction: &mut dyn UserInteraction,
    ) -> Result<TrezorMessage> {
        let mut reconnected = false;
        let mut outgoing = request.clone();
        loop {
            let reply = match self.exchange(&outgoing) {
                Ok(reply) => reply,
                Err(AdapterError::Transport(reason)) => {
                    warn!("Lost the device mid-request: {}", reason);
                    let retry = !reconnected
                        && interaction.confirm(&PromptText::new(
                            "Trezor disconnected",
                            "The device session was interrupted. Reconnect and send the request again?",
                        ));
                    if !retry {
                        return Err(AdapterError::derivation(format!(
                            "device disconnected during the request ({})",
                            reason
                        )));
                    }
                    self.link.reconnect()?;
                    self.initialize()?;
                    reconnected = true;
                    outgoing = request.clone();
                    continue;
                }
                Err(e) => return Err(e),
            };

            outgoing = match reply.msg_type {
                MessageType::ButtonRequest => {
                    debug!("Waiting for confirmation on the device");
                    TrezorMessage::empty(MessageType::ButtonAck)
                }
                MessageType::PinMatrixRequest => self.answer_pin_matrix(interaction)?,
                MessageType::PassphraseRequest => self.answer_passphrase(interaction)?,
                MessageType::Failure => return Err(failure_error(&reply.payload)),
                _ => return Ok(reply),
            };
        }
    }

    fn answer_pin_matrix(&mut self, interaction: &mut dyn UserInteraction) -> Result<TrezorMessage> {
        let prompt = PromptText::new("Trezor PIN", PIN_MATRIX_DESCRIPTION).with_buttons("OK", "Cancel");
        let pin = match interaction.request_pin(&prompt) {
            Ok(pin) => pin,
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        };
        let digits = pin.expose_secret();
        if digits.is_empty() || !digits.chars().all(|c| ('1'..='9').contains(&c)) {
            self.cancel();
            return Err(AdapterError::derivation(
                "PIN may only contain the digits 1-9 as laid out on the device",
            ));
        }
        Ok(messages::pin_matrix_ack(digits))
    }

    fn answer_passphrase(&mut self, interaction: &mut dyn UserInteraction) -> Result<TrezorMessage> {
        let prompt = PromptText::new("Trezor passphrase", "Enter the wallet passphrase.")
            .with_buttons("OK", "Cancel");
        match interaction.request_pin(&prompt) {
            Ok(passphrase) => Ok(messages::passphrase_ack(passphrase.expose_secret())),
            Err(e) => {
                self.cancel();
                Err(e)
            }
        }
    }

    /// Abort the pending request so the device returns to its home screen.
    fn cancel(&mut self) {
        if let Err(e) = self.exchange(&TrezorMessage::empty(MessageType::Cancel)) {
            debug!("Cancel was not acknowledged: {}", e);
        }
    }
}

fn failure_error(payload: &[u8]) -> AdapterError {
    let (code, message) = messages::parse_failure(payload);
    let reason = match code {
        Some(FAILURE_PIN_INVALID) => "incorrect PIN".to_string(),
        Some(FAILURE_PIN_CANCELLED) => "PIN entry cancelled on the device".to_string(),
        Some(FAILURE_ACTION_CANCELLED) => "request cancelled on the device".to_string(),
        _ => message,
    };
    AdapterError::derivation(reason)
}

impl<L: Link> WalletHandle for TrezorDevice<L> {
    fn derive_key(
        &mut self,
        request: &KeyRequest<'_>,
        interaction: &mut dyn UserInteraction,
    ) -> Result<DerivedKey> {
        let constants = request.constants;
        let message = messages::cipher_key_value(
            constants.path.indices(),
            request.key_name,
            constants.seed,
            constants.iv,
        );
        let reply = self.call(&message, interaction)?;
        if reply.msg_type != MessageType::CipheredKeyValue {
            return Err(AdapterError::derivation(format!(
                "unexpected reply {} to the key request",
                reply.msg_type
            )));
        }
        Ok(DerivedKey::new(messages::parse_ciphered_value(&reply.payload)?))
    }
}
