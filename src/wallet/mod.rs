//! Hardware wallet seam
//!
//! The adapter only needs one thing from a wallet: "derive the key at this
//! path for this name". Everything device specific sits behind
//! [`WalletConnector`] and [`WalletHandle`]. User interaction the device
//! asks for mid-request (PIN, passphrase, reconnect confirmation) goes
//! through the [`UserInteraction`] capability passed into the call.

pub mod trezor;

use std::fmt;
use std::io::{Cursor, Read};

use secrecy::{ExposeSecret, SecretString, SecretVec};

use crate::config::DerivationConstants;
use crate::error::{AdapterError, Result};
use crate::prompt::PromptText;

/// Everything the device needs to derive one named key.
#[derive(Debug, Clone, Copy)]
pub struct KeyRequest<'a> {
    pub constants: &'a DerivationConstants,
    pub key_name: &'a str,
}

/// Raw key bytes returned by the device.
///
/// The bytes are wiped when the value is dropped. `Debug` never shows them.
pub struct DerivedKey(SecretVec<u8>);

impl DerivedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(SecretVec::new(bytes))
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    /// Read-once view over the key bytes, for feeding a child's stdin.
    pub fn reader(&self) -> impl Read + '_ {
        Cursor::new(self.0.expose_secret().as_slice())
    }

    /// Borrow the raw bytes.
    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey([REDACTED; {} bytes])", self.len())
    }
}

/// What a device may ask of the user while a request is in flight.
pub trait UserInteraction {
    /// Ask for a PIN (or passphrase). Cancellation is an error.
    fn request_pin(&mut self, prompt: &PromptText) -> Result<SecretString>;

    /// Ask whether to carry on after the device session was interrupted.
    fn confirm(&mut self, prompt: &PromptText) -> bool;
}

/// An open session with one device.
///
/// Dropping the handle releases the device.
pub trait WalletHandle {
    fn derive_key(
        &mut self,
        request: &KeyRequest<'_>,
        interaction: &mut dyn UserInteraction,
    ) -> Result<DerivedKey>;
}

/// Finds an attached device and opens a session with it.
pub trait WalletConnector {
    /// Open any single attached device. Fails with
    /// [`AdapterError::DeviceNotFound`] when nothing is attached.
    fn find_any(&self) -> Result<Box<dyn WalletHandle>>;
}

/// Connector used when the binary was built without a device backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackend;

impl WalletConnector for NoBackend {
    fn find_any(&self) -> Result<Box<dyn WalletHandle>> {
        Err(AdapterError::device_not_found(
            "built without hardware wallet support (--no-default-features)",
        ))
    }
}

/// Name of the backend [`default_connector`] returns.
#[cfg(feature = "trezor")]
pub const BACKEND: &str = "trezor";
#[cfg(not(feature = "trezor"))]
pub const BACKEND: &str = "none";

/// The connector the binary uses.
pub fn default_connector() -> Box<dyn WalletConnector> {
    #[cfg(feature = "trezor")]
    {
        Box::new(trezor::TrezorConnector::default())
    }
    #[cfg(not(feature = "trezor"))]
    {
        Box::new(NoBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_key_debug_is_redacted() {
        let key = DerivedKey::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let shown = format!("{:?}", key);
        assert_eq!(shown, "DerivedKey([REDACTED; 4 bytes])");
        assert!(!shown.contains("222"));
    }

    #[test]
    fn test_derived_key_reader_yields_exact_bytes() {
        let key = DerivedKey::new(vec![1, 2, 3, 0, 255]);
        let mut out = Vec::new();
        key.reader().read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0, 255]);
    }

    #[test]
    #[cfg(feature = "trezor")]
    fn test_default_build_has_trezor_backend() {
        assert_eq!(BACKEND, "trezor");
    }

    #[test]
    #[cfg(not(feature = "trezor"))]
    fn test_stripped_build_reports_missing_device() {
        assert_eq!(BACKEND, "none");
        let result = default_connector().find_any();
        assert!(matches!(result, Err(AdapterError::DeviceNotFound(_))));
    }

    #[test]
    fn test_no_backend_reports_missing_device() {
        let result = NoBackend.find_any();
        assert!(matches!(result, Err(AdapterError::DeviceNotFound(_))));
    }
}
