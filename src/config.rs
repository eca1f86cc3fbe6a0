//! Configuration management module
//!
//! Two kinds of configuration live here:
//!
//! - The derivation constants. They are compiled in and immutable: the device
//!   derives the volume key from them, so changing any byte makes every volume
//!   formatted with the old values unrecoverable.
//! - [`AdapterConfig`], the per-invocation runtime settings (which wrapped
//!   tool to run, which pinentry to use, which named key to request).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{AdapterError, Result};

/// Hierarchical path of the key slot on the device.
pub const DERIVATION_PATH: &str = "m/10019'/1'";

/// Domain seed mixed into the derivation (the value the device decrypts).
pub const DOMAIN_SEED: [u8; 32] = [
    0xea, 0x30, 0xe0, 0xc7, 0x11, 0x4a, 0x64, 0x8b, 0x4a, 0xb3, 0x8f, 0xb9, 0xf1, 0x8a, 0x8d, 0xa1,
    0x56, 0x03, 0xbe, 0xd2, 0xa3, 0xba, 0x63, 0x18, 0xf0, 0xd2, 0xda, 0x47, 0x2a, 0x97, 0xfa, 0x48,
];

/// Domain initialization vector mixed into the derivation.
pub const DOMAIN_IV: [u8; 16] = [
    0xf9, 0xa1, 0x99, 0xec, 0xa6, 0x81, 0x78, 0x19, 0xcc, 0x67, 0x55, 0x61, 0x6e, 0xc3, 0x1e, 0xd8,
];

/// Key name requested when `--trezor-key-name` is not given.
pub const DEFAULT_KEY_NAME: &str = "luks";

/// The real cryptsetup binary, renamed out of the way of this adapter.
pub const DEFAULT_WRAPPED_TOOL: &str = "cryptsetup-origin";

/// Default pinentry program used for PIN and passphrase entry.
pub const DEFAULT_PINENTRY: &str = "pinentry";

/// Environment variable overriding the wrapped tool.
pub const WRAPPED_TOOL_ENV: &str = "CRYPTSETUP_TREZOR_ORIGIN";

/// Environment variable overriding the pinentry program.
pub const PINENTRY_ENV: &str = "CRYPTSETUP_TREZOR_PINENTRY";

/// Prefix shared by every LUKS subcommand of the wrapped tool.
pub const SUBCOMMAND_PREFIX: &str = "luks";

/// Wrapped-tool options whose value (`luks1`, `luks2`) carries the prefix
/// without being a subcommand.
pub const LUKS_TYPE_OPTIONS: [&str; 2] = ["--type", "-M"];

/// Arguments prepended to make the wrapped tool read key material from stdin.
pub const KEY_FILE_ARGS: [&str; 2] = ["--key-file", "-"];

/// Offset marking a hardened BIP32 index.
const HARDENED: u32 = 0x8000_0000;

/// A parsed BIP32 derivation path (`m/10019'/1'` → two hardened indices).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    indices: Vec<u32>,
}

impl DerivationPath {
    /// Raw indices with the hardened bit applied.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }
}

impl FromStr for DerivationPath {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        if parts.next() != Some("m") {
            return Err(AdapterError::derivation(format!(
                "derivation path must start with 'm': {}",
                s
            )));
        }

        let indices = parts
            .map(|part| {
                let (digits, hardened) = match part.strip_suffix('\'') {
                    Some(digits) => (digits, true),
                    None => (part, false),
                };
                let index: u32 = digits.parse().map_err(|_| {
                    AdapterError::derivation(format!("invalid path component '{}' in {}", part, s))
                })?;
                if index >= HARDENED {
                    return Err(AdapterError::derivation(format!(
                        "path component '{}' out of range in {}",
                        part, s
                    )));
                }
                Ok(if hardened { index | HARDENED } else { index })
            })
            .collect::<Result<Vec<u32>>>()?;

        Ok(Self { indices })
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for index in &self.indices {
            if index & HARDENED != 0 {
                write!(f, "/{}'", index & !HARDENED)?;
            } else {
                write!(f, "/{}", index)?;
            }
        }
        Ok(())
    }
}

/// The fixed derivation inputs, handed to the key request as one value.
///
/// Only constructible from the compiled-in constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationConstants {
    pub path: DerivationPath,
    pub seed: &'static [u8],
    pub iv: &'static [u8],
}

impl DerivationConstants {
    /// The constants every volume handled by this adapter was formatted with.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            path: DERIVATION_PATH.parse()?,
            seed: &DOMAIN_SEED,
            iv: &DOMAIN_IV,
        })
    }
}

/// Runtime settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Program run for every forwarded subcommand
    pub wrapped_tool: PathBuf,
    /// Program spoken to over Assuan for PIN entry
    pub pinentry: PathBuf,
    /// Logical key name requested from the device
    pub key_name: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            wrapped_tool: PathBuf::from(DEFAULT_WRAPPED_TOOL),
            pinentry: PathBuf::from(DEFAULT_PINENTRY),
            key_name: DEFAULT_KEY_NAME.to_string(),
        }
    }
}
