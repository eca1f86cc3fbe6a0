//! cryptsetup-trezor library
//!
//! Core of a cryptsetup wrapper that replaces passphrase entry with a key
//! derived on a hardware wallet. The binary in `main.rs` wires these pieces
//! together; tests drive them with fake collaborators.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod key_request;
pub mod process_guard;
pub mod prompt;
pub mod runner;
pub mod wallet;

// Re-export main types for convenience
pub use config::{AdapterConfig, DerivationConstants, DerivationPath};
pub use dispatch::{Completion, Dispatcher, Invocation, KeyedCommand};
pub use error::{AdapterError, GENERIC_FAILURE_CODE, INVALID_ARGUMENT_CODE};
pub use key_request::{request_key, PromptInteraction};
pub use prompt::{PinentryPrompter, PromptText, SecretPrompter};
pub use runner::{StdinSource, SubprocessRunner, ToolRunner};
pub use wallet::{DerivedKey, KeyRequest, UserInteraction, WalletConnector, WalletHandle};
