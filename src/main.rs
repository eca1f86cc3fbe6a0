//! cryptsetup-trezor - Main entry point
//!
//! Install as `cryptsetup` with the real binary renamed to `cryptsetup-origin`.

use std::io;

use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use cryptsetup_trezor::cli::Cli;
use cryptsetup_trezor::dispatch::{Completion, Dispatcher, Invocation};
use cryptsetup_trezor::error::{AdapterError, INVALID_ARGUMENT_CODE};
use cryptsetup_trezor::prompt::PinentryPrompter;
use cryptsetup_trezor::runner::SubprocessRunner;
use cryptsetup_trezor::{process_guard, wallet, DerivationConstants};

/// Initialize the logger
///
/// Logs go to stderr; stdout belongs to cryptsetup. RUST_LOG overrides the
/// default `warn` level.
fn init_logger() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}

fn main() {
    if let Err(e) = init_logger() {
        eprintln!("{:#}", e);
    }

    // Forward termination signals to cryptsetup instead of dying under it
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    let code = match run(cli) {
        Ok(Completion::Finished) => 0,
        Ok(Completion::UsageShown) => INVALID_ARGUMENT_CODE,
        Err(e) => {
            debug!("Invocation failed: {:?}", e);
            eprintln!("Got error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<Completion, AdapterError> {
    let config = cli.config();
    let constants = DerivationConstants::builtin()?;
    let invocation = Invocation::classify(cli.args, cli.help);

    debug!("Wallet backend: {}", wallet::BACKEND);
    let connector = wallet::default_connector();
    let mut prompter = PinentryPrompter::new(config.pinentry);
    let runner = SubprocessRunner::new(config.wrapped_tool);
    let mut console = io::stderr();

    let mut dispatcher = Dispatcher {
        connector: connector.as_ref(),
        prompter: &mut prompter,
        runner: &runner,
        console: &mut console,
        constants,
        key_name: config.key_name,
        usage: Cli::usage(),
    };
    dispatcher.dispatch(invocation)
}
