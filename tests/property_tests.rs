//! Property-based tests for cryptsetup-trezor
//!
//! These tests verify:
//! - Classification only depends on the first `luks*` argument
//! - Key-requiring argument lists are the originals behind `--key-file -`
//! - Key bytes reach the wrapped tool unchanged, whatever they contain
//! - HID framing reassembles every payload size

use proptest::prelude::*;
use strum::IntoEnumIterator;

use cryptsetup_trezor::dispatch::{with_key_file_args, Invocation, KeyedCommand};
use cryptsetup_trezor::runner::{StdinSource, SubprocessRunner, ToolRunner};
use cryptsetup_trezor::wallet::trezor::messages::{MessageType, TrezorMessage};
use cryptsetup_trezor::wallet::trezor::transport::{frame_message, MessageAssembler, REPORT_SIZE};
use cryptsetup_trezor::wallet::DerivedKey;

/// Arguments that never look like a LUKS subcommand
fn plain_arg() -> impl Strategy<Value = String> {
    "[-a-km-z0-9/=_.]{0,12}".prop_filter("must not start with luks or take a LUKS type", |s| {
        !s.starts_with("luks") && s != "--type"
    })
}

fn keyed_command() -> impl Strategy<Value = KeyedCommand> {
    proptest::sample::select(KeyedCommand::iter().collect::<Vec<_>>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Without a `luks*` argument the invocation is always usage
    #[test]
    fn no_luks_argument_is_usage(args in prop::collection::vec(plain_arg(), 0..6)) {
        prop_assert_eq!(Invocation::classify(args, false), Invocation::Usage);
    }

    /// A keyed subcommand anywhere after plain arguments is found
    #[test]
    fn keyed_command_found_after_options(
        before in prop::collection::vec(plain_arg(), 0..4),
        command in keyed_command(),
        after in prop::collection::vec("[ -~]{0,12}", 0..4),
    ) {
        let mut args = before;
        args.push(command.to_string());
        args.extend(after);

        match Invocation::classify(args.clone(), false) {
            Invocation::KeyRequired { command: found, args: kept } => {
                prop_assert_eq!(found, command);
                prop_assert_eq!(kept, args);
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    /// Other `luks*` words forward the argument list untouched
    #[test]
    fn other_luks_words_pass_through(
        suffix in "[A-Za-z]{0,10}",
        rest in prop::collection::vec("[ -~]{0,12}", 0..4),
    ) {
        let word = format!("luks{}", suffix);
        prop_assume!(word.parse::<KeyedCommand>().is_err());

        let mut args = vec![word];
        args.extend(rest);
        prop_assert_eq!(
            Invocation::classify(args.clone(), false),
            Invocation::PassThrough { args }
        );
    }

    /// The key-file flag is prepended, nothing else changes
    #[test]
    fn key_file_args_prefix(args in prop::collection::vec("[ -~]{0,12}", 0..8)) {
        let full = with_key_file_args(&args);
        prop_assert_eq!(&full[..2], &["--key-file".to_string(), "-".to_string()][..]);
        prop_assert_eq!(&full[2..], &args[..]);
    }

    /// Frames always reassemble to the original message
    #[test]
    fn framing_reassembles(payload in prop::collection::vec(any::<u8>(), 0..600)) {
        let message = TrezorMessage::new(MessageType::CipheredKeyValue, payload);
        let reports = frame_message(&message);
        prop_assert!(reports.iter().all(|r| r.len() == REPORT_SIZE && r[0] == b'?'));

        let mut assembler = MessageAssembler::new();
        let mut result = None;
        for report in &reports {
            prop_assert!(result.is_none());
            result = assembler.push(report).unwrap();
        }
        prop_assert_eq!(result, Some(message));
    }
}

proptest! {
    // Spawns a process per case
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever the device returns is exactly what the wrapped tool reads
    #[test]
    fn key_bytes_reach_tool_unchanged(key in prop::collection::vec(any::<u8>(), 1..256)) {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdin.bin");
        let args: Vec<String> = vec![
            "-c".into(),
            "cat > \"$1\"".into(),
            "sh".into(),
            out.to_string_lossy().into_owned(),
        ];

        SubprocessRunner::new("sh")
            .run(&args, StdinSource::Key(DerivedKey::new(key.clone())))
            .unwrap();
        prop_assert_eq!(std::fs::read(&out).unwrap(), key);
    }
}
