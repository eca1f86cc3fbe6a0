//! Trezor USB HID transport
//!
//! Messages travel in 64-byte reports. The first report starts with `?##`
//! followed by the message header (type, length); every continuation report
//! starts with a single `?`. Short reports are zero padded.
//!
//! Framing is kept separate from the HID device so it can be exercised
//! without hardware.

use std::time::Duration;

use tracing::trace;

use super::messages::{MessageType, TrezorMessage};
use crate::error::{AdapterError, Result};

/// SatoshiLabs vendor ID (Trezor One)
pub const TREZOR_ONE_VENDOR_ID: u16 = 0x534C;
pub const TREZOR_ONE_PRODUCT_ID: u16 = 0x0001;

/// pid.codes vendor ID used by Trezor Model T and later in HID mode
pub const TREZOR_T_VENDOR_ID: u16 = 0x1209;
pub const TREZOR_T_PRODUCT_ID: u16 = 0x53C1;

/// HID report size
pub const REPORT_SIZE: usize = 64;

/// Largest payload accepted from the device. Replies to this adapter are a
/// few hundred bytes at most.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// How long a continuation report may take once a message has started.
pub const CONTINUATION_TIMEOUT: Duration = Duration::from_secs(5);

const HEADER_MAGIC: &[u8] = b"?##";
const CONTINUATION_MAGIC: u8 = b'?';

/// A bidirectional message channel to one device.
pub trait Link {
    fn write_message(&mut self, message: &TrezorMessage) -> Result<()>;

    fn read_message(&mut self) -> Result<TrezorMessage>;

    /// Reopen the channel after the device dropped off the bus.
    fn reconnect(&mut self) -> Result<()>;
}

/// Split a message into zero-padded reports.
pub fn frame_message(message: &TrezorMessage) -> Vec<[u8; REPORT_SIZE]> {
    let mut data = HEADER_MAGIC[1..].to_vec();
    data.extend_from_slice(&message.serialize());

    data.chunks(REPORT_SIZE - 1)
        .map(|chunk| {
            let mut report = [0u8; REPORT_SIZE];
            report[0] = CONTINUATION_MAGIC;
            report[1..1 + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// Reassembles one message from incoming reports.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    header: Option<(MessageType, usize)>,
    payload: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message header has been seen but its payload is incomplete.
    pub fn in_progress(&self) -> bool {
        self.header.is_some()
    }

    /// Read timeout in milliseconds for the next report, `-1` meaning none.
    ///
    /// The first report of a reply can be held back by a button press or a
    /// PIN entered on the device, so there is no limit on it.
    pub fn read_timeout_ms(&self) -> i32 {
        if self.in_progress() {
            CONTINUATION_TIMEOUT.as_millis() as i32
        } else {
            -1
        }
    }

    /// Feed one report. Returns the message once its payload is complete.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<TrezorMessage>> {
        match self.header {
            None => {
                if report.len() < HEADER_MAGIC.len() + 6 || !report.starts_with(HEADER_MAGIC) {
                    return Err(AdapterError::transport("invalid first report from device"));
                }
                let body = &report[HEADER_MAGIC.len()..];
                let (msg_type, len) = TrezorMessage::parse_header(body)?;
                trace!("Incoming {} with {} payload bytes", msg_type, len);
                if len > MAX_MESSAGE_LEN {
                    return Err(AdapterError::transport(format!(
                        "device announced a {} byte message (limit {})",
                        len, MAX_MESSAGE_LEN
                    )));
                }
                self.header = Some((msg_type, len));
                self.payload.reserve(len);
                self.extend(&body[6..], len);
            }
            Some((_, len)) => {
                if report.first() != Some(&CONTINUATION_MAGIC) {
                    return Err(AdapterError::transport("invalid continuation report from device"));
                }
                self.extend(&report[1..], len);
            }
        }

        match self.header {
            Some((msg_type, len)) if self.payload.len() == len => {
                let payload = std::mem::take(&mut self.payload);
                self.header = None;
                Ok(Some(TrezorMessage::new(msg_type, payload)))
            }
            _ => Ok(None),
        }
    }

    fn extend(&mut self, data: &[u8], len: usize) {
        let wanted = len - self.payload.len();
        self.payload.extend_from_slice(&data[..wanted.min(data.len())]);
    }
}

#[cfg(feature = "trezor")]
pub use hid::HidLink;

#[cfg(feature = "trezor")]
mod hid {
    use std::ffi::CString;

    use hidapi::{HidApi, HidDevice};
    use tracing::{debug, info};

    use super::*;

    /// [`Link`] over a hidraw device.
    pub struct HidLink {
        api: HidApi,
        path: CString,
        device: HidDevice,
    }

    impl HidLink {
        pub fn open(api: HidApi, path: CString) -> Result<Self> {
            let device = api
                .open_path(&path)
                .map_err(|e| AdapterError::transport(format!("failed to open device: {}", e)))?;
            info!("Opened Trezor at {:?}", path);
            Ok(Self { api, path, device })
        }
    }

    impl Link for HidLink {
        fn write_message(&mut self, message: &TrezorMessage) -> Result<()> {
            debug!("Sending {:?}", message);
            for report in frame_message(message) {
                // Leading zero is the report ID hidapi expects
                let mut buf = [0u8; REPORT_SIZE + 1];
                buf[1..].copy_from_slice(&report);
                self.device
                    .write(&buf)
                    .map_err(|e| AdapterError::transport(format!("write failed: {}", e)))?;
            }
            Ok(())
        }

        fn read_message(&mut self) -> Result<TrezorMessage> {
            let mut assembler = MessageAssembler::new();
            loop {
                let mut report = [0u8; REPORT_SIZE];
                let read = self
                    .device
                    .read_timeout(&mut report, assembler.read_timeout_ms())
                    .map_err(|e| AdapterError::transport(format!("read failed: {}", e)))?;
                if read == 0 {
                    return Err(AdapterError::transport(format!(
                        "device stopped sending mid-message (no report within {:?})",
                        CONTINUATION_TIMEOUT
                    )));
                }
                if let Some(message) = assembler.push(&report[..read])? {
                    debug!("Received {:?}", message);
                    return Ok(message);
                }
            }
        }

        fn reconnect(&mut self) -> Result<()> {
            self.api
                .refresh_devices()
                .map_err(|e| AdapterError::transport(format!("HID rescan failed: {}", e)))?;
            self.device = self
                .api
                .open_path(&self.path)
                .map_err(|e| AdapterError::transport(format!("failed to reopen device: {}", e)))?;
            info!("Reconnected to Trezor at {:?}", self.path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(reports: &[[u8; REPORT_SIZE]]) -> TrezorMessage {
        let mut assembler = MessageAssembler::new();
        let (last, rest) = reports.split_last().unwrap();
        for report in rest {
            assert!(assembler.push(report).unwrap().is_none());
        }
        assembler.push(last).unwrap().unwrap()
    }

    #[test]
    fn test_first_report_header() {
        let msg = TrezorMessage::new(MessageType::CipherKeyValue, vec![0xAB; 4]);
        let reports = frame_message(&msg);
        assert_eq!(reports.len(), 1);

        let report = &reports[0];
        assert_eq!(&report[0..3], b"?##");
        assert_eq!(&report[3..5], &[0x00, 23]);
        assert_eq!(&report[5..9], &[0, 0, 0, 4]);
        assert_eq!(&report[9..13], &[0xAB; 4]);
        assert!(report[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_message_fits_one_report() {
        let reports = frame_message(&TrezorMessage::empty(MessageType::Initialize));
        assert_eq!(reports.len(), 1);
        assert_eq!(reassemble(&reports), TrezorMessage::empty(MessageType::Initialize));
    }

    #[test]
    fn test_report_boundaries() {
        // 55 payload bytes fill the first report exactly
        let exact = TrezorMessage::new(MessageType::PinMatrixAck, vec![7; 55]);
        assert_eq!(frame_message(&exact).len(), 1);

        let over = TrezorMessage::new(MessageType::PinMatrixAck, vec![7; 56]);
        let reports = frame_message(&over);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1][0], b'?');
        assert_eq!(reports[1][1], 7);
        assert_eq!(reports[1][2], 0);
    }

    #[test]
    fn test_multi_report_reassembly() {
        let payload: Vec<u8> = (0..=255).cycle().take(300).collect();
        let msg = TrezorMessage::new(MessageType::CipheredKeyValue, payload);
        let reports = frame_message(&msg);
        assert_eq!(reports.len(), 5);
        assert_eq!(reassemble(&reports), msg);
    }

    #[test]
    fn test_assembler_rejects_garbage() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(&[0u8; REPORT_SIZE]).is_err());

        let msg = TrezorMessage::new(MessageType::Success, vec![1; 100]);
        let reports = frame_message(&msg);
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(&reports[0]).unwrap().is_none());
        assert!(assembler.push(&[0u8; REPORT_SIZE]).is_err());
    }

    #[test]
    fn test_assembler_rejects_oversized_length() {
        let mut report = [0u8; REPORT_SIZE];
        report[..3].copy_from_slice(b"?##");
        report[3..5].copy_from_slice(&[0x00, 48]);
        report[5..9].copy_from_slice(&[0xFF; 4]);

        let mut assembler = MessageAssembler::new();
        let err = assembler.push(&report).unwrap_err();
        assert!(matches!(err, AdapterError::Transport(_)));
        assert!(!assembler.in_progress());
        assert_eq!(assembler.payload.capacity(), 0);
    }

    #[test]
    fn test_assembler_accepts_limit_length() {
        let mut report = [0u8; REPORT_SIZE];
        report[..3].copy_from_slice(b"?##");
        report[3..5].copy_from_slice(&[0x00, 48]);
        report[5..9].copy_from_slice(&(MAX_MESSAGE_LEN as u32).to_be_bytes());

        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(&report).unwrap().is_none());
        assert!(assembler.in_progress());
    }

    #[test]
    fn test_first_report_waits_without_limit() {
        let msg = TrezorMessage::new(MessageType::CipheredKeyValue, vec![3; 100]);
        let reports = frame_message(&msg);

        let mut assembler = MessageAssembler::new();
        assert_eq!(assembler.read_timeout_ms(), -1);

        assembler.push(&reports[0]).unwrap();
        assert_eq!(assembler.read_timeout_ms(), 5000);

        assert_eq!(assembler.push(&reports[1]).unwrap(), Some(msg));
        assert_eq!(assembler.read_timeout_ms(), -1);
    }

    #[test]
    fn test_assembler_is_reusable() {
        let mut assembler = MessageAssembler::new();
        let first = TrezorMessage::empty(MessageType::ButtonRequest);
        let second = TrezorMessage::new(MessageType::Failure, vec![8, 6]);
        assert_eq!(assembler.push(&frame_message(&first)[0]).unwrap(), Some(first));
        assert_eq!(assembler.push(&frame_message(&second)[0]).unwrap(), Some(second));
    }
}
