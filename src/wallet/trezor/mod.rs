//! Trezor hardware wallet backend
//!
//! Protocol handling (`messages`, `device`) is always built. The USB HID
//! link and the connector need `hidapi` and are behind the `trezor` feature.

pub mod device;
pub mod messages;
pub mod transport;

pub use device::{DeviceFeatures, TrezorDevice};
pub use transport::Link;

#[cfg(feature = "trezor")]
pub use connector::TrezorConnector;

#[cfg(feature = "trezor")]
mod connector {
    use hidapi::HidApi;
    use tracing::{debug, warn};

    use super::transport::{
        HidLink, TREZOR_ONE_PRODUCT_ID, TREZOR_ONE_VENDOR_ID, TREZOR_T_PRODUCT_ID,
        TREZOR_T_VENDOR_ID,
    };
    use super::TrezorDevice;
    use crate::error::{AdapterError, Result};
    use crate::wallet::{WalletConnector, WalletHandle};

    /// Opens the first Trezor found on the USB bus.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TrezorConnector;

    fn is_trezor(vendor_id: u16, product_id: u16) -> bool {
        matches!(
            (vendor_id, product_id),
            (TREZOR_ONE_VENDOR_ID, TREZOR_ONE_PRODUCT_ID) | (TREZOR_T_VENDOR_ID, TREZOR_T_PRODUCT_ID)
        )
    }

    impl WalletConnector for TrezorConnector {
        fn find_any(&self) -> Result<Box<dyn WalletHandle>> {
            let api = HidApi::new().map_err(|e| {
                AdapterError::device_not_found(format!("HID subsystem unavailable: {}", e))
            })?;

            let mut paths: Vec<_> = api
                .device_list()
                .filter(|info| is_trezor(info.vendor_id(), info.product_id()))
                // The debug-link interface also enumerates; only 0 carries the wallet protocol
                .filter(|info| info.interface_number() <= 0)
                .map(|info| info.path().to_owned())
                .collect();
            debug!("Found {} Trezor device(s)", paths.len());

            if paths.is_empty() {
                return Err(AdapterError::device_not_found(
                    "no Trezor is connected (check the cable and udev rules)",
                ));
            }
            if paths.len() > 1 {
                warn!("More than one Trezor connected, using the first");
            }
            let path = paths.swap_remove(0);

            let mut device = TrezorDevice::new(HidLink::open(api, path)?);
            device.initialize()?;
            Ok(Box::new(device))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_known_ids() {
            assert!(is_trezor(0x534C, 0x0001));
            assert!(is_trezor(0x1209, 0x53C1));
            assert!(!is_trezor(0x534C, 0x53C1));
            assert!(!is_trezor(0x2C97, 0x0001));
        }

        #[test]
        #[ignore] // Requires a connected device
        fn test_connect_to_trezor() {
            assert!(TrezorConnector.find_any().is_ok());
        }
    }
}
