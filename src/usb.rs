//! The usb hub: finds attached phones, drives them through the accessory
//! protocol query chain and hands their bulk endpoints to the session.

use futures::StreamExt;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Direction, Recipient};
use tokio_util::sync::CancellationToken;

/// The accessory protocol request to read the protocol version
const ACCESSORY_GET_PROTOCOL: u8 = 51;
/// The accessory protocol request to send one identification string
const ACCESSORY_SEND_STRING: u8 = 52;
/// The accessory protocol request to switch the device into accessory mode
const ACCESSORY_START: u8 = 53;

/// The vendor id devices re-enumerate with in accessory mode
const ACCESSORY_VID: u16 = 0x18d1;
/// The product ids of accessory mode, with and without adb
const ACCESSORY_PIDS: [u16; 2] = [0x2d00, 0x2d01];

/// The identification strings sent during the query chain, in index order
const IDENTIFICATION: [(u16, &str); 6] = [
    (0, "Android"),
    (1, "Android Auto"),
    (2, "Head Unit Application"),
    (3, "1.0"),
    (4, "https://github.com/uglyoldbob/headlink"),
    (5, "HU-00000001"),
];

/// Errors from the usb hub
#[derive(Debug)]
pub enum UsbError {
    /// The hub was stopped
    Aborted,
    /// Another promotion is already running for this device
    InProgress,
    /// The usb layer could not be initialized
    Init(std::io::Error),
    /// A device refused or failed the query chain
    Device(std::io::Error),
}

/// The bulk endpoints of a device in accessory mode, ready for a transport
pub struct AccessoryEndpoints {
    /// The claimed accessory interface
    pub(crate) interface: nusb::Interface,
    /// The bulk-in endpoint address
    pub(crate) in_ep: u8,
    /// The bulk-out endpoint address
    pub(crate) out_ep: u8,
}

/// Is this the vid/pid pair of a device already in accessory mode?
fn is_accessory(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == ACCESSORY_VID && ACCESSORY_PIDS.contains(&product_id)
}

/// Watches for phones and promotes them into accessory mode.
pub struct AoapHub {
    /// Cancelled when the hub is stopped
    cancel: CancellationToken,
}

impl AoapHub {
    /// construct a new self
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the hub, aborting any wait in progress
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until a device in accessory mode is available and claim its
    /// bulk endpoints. Devices not yet in accessory mode are driven through
    /// the query chain and picked up again when they re-enumerate.
    pub async fn wait_for_accessory(&self) -> Result<AccessoryEndpoints, UsbError> {
        let mut watch =
            nusb::watch_devices().map_err(|e| UsbError::Init(std::io::Error::other(e)))?;
        let devices =
            nusb::list_devices().map_err(|e| UsbError::Init(std::io::Error::other(e)))?;
        for info in devices {
            if let Some(endpoints) = self.consider(info).await {
                return Ok(endpoints);
            }
        }
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(UsbError::Aborted),
                e = watch.next() => e,
            };
            match event {
                Some(nusb::hotplug::HotplugEvent::Connected(info)) => {
                    if let Some(endpoints) = self.consider(info).await {
                        return Ok(endpoints);
                    }
                }
                Some(nusb::hotplug::HotplugEvent::Disconnected(_)) => {}
                None => {
                    return Err(UsbError::Init(std::io::Error::other(
                        "hotplug watch ended",
                    )));
                }
            }
        }
    }

    /// Look at one device: claim it when it is in accessory mode, otherwise
    /// try to promote it and wait for the re-enumeration.
    async fn consider(&self, info: nusb::DeviceInfo) -> Option<AccessoryEndpoints> {
        if is_accessory(info.vendor_id(), info.product_id()) {
            match claim_accessory(&info) {
                Ok(endpoints) => return Some(endpoints),
                Err(e) => {
                    log::error!("Failed to claim accessory device: {:?}", e);
                    return None;
                }
            }
        }
        match promote(&info).await {
            Ok(()) => {
                log::info!(
                    "Device {:04x}:{:04x} switching to accessory mode",
                    info.vendor_id(),
                    info.product_id()
                );
            }
            Err(e) => {
                log::debug!(
                    "Device {:04x}:{:04x} is not android auto capable: {:?}",
                    info.vendor_id(),
                    info.product_id(),
                    e
                );
            }
        }
        None
    }
}

impl Default for AoapHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the accessory query chain against a device that might be a phone.
/// After this succeeds the device drops off the bus and comes back with the
/// accessory vid/pid.
async fn promote(info: &nusb::DeviceInfo) -> Result<(), UsbError> {
    let device = info
        .open()
        .map_err(|e| UsbError::Device(std::io::Error::other(e)))?;
    let protocol = device
        .control_in(ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: ACCESSORY_GET_PROTOCOL,
            value: 0,
            index: 0,
            length: 2,
        })
        .await
        .into_result()
        .map_err(|e| UsbError::Device(std::io::Error::other(e)))?;
    if protocol.len() < 2 || u16::from_le_bytes([protocol[0], protocol[1]]) < 1 {
        return Err(UsbError::Device(std::io::Error::other(
            "accessory protocol not supported",
        )));
    }
    for (index, text) in IDENTIFICATION {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        device
            .control_out(ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: ACCESSORY_SEND_STRING,
                value: 0,
                index,
                data: &data,
            })
            .await
            .into_result()
            .map_err(|e| UsbError::Device(std::io::Error::other(e)))?;
    }
    device
        .control_out(ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: ACCESSORY_START,
            value: 0,
            index: 0,
            data: &[],
        })
        .await
        .into_result()
        .map_err(|e| UsbError::Device(std::io::Error::other(e)))?;
    Ok(())
}

/// Claim the accessory interface of a re-enumerated device and resolve its
/// bulk endpoints.
fn claim_accessory(info: &nusb::DeviceInfo) -> Result<AccessoryEndpoints, UsbError> {
    let device = info
        .open()
        .map_err(|e| UsbError::Device(std::io::Error::other(e)))?;
    let config = device.active_configuration().map_err(|e| {
        UsbError::Device(std::io::Error::other(format!(
            "no active configuration: {}",
            e
        )))
    })?;
    for group in config.interfaces() {
        for alt in group.alt_settings() {
            let in_ep = alt
                .endpoints()
                .find(|e| e.direction() == Direction::In)
                .map(|e| e.address());
            let out_ep = alt
                .endpoints()
                .find(|e| e.direction() == Direction::Out)
                .map(|e| e.address());
            if let (Some(in_ep), Some(out_ep)) = (in_ep, out_ep) {
                let interface = device
                    .claim_interface(group.interface_number())
                    .map_err(|e| UsbError::Device(std::io::Error::other(e)))?;
                return Ok(AccessoryEndpoints {
                    interface,
                    in_ep,
                    out_ep,
                });
            }
        }
    }
    Err(UsbError::Device(std::io::Error::other(
        "no bulk endpoint pair on the accessory device",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessory_ids_are_recognized() {
        assert!(is_accessory(0x18d1, 0x2d00));
        assert!(is_accessory(0x18d1, 0x2d01));
        assert!(!is_accessory(0x18d1, 0x4ee1));
        assert!(!is_accessory(0x04e8, 0x2d00));
    }

    #[test]
    fn identification_strings_follow_the_protocol() {
        assert_eq!(IDENTIFICATION[0], (0, "Android"));
        assert_eq!(IDENTIFICATION[1], (1, "Android Auto"));
        assert_eq!(IDENTIFICATION[2], (2, "Head Unit Application"));
        assert_eq!(IDENTIFICATION[3], (3, "1.0"));
        // indices must be dense, the phone stores them by position
        for (i, (index, _)) in IDENTIFICATION.iter().enumerate() {
            assert_eq!(*index as usize, i);
        }
    }
}
