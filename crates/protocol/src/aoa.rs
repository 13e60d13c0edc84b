//! Android Open Accessory wire contract
//!
//! Control request codes, string slots and product identifiers fixed by the
//! device side of the protocol. See
//! <https://source.android.com/devices/accessories/aoa2>.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// bmRequestType for vendor requests, device to host
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0x80 | 0x40;
/// bmRequestType for vendor requests, host to device
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Query the supported protocol version (2 byte response)
pub const ACCESSORY_GET_PROTOCOL: u8 = 51;
/// Send one identification string, `wIndex` selects the slot
pub const ACCESSORY_SEND_STRING: u8 = 52;
/// Switch the device into accessory mode
pub const ACCESSORY_START: u8 = 53;
/// Enable or disable the audio subsystem, `wValue` selects the format
pub const ACCESSORY_SET_AUDIO_MODE: u8 = 58;

/// `wValue` for `ACCESSORY_SET_AUDIO_MODE`: 2 channel, 16-bit PCM at 44100 Hz
pub const AUDIO_MODE_PCM_16_STEREO: u16 = 1;

/// Vendor id every device uses once switched into accessory mode
pub const ACCESSORY_VENDOR_ID: u16 = 0x18d1;

/// Product ids a device re-enumerates under after `ACCESSORY_START`
///
/// 0x2D00 accessory, 0x2D01 accessory + adb, 0x2D02 audio, 0x2D03 audio + adb,
/// 0x2D04 accessory + audio, 0x2D05 accessory + audio + adb.
pub const ACCESSORY_PRODUCT_IDS: [u16; 6] = [0x2d00, 0x2d01, 0x2d02, 0x2d03, 0x2d04, 0x2d05];

/// Google vendor id
pub const GOOGLE_VENDOR_ID: u16 = 0x18d1;
/// Nexus 5 in its normal (non-accessory) configuration
pub const PID_HAMMERHEAD: u16 = 0x4ee2;
/// Nexus 6P in its normal (non-accessory) configuration
pub const PID_ANGLER: u16 = 0x4ee7;

/// Identification string slot, sent as `wIndex` of `ACCESSORY_SEND_STRING`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StringSlot {
    Manufacturer = 0,
    Model = 1,
    Description = 2,
    Version = 3,
    Uri = 4,
    Serial = 5,
}

impl StringSlot {
    /// Strings sent for every mode, in wire order
    pub const ALWAYS: [StringSlot; 4] = [
        StringSlot::Description,
        StringSlot::Version,
        StringSlot::Uri,
        StringSlot::Serial,
    ];

    /// Strings that make the device look for a matching app; accessory mode only
    pub const ACCESSORY_ONLY: [StringSlot; 2] = [StringSlot::Manufacturer, StringSlot::Model];

    pub fn index(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            StringSlot::Manufacturer => "manufacturer",
            StringSlot::Model => "model",
            StringSlot::Description => "description",
            StringSlot::Version => "version",
            StringSlot::Uri => "uri",
            StringSlot::Serial => "serial",
        }
    }
}

impl fmt::Display for StringSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identification strings presented to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessoryIdentity {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl Default for AccessoryIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "aoa-bridge".to_string(),
            model: "aoa-bridge".to_string(),
            description: "Android USB mirror".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uri: "https://source.android.com/devices/accessories/aoa2".to_string(),
            serial: "0".to_string(),
        }
    }
}

impl AccessoryIdentity {
    pub fn get(&self, slot: StringSlot) -> &str {
        match slot {
            StringSlot::Manufacturer => &self.manufacturer,
            StringSlot::Model => &self.model,
            StringSlot::Description => &self.description,
            StringSlot::Version => &self.version,
            StringSlot::Uri => &self.uri,
            StringSlot::Serial => &self.serial,
        }
    }

    /// Wire payload for a slot: the string bytes followed by a NUL terminator
    pub fn payload(&self, slot: StringSlot) -> Result<Vec<u8>> {
        let value = self.get(slot);
        if value.as_bytes().contains(&0) {
            return Err(ProtocolError::InteriorNul { slot: slot.name() });
        }
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        Ok(payload)
    }

    /// Check every slot can be encoded
    pub fn validate(&self) -> Result<()> {
        for slot in StringSlot::ACCESSORY_ONLY.into_iter().chain(StringSlot::ALWAYS) {
            self.payload(slot)?;
        }
        Ok(())
    }
}

/// Check whether a product id is one of the accessory-mode ids
pub fn is_accessory_product(product_id: u16) -> bool {
    ACCESSORY_PRODUCT_IDS.contains(&product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_types() {
        assert_eq!(REQUEST_TYPE_VENDOR_IN, 0xc0);
        assert_eq!(REQUEST_TYPE_VENDOR_OUT, 0x40);
    }

    #[test]
    fn test_slot_indices() {
        assert_eq!(StringSlot::Manufacturer.index(), 0);
        assert_eq!(StringSlot::Model.index(), 1);
        assert_eq!(StringSlot::Description.index(), 2);
        assert_eq!(StringSlot::Version.index(), 3);
        assert_eq!(StringSlot::Uri.index(), 4);
        assert_eq!(StringSlot::Serial.index(), 5);
    }

    #[test]
    fn test_payload_is_nul_terminated() {
        let identity = AccessoryIdentity::default();
        let payload = identity.payload(StringSlot::Serial).unwrap();
        assert_eq!(payload, b"0\0");
    }

    #[test]
    fn test_interior_nul_rejected() {
        let identity = AccessoryIdentity {
            model: "mi\0mic".to_string(),
            ..AccessoryIdentity::default()
        };
        assert!(identity.payload(StringSlot::Model).is_err());
        assert!(identity.validate().is_err());
        assert!(AccessoryIdentity::default().validate().is_ok());
    }

    #[test]
    fn test_accessory_products() {
        assert!(is_accessory_product(0x2d03));
        assert!(!is_accessory_product(PID_ANGLER));
    }
}
