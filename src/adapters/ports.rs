//! USB serial port discovery.
//!
//! Maps the vendor/product IDs of the USB-serial bridges used in the lab to
//! friendly names, so the operator can pick a port (or let the config say
//! `port = "auto"`) without knowing which `/dev/ttyUSB*` the kernel assigned.
//!
//! Note that these IDs identify the USB bridge chip, not necessarily the
//! instrument behind it (the RS3005P entry is the CH340-style bridge it ships with).

use crate::error::{AppResult, LabError};
use std::fmt;

/// A USB device type we know how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDevice {
    /// Config key used to refer to the device ("pico", "rs", ...)
    pub key: &'static str,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID, or `None` to match any product of the vendor
    pub product_id: Option<u16>,
    /// Display name of the vendor
    pub vendor: &'static str,
    /// Display name of the product
    pub product: &'static str,
}

impl KnownDevice {
    /// Whether a port with the given IDs could be this device.
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.map_or(true, |pid| pid == product_id)
    }
}

/// Devices recognised by [`list_ports`].
pub const KNOWN_DEVICES: &[KnownDevice] = &[
    KnownDevice {
        key: "pico",
        vendor_id: 0x2e8a,
        product_id: Some(0x0005),
        vendor: "Raspberry Pi",
        product: "Pico",
    },
    KnownDevice {
        key: "rs",
        vendor_id: 0x0416,
        product_id: Some(0x5011),
        vendor: "RS",
        product: "3005P",
    },
    KnownDevice {
        key: "rbd",
        vendor_id: 0x0403,
        product_id: Some(0x6001),
        vendor: "RBD",
        product: "Picoammeter",
    },
    KnownDevice {
        key: "caen",
        vendor_id: 0x21e1,
        product_id: Some(0x0003),
        vendor: "CAEN",
        product: "R1419ET",
    },
];

/// Look up a known device by config key.
pub fn known_device(key: &str) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES.iter().find(|d| d.key.eq_ignore_ascii_case(key))
}

/// A serial port with its USB identity, when available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS port name ("/dev/ttyACM0", "COM4")
    pub port: String,
    /// USB vendor/product IDs, `None` for non-USB ports
    pub usb_ids: Option<(u16, u16)>,
    /// Matching entry of [`KNOWN_DEVICES`]
    pub device: Option<&'static KnownDevice>,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)?;
        match (self.device, self.usb_ids) {
            (Some(device), _) => write!(f, " - {} {}", device.vendor, device.product),
            (None, Some((vid, pid))) => write!(f, " - Vendor ID 0x{:04x}, Product ID 0x{:04x}", vid, pid),
            (None, None) => Ok(()),
        }
    }
}

fn identify(usb_ids: Option<(u16, u16)>) -> Option<&'static KnownDevice> {
    let (vid, pid) = usb_ids?;
    KNOWN_DEVICES.iter().find(|d| d.matches(vid, pid))
}

/// List USB serial ports, optionally only those matching the device `filter` key.
pub fn list_ports(filter: Option<&str>) -> AppResult<Vec<PortInfo>> {
    let wanted = match filter {
        Some(key) => Some(known_device(key).ok_or_else(|| {
            LabError::Configuration(format!("unknown device key '{}'", key))
        })?),
        None => None,
    };

    let ports = available_ports()?
        .into_iter()
        .map(|(port, usb_ids)| PortInfo {
            device: identify(usb_ids),
            port,
            usb_ids,
        })
        .filter(|info| match wanted {
            Some(want) => info.usb_ids.is_some_and(|(vid, pid)| want.matches(vid, pid)),
            None => info.usb_ids.is_some(),
        })
        .collect();
    Ok(ports)
}

/// First port that matches the device `key`.
pub fn port_of(key: &str) -> AppResult<String> {
    list_ports(Some(key))?
        .into_iter()
        .next()
        .map(|info| info.port)
        .ok_or_else(|| LabError::Instrument(format!("no connected device matches '{}'", key)))
}

#[cfg(feature = "instrument_serial")]
fn available_ports() -> AppResult<Vec<(String, Option<(u16, u16)>)>> {
    let ports = serialport::available_ports()
        .map_err(|e| LabError::Instrument(format!("Failed to enumerate serial ports: {}", e)))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let ids = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some((usb.vid, usb.pid)),
                _ => None,
            };
            (p.port_name, ids)
        })
        .collect())
}

#[cfg(not(feature = "instrument_serial"))]
fn available_ports() -> AppResult<Vec<(String, Option<(u16, u16)>)>> {
    Err(LabError::SerialFeatureDisabled)
}
