//! Parsing of USB configuration descriptors.
//!
//! The engine reads the raw descriptor blob for the active configuration
//! from the backend and walks it to populate its endpoint table: transfer
//! type, polling interval, owning interface, effective max packet size and
//! bulk stream count per endpoint.

use std::{collections::BTreeMap, fmt::Debug, iter, ops::Deref};

use log::warn;

use crate::proto::{EpType, Speed};

pub(crate) const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub(crate) const DESCRIPTOR_LEN_DEVICE: u8 = 18;

pub(crate) const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESCRIPTOR_LEN_CONFIGURATION: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub(crate) const DESCRIPTOR_LEN_INTERFACE: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub(crate) const DESCRIPTOR_LEN_ENDPOINT: u8 = 7;

pub(crate) const DESCRIPTOR_TYPE_SS_EP_COMPANION: u8 = 0x30;
pub(crate) const DESCRIPTOR_LEN_SS_EP_COMPANION: u8 = 6;

/// A raw descriptor: a byte slice whose first two bytes are `bLength` and
/// `bDescriptorType`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor<'a>(&'a [u8]);

impl<'a> Descriptor<'a> {
    pub fn new(buf: &[u8]) -> Option<Descriptor> {
        if buf.len() >= 2 && buf.len() >= buf[0] as usize {
            Some(Descriptor(buf))
        } else {
            None
        }
    }

    pub fn descriptor_len(&self) -> usize {
        self.0[0] as usize
    }

    pub fn descriptor_type(&self) -> u8 {
        self.0[1]
    }
}

impl<'a> Deref for Descriptor<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0
    }
}

/// Iterator over a chain of descriptors linked by `bLength`.
#[derive(Clone)]
pub struct Descriptors<'a>(&'a [u8]);

impl<'a> Descriptors<'a> {
    fn split_first(&self) -> Option<(&'a [u8], &'a [u8])> {
        if self.0.len() < 2 {
            return None;
        }

        if self.0[0] < 2 {
            warn!(
                "descriptor with bLength {} can't point to next descriptor",
                self.0[0]
            );
            return None;
        }

        if self.0[0] as usize > self.0.len() {
            warn!(
                "descriptor with bLength {} exceeds remaining buffer length {}",
                self.0[0],
                self.0.len()
            );
            return None;
        }

        Some(self.0.split_at(self.0[0] as usize))
    }

    /// Split into chunks starting with a descriptor of `descriptor_type`,
    /// each including the trailing descriptors of other types.
    fn split_by_type(mut self, descriptor_type: u8, min_len: u8) -> impl Iterator<Item = &'a [u8]> {
        iter::from_fn(move || {
            loop {
                let (_, next) = self.split_first()?;

                if self.0[1] == descriptor_type {
                    if self.0[0] >= min_len {
                        break;
                    } else {
                        warn!(
                            "ignoring descriptor of type {} and length {} below minimum {}",
                            self.0[1], self.0[0], min_len
                        );
                    }
                }

                self.0 = next;
            }

            let mut end = self.0[0] as usize;

            while self.0.len() >= end + 2
                && self.0[end] > 2
                && self.0[end + 1] != descriptor_type
                && self.0.len() >= end + self.0[end] as usize
            {
                end += self.0[end] as usize;
            }

            let (r, next) = self.0.split_at(end);
            self.0 = next;
            Some(r)
        })
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Descriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((cur, next)) = self.split_first() {
            self.0 = next;
            Some(Descriptor(cur))
        } else {
            None
        }
    }
}

macro_rules! descriptor_fields {
    (impl $(<$( $i_lt:lifetime ),+>)? $tname:ident $(<$( $t_lt:lifetime ),+>)? {
        $(
            $(#[$attr:meta])*
            $vis:vis fn $name:ident at $pos:literal -> $ty:ty;
        )*
    }) => {
        impl $(<$( $i_lt ),+>)? $tname $(<$( $t_lt ),+>)? {
            $(
                $(#[$attr])*
                #[inline]
                $vis fn $name(&self) -> $ty { <$ty>::from_le_bytes(self.0[$pos..$pos + std::mem::size_of::<$ty>()].try_into().unwrap()) }
            )*
        }
    }
}

/// Check whether the buffer starts with a valid device descriptor and
/// return its length.
pub(crate) fn validate_device_descriptor(buf: &[u8]) -> Option<usize> {
    if buf.len() < DESCRIPTOR_LEN_DEVICE as usize {
        if !buf.is_empty() {
            warn!(
                "device descriptor buffer is {} bytes, need {}",
                buf.len(),
                DESCRIPTOR_LEN_DEVICE
            );
        }
        return None;
    }

    if buf[0] < DESCRIPTOR_LEN_DEVICE {
        warn!("invalid device descriptor bLength");
        return None;
    }

    if buf[1] != DESCRIPTOR_TYPE_DEVICE {
        warn!("bDescriptorType {} is not a device descriptor", buf[1]);
        return None;
    }

    Some(buf[0] as usize)
}

/// The 18-byte device descriptor, owned.
#[derive(Clone)]
pub struct DeviceDescriptor([u8; DESCRIPTOR_LEN_DEVICE as usize]);

impl DeviceDescriptor {
    /// Create from a buffer beginning with a device descriptor.
    pub fn new(buf: &[u8]) -> Option<DeviceDescriptor> {
        validate_device_descriptor(buf)?;
        Some(DeviceDescriptor(
            buf[0..DESCRIPTOR_LEN_DEVICE as usize].try_into().unwrap(),
        ))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

descriptor_fields! {
    impl DeviceDescriptor {
        /// `bcdUSB`: USB specification number.
        pub fn usb_version at 2 -> u16;

        /// `bDeviceClass`.
        pub fn class at 4 -> u8;

        /// `bDeviceSubClass`.
        pub fn subclass at 5 -> u8;

        /// `bDeviceProtocol`.
        pub fn protocol at 6 -> u8;

        /// `idVendor`.
        pub fn vendor_id at 8 -> u16;

        /// `idProduct`.
        pub fn product_id at 10 -> u16;

        /// `bcdDevice`: device release number.
        pub fn device_version at 12 -> u16;

        /// `bNumConfigurations`.
        pub fn num_configurations at 17 -> u8;
    }
}

impl Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("class", &format_args!("0x{:02X}", self.class()))
            .field("vendor_id", &format_args!("0x{:04X}", self.vendor_id()))
            .field("product_id", &format_args!("0x{:04X}", self.product_id()))
            .field(
                "device_version",
                &format_args!("0x{:04X}", self.device_version()),
            )
            .finish()
    }
}

pub(crate) fn validate_config_descriptor(buf: &[u8]) -> Option<usize> {
    if buf.len() < DESCRIPTOR_LEN_CONFIGURATION as usize {
        if !buf.is_empty() {
            warn!(
                "config descriptor buffer is {} bytes, need {}",
                buf.len(),
                DESCRIPTOR_LEN_CONFIGURATION
            );
        }
        return None;
    }

    if buf[0] < DESCRIPTOR_LEN_CONFIGURATION {
        warn!("invalid config descriptor bLength");
        return None;
    }

    if buf[1] != DESCRIPTOR_TYPE_CONFIGURATION {
        warn!("bDescriptorType {} is not a configuration descriptor", buf[1]);
        return None;
    }

    let total_len = u16::from_le_bytes(buf[2..4].try_into().unwrap()) as usize;
    if total_len < buf[0] as usize || total_len > buf.len() {
        warn!(
            "invalid config descriptor wTotalLen of {total_len} (buffer size is {})",
            buf.len()
        );
        return None;
    }

    Some(total_len)
}

/// A configuration descriptor with its trailing interface and endpoint
/// descriptors, viewed over raw bytes.
#[derive(Clone)]
pub struct Configuration<'a>(&'a [u8]);

impl<'a> Configuration<'a> {
    pub fn new(buf: &'a [u8]) -> Option<Configuration<'a>> {
        let total_len = validate_config_descriptor(buf)?;
        Some(Configuration(&buf[..total_len]))
    }

    pub fn descriptors(&self) -> Descriptors<'a> {
        Descriptors(self.0)
    }

    /// All interface descriptors, one per alternate setting.
    pub fn interface_alt_settings(&self) -> impl Iterator<Item = InterfaceAltSetting<'a>> {
        self.descriptors()
            .split_by_type(DESCRIPTOR_TYPE_INTERFACE, DESCRIPTOR_LEN_INTERFACE)
            .map(InterfaceAltSetting)
    }

    /// Interfaces grouped by number, ordered by interface number. The
    /// position in this sequence is the engine's config-table index.
    pub fn interfaces(&self) -> impl Iterator<Item = InterfaceGroup<'a>> {
        let mut interfaces = BTreeMap::new();

        for intf in self.interface_alt_settings() {
            interfaces
                .entry(intf.interface_number())
                .or_insert_with(Vec::new)
                .push(intf);
        }

        interfaces
            .into_iter()
            .map(|(intf_number, alt_settings)| InterfaceGroup {
                intf_number,
                alt_settings,
            })
    }
}

descriptor_fields! {
    impl<'a> Configuration<'a> {
        /// `bNumInterfaces`.
        pub fn num_interfaces at 4 -> u8;

        /// `bConfigurationValue`.
        pub fn configuration_value at 5 -> u8;
    }
}

/// Alternate settings sharing one interface number.
#[derive(Clone)]
pub struct InterfaceGroup<'a> {
    intf_number: u8,
    alt_settings: Vec<InterfaceAltSetting<'a>>,
}

impl<'a> InterfaceGroup<'a> {
    pub fn interface_number(&self) -> u8 {
        self.intf_number
    }

    pub fn alt_settings(&self) -> impl Iterator<Item = InterfaceAltSetting<'a>> + '_ {
        self.alt_settings.iter().cloned()
    }

    /// The descriptor for the given alternate setting value, or the first
    /// one when the requested setting is not present.
    pub fn alt_setting(&self, alt: u8) -> InterfaceAltSetting<'a> {
        self.alt_settings
            .iter()
            .find(|a| a.alternate_setting() == alt)
            .unwrap_or(&self.alt_settings[0])
            .clone()
    }
}

/// One alternate setting of an interface with its endpoint descriptors.
#[derive(Clone)]
pub struct InterfaceAltSetting<'a>(&'a [u8]);

impl<'a> InterfaceAltSetting<'a> {
    pub fn endpoints(&self) -> impl Iterator<Item = EndpointDescriptor<'a>> {
        Descriptors(self.0)
            .split_by_type(DESCRIPTOR_TYPE_ENDPOINT, DESCRIPTOR_LEN_ENDPOINT)
            .map(EndpointDescriptor)
    }
}

descriptor_fields! {
    impl<'a> InterfaceAltSetting<'a> {
        /// `bInterfaceNumber`.
        pub fn interface_number at 2 -> u8;

        /// `bAlternateSetting`.
        pub fn alternate_setting at 3 -> u8;

        /// `bNumEndpoints`.
        pub fn num_endpoints at 4 -> u8;

        /// `bInterfaceClass`.
        pub fn class at 5 -> u8;

        /// `bInterfaceSubClass`.
        pub fn subclass at 6 -> u8;

        /// `bInterfaceProtocol`.
        pub fn protocol at 7 -> u8;
    }
}

/// An endpoint descriptor plus its trailing class/companion descriptors.
pub struct EndpointDescriptor<'a>(&'a [u8]);

impl<'a> EndpointDescriptor<'a> {
    pub fn descriptors(&self) -> impl Iterator<Item = Descriptor<'a>> {
        Descriptors(self.0)
    }

    pub fn transfer_type(&self) -> EpType {
        EpType::from_attributes(self.attributes())
    }

    /// Effective max packet size in bytes: the `wMaxPacketSize` payload
    /// field, multiplied by the additional-transactions count for
    /// high-speed isochronous endpoints.
    pub fn effective_max_packet_size(&self, speed: Speed) -> u32 {
        let maxp = (self.max_packet_size_raw() & 0x7ff) as u32;
        let mult = if speed == Speed::High && self.transfer_type() == EpType::Iso {
            match (self.max_packet_size_raw() >> 11) & 3 {
                1 => 2,
                2 => 3,
                _ => 1,
            }
        } else {
            1
        };
        maxp * mult
    }

    /// Number of bulk streams advertised by a SuperSpeed endpoint
    /// companion descriptor, 0 when absent or not a bulk endpoint.
    pub fn max_streams(&self) -> u32 {
        if self.transfer_type() != EpType::Bulk {
            return 0;
        }
        for desc in self.descriptors().skip(1) {
            if desc.descriptor_type() == DESCRIPTOR_TYPE_SS_EP_COMPANION
                && desc.descriptor_len() >= DESCRIPTOR_LEN_SS_EP_COMPANION as usize
            {
                let streams = desc[3] & 0x1f;
                return if streams != 0 { 1 << streams } else { 0 };
            }
        }
        0
    }
}

descriptor_fields! {
    impl<'a> EndpointDescriptor<'a> {
        /// `bEndpointAddress`.
        pub fn address at 2 -> u8;

        /// `bmAttributes`.
        pub fn attributes at 3 -> u8;

        /// `wMaxPacketSize`, raw.
        pub fn max_packet_size_raw at 4 -> u16;

        /// `bInterval`: polling interval in (micro)frames.
        pub fn interval at 6 -> u8;
    }
}

impl<'a> Debug for EndpointDescriptor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("address", &format_args!("0x{:02X}", self.address()))
            .field("transfer_type", &self.transfer_type())
            .field("max_packet_size_raw", &self.max_packet_size_raw())
            .field("interval", &self.interval())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config() {
        let c = Configuration::new(&[9, 2, 9, 0, 0, 1, 0, 0, 250]).unwrap();
        assert_eq!(c.num_interfaces(), 0);
        assert_eq!(c.configuration_value(), 1);
        assert_eq!(c.interfaces().count(), 0);
    }

    #[test]
    fn bad_total_len_rejected() {
        assert!(Configuration::new(&[9, 2, 0, 0, 0, 1, 0, 0, 2]).is_none());
        assert!(Configuration::new(&[9, 2, 20, 0, 0, 1, 0, 0, 2]).is_none());
    }

    #[test]
    #[rustfmt::skip]
    fn hid_keyboard_config() {
        let c = Configuration::new(&[
            // configuration: 1 interface
            0x09, 0x02, 0x22, 0x00, 0x01, 0x01, 0x00, 0xa0, 0x31,
            // interface 0 alt 0: HID boot keyboard
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00,
            // HID class descriptor (kept with the interface)
            0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00,
            // endpoint 0x81 interrupt in, 8 bytes, interval 10
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0a,
        ]).unwrap();

        assert_eq!(c.num_interfaces(), 1);

        let intf = c.interfaces().next().unwrap();
        assert_eq!(intf.interface_number(), 0);
        let alt = intf.alt_setting(0);
        assert_eq!(alt.class(), 3);
        assert_eq!(alt.subclass(), 1);
        assert_eq!(alt.protocol(), 1);

        let ep = alt.endpoints().next().unwrap();
        assert_eq!(ep.address(), 0x81);
        assert_eq!(ep.transfer_type(), EpType::Interrupt);
        assert_eq!(ep.interval(), 10);
        assert_eq!(ep.effective_max_packet_size(Speed::Full), 8);
        assert_eq!(ep.max_streams(), 0);
    }

    #[test]
    #[rustfmt::skip]
    fn alt_settings_grouped() {
        let c = Configuration::new(&[
            0x09, 0x02, 0x38, 0x00, 0x01, 0x01, 0x00, 0x80, 0xfa,
            // interface 1 alt 0: no endpoints
            0x09, 0x04, 0x01, 0x00, 0x00, 0x0e, 0x02, 0x00, 0x00,
            // interface 1 alt 1: one iso endpoint, high-bandwidth
            0x09, 0x04, 0x01, 0x01, 0x01, 0x0e, 0x02, 0x00, 0x00,
            // ep 0x81 iso, wMaxPacketSize = 0x1400 -> 1024 bytes x3
            0x07, 0x05, 0x81, 0x05, 0x00, 0x14, 0x01,
            // interface 1 alt 2: one bulk endpoint with stream companion
            0x09, 0x04, 0x01, 0x02, 0x01, 0x0e, 0x02, 0x00, 0x00,
            0x07, 0x05, 0x82, 0x02, 0x00, 0x04, 0x00,
            // SS companion: bMaxBurst 0, bmAttributes 4 -> 16 streams
            0x06, 0x30, 0x00, 0x04, 0x00, 0x00,
        ]).unwrap();

        let intf = c.interfaces().next().unwrap();
        assert_eq!(intf.interface_number(), 1);
        assert_eq!(intf.alt_settings().count(), 3);

        let alt1 = intf.alt_setting(1);
        let ep = alt1.endpoints().next().unwrap();
        assert_eq!(ep.transfer_type(), EpType::Iso);
        assert_eq!(ep.effective_max_packet_size(Speed::High), 3072);
        assert_eq!(ep.effective_max_packet_size(Speed::Full), 1024);

        let alt2 = intf.alt_setting(2);
        let ep = alt2.endpoints().next().unwrap();
        assert_eq!(ep.transfer_type(), EpType::Bulk);
        assert_eq!(ep.effective_max_packet_size(Speed::Super), 1024);
        assert_eq!(ep.max_streams(), 16);

        // Requesting a missing alt falls back to the first.
        let fallback = intf.alt_setting(9);
        assert_eq!(fallback.alternate_setting(), 0);
    }
}
