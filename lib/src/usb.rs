use crate::Error;

/// USB interface class code for Smart Card devices (CCID/ICCD)
pub const USB_CLASS_CSCID: u8 = 0x0B;

// Standard SETUP packet bmRequestType decoding (USB 2.0 ch. 9)
pub const USB_DIR_IN: u8 = 0x80;
pub const USB_TYPE_MASK: u8 = 0x60;
pub const USB_TYPE_CLASS: u8 = 0x20;
pub const USB_RECIP_MASK: u8 = 0x1F;
pub const USB_RECIP_INTERFACE: u8 = 0x01;

// CCID class-specific control requests, interface recipient
pub const CCID_REQ_ABORT: u8 = 0x01;
pub const CCID_REQ_GET_CLOCK_FREQUENCIES: u8 = 0x02;
pub const CCID_REQ_GET_DATA_RATES: u8 = 0x03;

// dwFeatures bits of the class descriptor
pub const CCID_CLASS_AUTO_CONF_ATR: u32 = 0x0000_0002;
pub const CCID_CLASS_AUTO_ACTIVATION: u32 = 0x0000_0004;
pub const CCID_CLASS_AUTO_VOLTAGE: u32 = 0x0000_0008;
pub const CCID_CLASS_AUTO_CLOCK: u32 = 0x0000_0010;
pub const CCID_CLASS_AUTO_BAUD: u32 = 0x0000_0020;
pub const CCID_CLASS_AUTO_PPS_PROP: u32 = 0x0000_0040;
pub const CCID_CLASS_AUTO_IFSD: u32 = 0x0000_0400;
pub const CCID_CLASS_EXTENDED_APDU: u32 = 0x0004_0000;

pub const CCID_VOLTAGE_SUPPORT_5V: u8 = 1;

/// dwProtocols bits (T=0 is byte-oriented, T=1 is block-oriented)
pub const CCID_PROTOCOL_T0: u32 = 0x01;
pub const CCID_PROTOCOL_T1: u32 = 0x02;

// Interrupt notification message types (reader to host)
pub const MESSAGE_TYPE_SLOT_CHANGE: u8 = 0x50;
pub const MESSAGE_TYPE_HARDWARE_ERROR: u8 = 0x51;

// Bulk request message types (host to reader)
pub const MESSAGE_TYPE_POWER_ON: u8 = 0x62;
pub const MESSAGE_TYPE_POWER_OFF: u8 = 0x63;
pub const MESSAGE_TYPE_GET_SLOT_STATUS: u8 = 0x65;
pub const MESSAGE_TYPE_XFR_BLOCK: u8 = 0x6F;
pub const MESSAGE_TYPE_GET_PARAMETERS: u8 = 0x6C;
pub const MESSAGE_TYPE_RESET_PARAMETERS: u8 = 0x6D;
pub const MESSAGE_TYPE_SET_PARAMETERS: u8 = 0x61;
pub const MESSAGE_TYPE_ESCAPE: u8 = 0x6B;
pub const MESSAGE_TYPE_ICC_CLOCK: u8 = 0x6E;
pub const MESSAGE_TYPE_T0_APDU: u8 = 0x6A;
pub const MESSAGE_TYPE_SECURE: u8 = 0x69;
pub const MESSAGE_TYPE_MECHANICAL: u8 = 0x71;
pub const MESSAGE_TYPE_ABORT: u8 = 0x72;
pub const MESSAGE_TYPE_SET_RATE_AND_CLOCK: u8 = 0x73;

// Bulk response message types (reader to host)
pub const MESSAGE_TYPE_DATA_BLOCK: u8 = 0x80;
pub const MESSAGE_TYPE_SLOT_STATUS: u8 = 0x81;
pub const MESSAGE_TYPE_PARAMETERS: u8 = 0x82;
pub const MESSAGE_TYPE_ESCAPE_RESPONSE: u8 = 0x83;
pub const MESSAGE_TYPE_RATE_AND_CLOCK: u8 = 0x84;

// bClockStatus values of RDR_to_PC_SlotStatus
pub const CLOCK_STATUS_RUNNING: u8 = 0;
pub const CLOCK_STATUS_STOPPED_L: u8 = 1;
pub const CLOCK_STATUS_STOPPED_H: u8 = 2;
pub const CLOCK_STATUS_STOPPED: u8 = 3;

// bError values of failed responses
pub const ERROR_CMD_ABORTED: u8 = 0xFF;
pub const ERROR_ICC_MUTE: u8 = 0xFE;
pub const ERROR_XFR_PARITY_ERROR: u8 = 0xFD;
pub const ERROR_XFR_OVERRUN: u8 = 0xFC;
pub const ERROR_HW_ERROR: u8 = 0xFB;
pub const ERROR_CMD_SLOT_BUSY: u8 = 0xE0;
pub const ERROR_CMD_NOT_SUPPORTED: u8 = 0;
pub const ERROR_BAD_LENGTH: u8 = 1;
pub const ERROR_SLOT_DOES_NOT_EXIST: u8 = 5;
pub const ERROR_POWERSELECT_NOT_SUPPORTED: u8 = 7;
/// Same code as POWERSELECT, but reported for SET_PARAMETERS
pub const ERROR_PROTOCOLNUM_NOT_SUPPORTED: u8 = 7;
pub const ERROR_BAD_WLEVEL: u8 = 8;

/// Largest abData payload carried by one DATA_BLOCK message; longer card
/// responses are chained across several messages.
pub const DATA_MAX_LENGTH: usize = 65538;

/// bmICCStatus values, bits 0-1 of the response status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IccStatus {
    /// Card present and powered
    Active = 0,
    /// Card present, not powered
    Inactive = 1,
    /// No card in the slot
    NotPresent = 2,
}

impl IccStatus {
    pub fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits & 0x03 {
            0 => Ok(Self::Active),
            1 => Ok(Self::Inactive),
            2 => Ok(Self::NotPresent),
            _ => Err(Error::Malformed("invalid bmICCStatus")),
        }
    }
}

/// bmCommandStatus values, bits 6-7 of the response status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Ok = 0,
    Failed = 1,
    TimeExtension = 2,
}

impl CommandStatus {
    pub fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits & 0x03 {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Failed),
            2 => Ok(Self::TimeExtension),
            _ => Err(Error::Malformed("invalid bmCommandStatus")),
        }
    }
}

/// Class-specific ICCD functional descriptor (bDescriptorType 0x21),
/// 54 bytes on the wire, as of USB-ICC ICCD rev 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IccdDescriptor {
    pub max_slot_index: u8,
    pub voltage_support: u8,
    pub protocols: u32,
    pub default_clock_khz: u32,
    pub maximum_clock_khz: u32,
    pub num_clocks_supported: u8,
    pub data_rate_bps: u32,
    pub max_data_rate_bps: u32,
    pub num_data_rates_supported: u8,
    pub max_ifsd: u32,
    pub features: u32,
    pub max_message_length: u32,
    pub class_get_response: u8,
    pub class_envelope: u8,
    pub max_busy_slots: u8,
}

impl IccdDescriptor {
    pub const SIZE: usize = 54;
    pub const DESCRIPTOR_TYPE: u8 = USB_TYPE_CLASS | 1;
    /// CCID specification revision 1.1
    pub const BCD_CCID: u16 = 0x0110;

    /// Descriptor for a single-clock, single-rate, 5V, T=1-only reader
    /// exposing `slot_count` slots.
    pub fn new(slot_count: u8, clock_khz: u32, data_rate_bps: u32) -> Result<Self, Error> {
        if slot_count == 0 {
            return Err(Error::InvalidConfiguration("slot count must be at least 1"));
        }
        Ok(Self {
            max_slot_index: slot_count - 1,
            voltage_support: CCID_VOLTAGE_SUPPORT_5V,
            protocols: CCID_PROTOCOL_T1,
            default_clock_khz: clock_khz,
            maximum_clock_khz: clock_khz,
            // Zero means "fixed single value" for both counts
            num_clocks_supported: 0,
            data_rate_bps,
            max_data_rate_bps: data_rate_bps,
            num_data_rates_supported: 0,
            max_ifsd: 254,
            features: CCID_CLASS_AUTO_CONF_ATR
                | CCID_CLASS_AUTO_VOLTAGE
                | CCID_CLASS_AUTO_CLOCK
                | CCID_CLASS_AUTO_BAUD
                | CCID_CLASS_AUTO_PPS_PROP
                | CCID_CLASS_AUTO_IFSD
                | CCID_CLASS_EXTENDED_APDU,
            // Longest extended-APDU bulk message: 65544 bytes of abData
            // plus the 10-byte header.
            max_message_length: 65554,
            class_get_response: 0xFF,
            class_envelope: 0xFF,
            max_busy_slots: slot_count,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = Self::SIZE as u8;
        out[1] = Self::DESCRIPTOR_TYPE;
        out[2..4].copy_from_slice(&Self::BCD_CCID.to_le_bytes());
        out[4] = self.max_slot_index;
        out[5] = self.voltage_support;
        out[6..10].copy_from_slice(&self.protocols.to_le_bytes());
        out[10..14].copy_from_slice(&self.default_clock_khz.to_le_bytes());
        out[14..18].copy_from_slice(&self.maximum_clock_khz.to_le_bytes());
        out[18] = self.num_clocks_supported;
        out[19..23].copy_from_slice(&self.data_rate_bps.to_le_bytes());
        out[23..27].copy_from_slice(&self.max_data_rate_bps.to_le_bytes());
        out[27] = self.num_data_rates_supported;
        out[28..32].copy_from_slice(&self.max_ifsd.to_le_bytes());
        // dwSynchProtocols and dwMechanical stay zero, fixed for legacy
        // reasons.
        out[40..44].copy_from_slice(&self.features.to_le_bytes());
        out[44..48].copy_from_slice(&self.max_message_length.to_le_bytes());
        out[48] = self.class_get_response;
        out[49] = self.class_envelope;
        // wLcdLayout and bPinSupport stay zero.
        out[53] = self.max_busy_slots;
        out
    }
}

/// wMaxPacketSize of the interrupt IN endpoint: each slot takes two bits of
/// the NotifySlotChange bitmap, plus one byte for bMessageType.
pub fn interrupt_max_packet_size(slot_count: usize) -> u16 {
    (slot_count.div_ceil(4) + 1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_size() {
        let desc = IccdDescriptor::new(1, 3580, 9600).unwrap();
        let bytes = desc.encode();
        assert_eq!(bytes.len(), 54);
        assert_eq!(bytes[0], 54);
        assert_eq!(bytes[1], 0x21);
    }

    #[test]
    fn test_descriptor_fields() {
        let desc = IccdDescriptor::new(3, 3580, 9600).unwrap();
        assert_eq!(desc.max_slot_index, 2);
        assert_eq!(desc.max_busy_slots, 3);

        let bytes = desc.encode();
        // bcdCCID 1.10, little-endian
        assert_eq!(&bytes[2..4], &[0x10, 0x01]);
        // dwProtocols: T=1 only
        assert_eq!(&bytes[6..10], &[0x02, 0x00, 0x00, 0x00]);
        // dwDefaultClock 3580 kHz
        assert_eq!(&bytes[10..14], &3580u32.to_le_bytes());
        // dwMaxIFSD 254
        assert_eq!(&bytes[28..32], &254u32.to_le_bytes());
        // dwMaxCCIDMessageLength 65554
        assert_eq!(&bytes[44..48], &65554u32.to_le_bytes());
        // bClassGetResponse / bClassEnvelope echo the APDU class
        assert_eq!(&bytes[48..50], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_descriptor_rejects_zero_slots() {
        assert!(IccdDescriptor::new(0, 3580, 9600).is_err());
    }

    #[test]
    fn test_interrupt_packet_size() {
        assert_eq!(interrupt_max_packet_size(1), 2);
        assert_eq!(interrupt_max_packet_size(4), 2);
        assert_eq!(interrupt_max_packet_size(5), 3);
        assert_eq!(interrupt_max_packet_size(8), 3);
        assert_eq!(interrupt_max_packet_size(9), 4);
    }

    #[test]
    fn test_status_bits_round_trip() {
        assert_eq!(IccStatus::from_bits(0).unwrap(), IccStatus::Active);
        assert_eq!(IccStatus::from_bits(2).unwrap(), IccStatus::NotPresent);
        assert!(IccStatus::from_bits(3).is_err());
        assert_eq!(CommandStatus::from_bits(1).unwrap(), CommandStatus::Failed);
        assert!(CommandStatus::from_bits(3).is_err());
    }
}
