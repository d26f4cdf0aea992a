use crate::usb::{
    CommandStatus, IccStatus, MESSAGE_TYPE_ABORT, MESSAGE_TYPE_DATA_BLOCK, MESSAGE_TYPE_ESCAPE,
    MESSAGE_TYPE_ESCAPE_RESPONSE, MESSAGE_TYPE_GET_PARAMETERS, MESSAGE_TYPE_GET_SLOT_STATUS,
    MESSAGE_TYPE_HARDWARE_ERROR, MESSAGE_TYPE_ICC_CLOCK, MESSAGE_TYPE_MECHANICAL,
    MESSAGE_TYPE_PARAMETERS, MESSAGE_TYPE_POWER_OFF, MESSAGE_TYPE_POWER_ON,
    MESSAGE_TYPE_RATE_AND_CLOCK, MESSAGE_TYPE_RESET_PARAMETERS, MESSAGE_TYPE_SECURE,
    MESSAGE_TYPE_SET_PARAMETERS, MESSAGE_TYPE_SET_RATE_AND_CLOCK, MESSAGE_TYPE_SLOT_CHANGE,
    MESSAGE_TYPE_SLOT_STATUS, MESSAGE_TYPE_T0_APDU, MESSAGE_TYPE_XFR_BLOCK,
};
use crate::Error;

/// Every bulk message starts with this many bytes: bMessageType, dwLength,
/// bSlot, bSeq and three type-specific bytes.
pub const BULK_HEADER_LEN: usize = 10;

/// dwLength of a SET_PARAMETERS request carrying a T=0 parameter block
pub const SET_PARAMETERS_T0_LEN: u32 = 5;
/// dwLength of a SET_PARAMETERS request carrying a T=1 parameter block
pub const SET_PARAMETERS_T1_LEN: u32 = 7;

/// bChainParameter of DATA_BLOCK responses, and the value space of the
/// XFR_BLOCK wLevelParameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChainParameter {
    BeginAndEnd = 0,
    Begin = 1,
    End = 2,
    Intermediate = 3,
    /// Empty response asking the host to send the next command chunk
    Continue = 0x10,
}

impl ChainParameter {
    pub fn from_byte(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::BeginAndEnd),
            1 => Ok(Self::Begin),
            2 => Ok(Self::End),
            3 => Ok(Self::Intermediate),
            0x10 => Ok(Self::Continue),
            _ => Err(Error::Malformed("invalid bChainParameter")),
        }
    }

    /// Decode an XFR_BLOCK wLevelParameter into (starts transfer, ends
    /// transfer) flags. Unknown values have no mapping.
    pub fn to_start_stop(level: u16) -> Option<(bool, bool)> {
        match level {
            0 => Some((true, true)),
            1 => Some((true, false)),
            2 => Some((false, true)),
            3 => Some((false, false)),
            _ => None,
        }
    }

    /// Inverse of [`Self::to_start_stop`], used when fragmenting responses.
    pub fn from_start_stop(start: bool, stop: bool) -> Self {
        match (start, stop) {
            (true, true) => Self::BeginAndEnd,
            (true, false) => Self::Begin,
            (false, true) => Self::End,
            (false, false) => Self::Intermediate,
        }
    }
}

/// T=0 protocol parameter block (abProtocolDataStructure, 5 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T0Parameters {
    pub findex_dindex: u8,
    pub tccks: u8,
    pub guard_time: u8,
    pub waiting_integers: u8,
    pub clock_stop: u8,
}

impl T0Parameters {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 5 {
            return Err(Error::Malformed("short T=0 parameter block"));
        }
        Ok(Self {
            findex_dindex: bytes[0],
            tccks: bytes[1],
            guard_time: bytes[2],
            waiting_integers: bytes[3],
            clock_stop: bytes[4],
        })
    }

    pub fn encode(&self) -> [u8; 5] {
        [
            self.findex_dindex,
            self.tccks,
            self.guard_time,
            self.waiting_integers,
            self.clock_stop,
        ]
    }
}

/// T=1 protocol parameter block (abProtocolDataStructure, 7 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T1Parameters {
    pub findex_dindex: u8,
    pub tccks: u8,
    pub guard_time: u8,
    pub waiting_integers: u8,
    pub clock_stop: u8,
    pub ifsc: u8,
    pub nad: u8,
}

impl T1Parameters {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 7 {
            return Err(Error::Malformed("short T=1 parameter block"));
        }
        Ok(Self {
            findex_dindex: bytes[0],
            tccks: bytes[1],
            guard_time: bytes[2],
            waiting_integers: bytes[3],
            clock_stop: bytes[4],
            ifsc: bytes[5],
            nad: bytes[6],
        })
    }

    pub fn encode(&self) -> [u8; 7] {
        [
            self.findex_dindex,
            self.tccks,
            self.guard_time,
            self.waiting_integers,
            self.clock_stop,
            self.ifsc,
            self.nad,
        ]
    }
}

/// SET_PARAMETERS payload, sub-keyed by bProtocolNum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetParametersRequest {
    T0(T0Parameters),
    T1(T1Parameters),
    /// Protocol numbers without a parameter layout, or a payload whose
    /// length does not match the declared protocol.
    Other { protocol: u8 },
}

impl SetParametersRequest {
    pub fn protocol_num(&self) -> u8 {
        match self {
            Self::T0(_) => 0,
            Self::T1(_) => 1,
            Self::Other { protocol } => *protocol,
        }
    }

    fn decode(protocol: u8, body: &[u8]) -> Self {
        match (protocol, body.len()) {
            (0, 5) => match T0Parameters::decode(body) {
                Ok(params) => Self::T0(params),
                Err(_) => Self::Other { protocol },
            },
            (1, 7) => match T1Parameters::decode(body) {
                Ok(params) => Self::T1(params),
                Err(_) => Self::Other { protocol },
            },
            _ => Self::Other { protocol },
        }
    }
}

/// PC_to_RDR_Secure PIN verification header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinVerification {
    pub time_out: u8,
    pub format_string: u8,
    pub pin_block_string: u8,
    pub pin_length_format: u8,
    pub pin_max_extra_digit: u16,
    pub entry_validation_condition: u8,
    pub number_message: u8,
    pub lang_id: u16,
    pub msg_index: u8,
    pub teo_prologue: [u8; 3],
}

impl PinVerification {
    /// Fixed header length, including the bPINOperation byte
    const LEN: usize = 15;

    fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < Self::LEN {
            return Err(Error::Malformed("short PIN verification block"));
        }
        Ok(Self {
            time_out: body[1],
            format_string: body[2],
            pin_block_string: body[3],
            pin_length_format: body[4],
            pin_max_extra_digit: u16::from_le_bytes([body[5], body[6]]),
            entry_validation_condition: body[7],
            number_message: body[8],
            lang_id: u16::from_le_bytes([body[9], body[10]]),
            msg_index: body[11],
            teo_prologue: [body[12], body[13], body[14]],
        })
    }
}

/// PC_to_RDR_Secure PIN modification header. The number of message indexes
/// present on the wire follows bNumberMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinModification {
    pub time_out: u8,
    pub format_string: u8,
    pub pin_block_string: u8,
    pub pin_length_format: u8,
    pub insertion_offset_old: u8,
    pub insertion_offset_new: u8,
    pub pin_max_extra_digit: u16,
    pub confirm_pin: u8,
    pub entry_validation_condition: u8,
    pub number_message: u8,
    pub lang_id: u16,
    pub msg_index1: u8,
    pub msg_index2: Option<u8>,
    pub msg_index3: Option<u8>,
    pub teo_prologue: [u8; 3],
}

impl PinModification {
    /// Fixed prefix length, including the bPINOperation byte
    const FIXED_LEN: usize = 15;

    fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < Self::FIXED_LEN {
            return Err(Error::Malformed("short PIN modification block"));
        }
        let number_message = body[11];
        let extra_indexes = match number_message {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            _ => return Err(Error::Malformed("invalid bNumberMessage")),
        };
        let teo_at = Self::FIXED_LEN + extra_indexes;
        if body.len() < teo_at + 3 {
            return Err(Error::Malformed("short PIN modification block"));
        }
        Ok(Self {
            time_out: body[1],
            format_string: body[2],
            pin_block_string: body[3],
            pin_length_format: body[4],
            insertion_offset_old: body[5],
            insertion_offset_new: body[6],
            pin_max_extra_digit: u16::from_le_bytes([body[7], body[8]]),
            confirm_pin: body[9],
            entry_validation_condition: body[10],
            number_message,
            lang_id: u16::from_le_bytes([body[12], body[13]]),
            msg_index1: body[14],
            msg_index2: (extra_indexes >= 1).then(|| body[15]),
            msg_index3: (extra_indexes >= 2).then(|| body[16]),
            teo_prologue: [body[teo_at], body[teo_at + 1], body[teo_at + 2]],
        })
    }
}

/// SECURE payload, sub-keyed by wLevelParameter then bPINOperation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureOperation {
    PinVerification(PinVerification),
    PinModification(PinModification),
    /// A bPINOperation this reader does not give a structured layout
    Other { operation: u8 },
    /// Continuation chunk, or a payload too short to classify
    Opaque,
}

impl SecureOperation {
    fn decode(level: u16, body: &[u8]) -> Self {
        if level > 1 || body.is_empty() {
            return Self::Opaque;
        }
        match body[0] {
            0 => PinVerification::decode(body)
                .map(Self::PinVerification)
                .unwrap_or(Self::Other { operation: 0 }),
            1 => PinModification::decode(body)
                .map(Self::PinModification)
                .unwrap_or(Self::Other { operation: 1 }),
            operation => Self::Other { operation },
        }
    }
}

/// Type-specific view of a decoded bulk request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    PowerOn {
        power_select: u8,
    },
    PowerOff,
    GetSlotStatus,
    XfrBlock {
        bwi: u8,
        level_parameter: u16,
    },
    GetParameters,
    ResetParameters,
    SetParameters(SetParametersRequest),
    Escape,
    IccClock {
        clock_command: u8,
    },
    T0Apdu {
        changes: u8,
        class_get_response: u8,
        class_envelope: u8,
    },
    Secure {
        bwi: u8,
        level_parameter: u16,
        operation: SecureOperation,
    },
    Mechanical {
        function: u8,
    },
    Abort,
    SetRateAndClock,
}

/// One decoded bulk-OUT request: the common header fields plus the typed
/// variant. The data payload stays with the caller as a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// dwLength as declared by the host
    pub length: u32,
    pub slot: u8,
    pub seq: u8,
    pub kind: RequestKind,
}

impl Request {
    /// Decode a bulk-OUT buffer into a typed request and its payload.
    ///
    /// The variant is picked from bMessageType; SET_PARAMETERS is further
    /// keyed by bProtocolNum and SECURE by wLevelParameter and the PIN
    /// operation byte. A type byte with no mapping fails with
    /// [`Error::InvalidMessageType`].
    pub fn decode(buffer: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buffer.len() < BULK_HEADER_LEN {
            return Err(Error::Malformed("bulk message shorter than its header"));
        }
        let length = u32::from_le_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
        let slot = buffer[5];
        let seq = buffer[6];
        let extra = [buffer[7], buffer[8], buffer[9]];
        let body = &buffer[BULK_HEADER_LEN..];

        let kind = match buffer[0] {
            MESSAGE_TYPE_POWER_ON => RequestKind::PowerOn {
                power_select: extra[0],
            },
            MESSAGE_TYPE_POWER_OFF => RequestKind::PowerOff,
            MESSAGE_TYPE_GET_SLOT_STATUS => RequestKind::GetSlotStatus,
            MESSAGE_TYPE_XFR_BLOCK => RequestKind::XfrBlock {
                bwi: extra[0],
                level_parameter: u16::from_le_bytes([extra[1], extra[2]]),
            },
            MESSAGE_TYPE_GET_PARAMETERS => RequestKind::GetParameters,
            MESSAGE_TYPE_RESET_PARAMETERS => RequestKind::ResetParameters,
            MESSAGE_TYPE_SET_PARAMETERS => {
                RequestKind::SetParameters(SetParametersRequest::decode(extra[0], body))
            }
            MESSAGE_TYPE_ESCAPE => RequestKind::Escape,
            MESSAGE_TYPE_ICC_CLOCK => RequestKind::IccClock {
                clock_command: extra[0],
            },
            MESSAGE_TYPE_T0_APDU => RequestKind::T0Apdu {
                changes: extra[0],
                class_get_response: extra[1],
                class_envelope: extra[2],
            },
            MESSAGE_TYPE_SECURE => {
                let level_parameter = u16::from_le_bytes([extra[1], extra[2]]);
                RequestKind::Secure {
                    bwi: extra[0],
                    level_parameter,
                    operation: SecureOperation::decode(level_parameter, body),
                }
            }
            MESSAGE_TYPE_MECHANICAL => RequestKind::Mechanical { function: extra[0] },
            MESSAGE_TYPE_ABORT => RequestKind::Abort,
            MESSAGE_TYPE_SET_RATE_AND_CLOCK => RequestKind::SetRateAndClock,
            other => return Err(Error::InvalidMessageType(other)),
        };
        Ok((
            Self {
                length,
                slot,
                seq,
                kind,
            },
            body,
        ))
    }

    pub fn message_type(&self) -> u8 {
        match self.kind {
            RequestKind::PowerOn { .. } => MESSAGE_TYPE_POWER_ON,
            RequestKind::PowerOff => MESSAGE_TYPE_POWER_OFF,
            RequestKind::GetSlotStatus => MESSAGE_TYPE_GET_SLOT_STATUS,
            RequestKind::XfrBlock { .. } => MESSAGE_TYPE_XFR_BLOCK,
            RequestKind::GetParameters => MESSAGE_TYPE_GET_PARAMETERS,
            RequestKind::ResetParameters => MESSAGE_TYPE_RESET_PARAMETERS,
            RequestKind::SetParameters(_) => MESSAGE_TYPE_SET_PARAMETERS,
            RequestKind::Escape => MESSAGE_TYPE_ESCAPE,
            RequestKind::IccClock { .. } => MESSAGE_TYPE_ICC_CLOCK,
            RequestKind::T0Apdu { .. } => MESSAGE_TYPE_T0_APDU,
            RequestKind::Secure { .. } => MESSAGE_TYPE_SECURE,
            RequestKind::Mechanical { .. } => MESSAGE_TYPE_MECHANICAL,
            RequestKind::Abort => MESSAGE_TYPE_ABORT,
            RequestKind::SetRateAndClock => MESSAGE_TYPE_SET_RATE_AND_CLOCK,
        }
    }

    fn type_specific_bytes(&self) -> [u8; 3] {
        match &self.kind {
            RequestKind::PowerOn { power_select } => [*power_select, 0, 0],
            RequestKind::XfrBlock {
                bwi,
                level_parameter,
            } => {
                let level = level_parameter.to_le_bytes();
                [*bwi, level[0], level[1]]
            }
            RequestKind::SetParameters(params) => [params.protocol_num(), 0, 0],
            RequestKind::IccClock { clock_command } => [*clock_command, 0, 0],
            RequestKind::T0Apdu {
                changes,
                class_get_response,
                class_envelope,
            } => [*changes, *class_get_response, *class_envelope],
            RequestKind::Secure {
                bwi,
                level_parameter,
                ..
            } => {
                let level = level_parameter.to_le_bytes();
                [*bwi, level[0], level[1]]
            }
            RequestKind::Mechanical { function } => [*function, 0, 0],
            _ => [0, 0, 0],
        }
    }

    /// Serialise the 10-byte header followed by the payload.
    pub fn to_bytes(&self, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BULK_HEADER_LEN + body.len());
        bytes.push(self.message_type());
        bytes.extend_from_slice(&self.length.to_le_bytes());
        bytes.push(self.slot);
        bytes.push(self.seq);
        bytes.extend_from_slice(&self.type_specific_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    /// Create a PC_to_RDR_IccPowerOn request
    pub fn power_on(slot: u8, seq: u8) -> Self {
        Self {
            length: 0,
            slot,
            seq,
            kind: RequestKind::PowerOn { power_select: 0 },
        }
    }

    /// Create a PC_to_RDR_IccPowerOff request
    pub fn power_off(slot: u8, seq: u8) -> Self {
        Self {
            length: 0,
            slot,
            seq,
            kind: RequestKind::PowerOff,
        }
    }

    /// Create a PC_to_RDR_GetSlotStatus request
    pub fn get_slot_status(slot: u8, seq: u8) -> Self {
        Self {
            length: 0,
            slot,
            seq,
            kind: RequestKind::GetSlotStatus,
        }
    }

    /// Create a PC_to_RDR_XfrBlock request for a payload of `length` bytes
    pub fn xfr_block(slot: u8, seq: u8, length: u32, level_parameter: u16) -> Self {
        Self {
            length,
            slot,
            seq,
            kind: RequestKind::XfrBlock {
                bwi: 0,
                level_parameter,
            },
        }
    }

    /// Create a PC_to_RDR_Abort request
    pub fn abort(slot: u8, seq: u8) -> Self {
        Self {
            length: 0,
            slot,
            seq,
            kind: RequestKind::Abort,
        }
    }
}

/// Type-specific view of a bulk-IN response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    DataBlock { chain_parameter: ChainParameter },
    SlotStatus { clock_status: u8 },
    Parameters { protocol: u8 },
    Escape,
    RateAndClock { clock_khz: u32, rate_bps: u32 },
}

/// One bulk-IN response message. `dwLength` is derived from the payload at
/// encode time; the status byte packs bmICCStatus into bits 0-1 and
/// bmCommandStatus into bits 6-7, with bits 2-5 written as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub slot: u8,
    pub seq: u8,
    pub icc_status: IccStatus,
    pub command_status: CommandStatus,
    pub error: u8,
    pub kind: ResponseKind,
    pub body: Vec<u8>,
}

impl Response {
    pub fn message_type(&self) -> u8 {
        match self.kind {
            ResponseKind::DataBlock { .. } => MESSAGE_TYPE_DATA_BLOCK,
            ResponseKind::SlotStatus { .. } => MESSAGE_TYPE_SLOT_STATUS,
            ResponseKind::Parameters { .. } => MESSAGE_TYPE_PARAMETERS,
            ResponseKind::Escape => MESSAGE_TYPE_ESCAPE_RESPONSE,
            ResponseKind::RateAndClock { .. } => MESSAGE_TYPE_RATE_AND_CLOCK,
        }
    }

    /// Serialise header and payload into one wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let (specific, tail) = match self.kind {
            ResponseKind::DataBlock { chain_parameter } => (chain_parameter as u8, None),
            ResponseKind::SlotStatus { clock_status } => (clock_status, None),
            ResponseKind::Parameters { protocol } => (protocol, None),
            ResponseKind::Escape => (0, None),
            ResponseKind::RateAndClock {
                clock_khz,
                rate_bps,
            } => {
                let mut tail = [0u8; 8];
                tail[..4].copy_from_slice(&clock_khz.to_le_bytes());
                tail[4..].copy_from_slice(&rate_bps.to_le_bytes());
                (0, Some(tail))
            }
        };
        let tail = tail.as_ref().map(|t| &t[..]).unwrap_or(&[]);
        let length = (self.body.len() + tail.len()) as u32;
        let status = (self.icc_status as u8) | ((self.command_status as u8) << 6);

        let mut bytes = Vec::with_capacity(BULK_HEADER_LEN + length as usize);
        bytes.push(self.message_type());
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.push(self.slot);
        bytes.push(self.seq);
        bytes.push(status);
        bytes.push(self.error);
        bytes.push(specific);
        bytes.extend_from_slice(tail);
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Decode a bulk-IN buffer back into a response. Reserved status bits
    /// are masked off and ignored.
    pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
        if buffer.len() < BULK_HEADER_LEN {
            return Err(Error::Malformed("bulk message shorter than its header"));
        }
        let length = u32::from_le_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
        if buffer.len() < BULK_HEADER_LEN + length {
            return Err(Error::Malformed("bulk message shorter than dwLength"));
        }
        let icc_status = IccStatus::from_bits(buffer[7] & 0x03)?;
        let command_status = CommandStatus::from_bits(buffer[7] >> 6)?;
        let body = &buffer[BULK_HEADER_LEN..BULK_HEADER_LEN + length];

        let (kind, body) = match buffer[0] {
            MESSAGE_TYPE_DATA_BLOCK => (
                ResponseKind::DataBlock {
                    chain_parameter: ChainParameter::from_byte(buffer[9])?,
                },
                body.to_vec(),
            ),
            MESSAGE_TYPE_SLOT_STATUS => (
                ResponseKind::SlotStatus {
                    clock_status: buffer[9],
                },
                body.to_vec(),
            ),
            MESSAGE_TYPE_PARAMETERS => (
                ResponseKind::Parameters {
                    protocol: buffer[9],
                },
                body.to_vec(),
            ),
            MESSAGE_TYPE_ESCAPE_RESPONSE => (ResponseKind::Escape, body.to_vec()),
            MESSAGE_TYPE_RATE_AND_CLOCK => {
                if body.len() < 8 {
                    return Err(Error::Malformed("short rate-and-clock payload"));
                }
                (
                    ResponseKind::RateAndClock {
                        clock_khz: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
                        rate_bps: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    },
                    Vec::new(),
                )
            }
            other => return Err(Error::InvalidMessageType(other)),
        };
        Ok(Self {
            slot: buffer[5],
            seq: buffer[6],
            icc_status,
            command_status,
            error: buffer[8],
            kind,
            body,
        })
    }
}

/// Presence snapshot of one slot as carried by NotifySlotChange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub present: bool,
    pub changed: bool,
}

/// Interrupt-IN messages (reader to host)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Two bits per slot: present in the even bit, changed in the odd bit.
    /// Four slots pack into a byte; the last byte is zero-padded.
    SlotChange(Vec<SlotState>),
    HardwareError { slot: u8, seq: u8, code: u8 },
}

impl Notification {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SlotChange(states) => {
                let mut bytes = vec![0u8; 1 + states.len().div_ceil(4)];
                bytes[0] = MESSAGE_TYPE_SLOT_CHANGE;
                for (index, state) in states.iter().enumerate() {
                    let shift = (index % 4) * 2;
                    let byte = &mut bytes[1 + index / 4];
                    if state.present {
                        *byte |= 1 << shift;
                    }
                    if state.changed {
                        *byte |= 1 << (shift + 1);
                    }
                }
                bytes
            }
            Self::HardwareError { slot, seq, code } => {
                vec![MESSAGE_TYPE_HARDWARE_ERROR, *slot, *seq, *code]
            }
        }
    }

    /// Decode an interrupt-IN buffer. SlotChange yields one state per bit
    /// pair, including any zero-padding pairs in the final byte.
    pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
        match buffer.first() {
            Some(&MESSAGE_TYPE_SLOT_CHANGE) => {
                let mut states = Vec::with_capacity((buffer.len() - 1) * 4);
                for byte in &buffer[1..] {
                    for pair in 0..4 {
                        let bits = byte >> (pair * 2);
                        states.push(SlotState {
                            present: bits & 1 != 0,
                            changed: bits & 2 != 0,
                        });
                    }
                }
                Ok(Self::SlotChange(states))
            }
            Some(&MESSAGE_TYPE_HARDWARE_ERROR) => {
                if buffer.len() < 4 {
                    return Err(Error::Malformed("short hardware error notification"));
                }
                Ok(Self::HardwareError {
                    slot: buffer[1],
                    seq: buffer[2],
                    code: buffer[3],
                })
            }
            Some(&other) => Err(Error::InvalidMessageType(other)),
            None => Err(Error::Malformed("empty notification")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let request = Request::xfr_block(2, 9, 5, 1);
        let bytes = request.to_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(bytes.len(), BULK_HEADER_LEN + 5);

        let (parsed, body) = Request::decode(&bytes).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(body, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_get_slot_status_literal_bytes() {
        let bytes = Request::get_slot_status(0, 7).to_bytes(&[]);
        assert_eq!(bytes, [0x65, 0, 0, 0, 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = Request::abort(0, 0).to_bytes(&[]);
        bytes[0] = 0x42;
        assert!(matches!(
            Request::decode(&bytes),
            Err(Error::InvalidMessageType(0x42))
        ));
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(Request::decode(&[0x65, 0, 0]).is_err());
    }

    #[test]
    fn test_set_parameters_subtype_t1() {
        let tail = [0x11, 0x11, 0xFE, 0x55, 0x03, 0xFE, 0x00];
        let mut bytes = vec![0x61, 7, 0, 0, 0, 0, 3, 1, 0, 0];
        bytes.extend_from_slice(&tail);

        let (request, body) = Request::decode(&bytes).unwrap();
        assert_eq!(body, &tail);
        match request.kind {
            RequestKind::SetParameters(SetParametersRequest::T1(params)) => {
                assert_eq!(params.findex_dindex, 0x11);
                assert_eq!(params.ifsc, 0xFE);
                assert_eq!(params.nad, 0);
                assert_eq!(params.encode(), tail);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_set_parameters_subtype_t0() {
        let mut bytes = vec![0x61, 5, 0, 0, 0, 0, 3, 0, 0, 0];
        bytes.extend_from_slice(&[0x11, 0x00, 0x00, 0x0A, 0x00]);

        let (request, _) = Request::decode(&bytes).unwrap();
        assert!(matches!(
            request.kind,
            RequestKind::SetParameters(SetParametersRequest::T0(_))
        ));
    }

    #[test]
    fn test_set_parameters_unknown_protocol() {
        let bytes = [0x61, 0, 0, 0, 0, 0, 3, 9, 0, 0];
        let (request, _) = Request::decode(&bytes).unwrap();
        assert!(matches!(
            request.kind,
            RequestKind::SetParameters(SetParametersRequest::Other { protocol: 9 })
        ));
    }

    #[test]
    fn test_secure_pin_verification_subtype() {
        let pin_block = [
            0u8, // bPINOperation: verification
            30,  // bTimeOut
            0x82, 0x04, 0x02, // format / PIN block / length format
            0x06, 0x00, // wPINMaxExtraDigit
            0x02, // bEntryValidationCondition
            0x01, // bNumberMessage
            0x09, 0x04, // wLangId
            0x00, // bMsgIndex
            0x00, 0x00, 0x00, // bTeoPrologue
        ];
        let mut bytes = vec![0x69, pin_block.len() as u8, 0, 0, 0, 0, 1, 0, 0, 0];
        bytes.extend_from_slice(&pin_block);

        let (request, _) = Request::decode(&bytes).unwrap();
        match request.kind {
            RequestKind::Secure {
                level_parameter: 0,
                operation: SecureOperation::PinVerification(pin),
                ..
            } => {
                assert_eq!(pin.time_out, 30);
                assert_eq!(pin.pin_max_extra_digit, 6);
                assert_eq!(pin.lang_id, 0x0409);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_secure_pin_modification_message_count() {
        let mut pin_block = vec![
            1u8, // bPINOperation: modification
            30, 0x82, 0x04, 0x02, // timeout, format, block, length format
            0x00, 0x08, // insertion offsets
            0x06, 0x00, // wPINMaxExtraDigit
            0x01, // bConfirmPIN
            0x02, // bEntryValidationCondition
            0x02, // bNumberMessage: two message indexes
            0x09, 0x04, // wLangId
            0x00, // bMsgIndex1
            0x01, // bMsgIndex2
        ];
        pin_block.extend_from_slice(&[0, 0, 0]); // bTeoPrologue
        let mut bytes = vec![0x69, pin_block.len() as u8, 0, 0, 0, 0, 2, 0, 1, 0];
        bytes.extend_from_slice(&pin_block);

        let (request, _) = Request::decode(&bytes).unwrap();
        match request.kind {
            RequestKind::Secure {
                level_parameter: 1,
                operation: SecureOperation::PinModification(pin),
                ..
            } => {
                assert_eq!(pin.number_message, 2);
                assert_eq!(pin.msg_index2, Some(1));
                assert_eq!(pin.msg_index3, None);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_secure_continuation_is_opaque() {
        let bytes = [0x69, 0, 0, 0, 0, 0, 4, 0, 0x10, 0];
        let (request, _) = Request::decode(&bytes).unwrap();
        assert!(matches!(
            request.kind,
            RequestKind::Secure {
                operation: SecureOperation::Opaque,
                ..
            }
        ));
    }

    #[test]
    fn test_chain_parameter_tables() {
        assert_eq!(ChainParameter::to_start_stop(0), Some((true, true)));
        assert_eq!(ChainParameter::to_start_stop(1), Some((true, false)));
        assert_eq!(ChainParameter::to_start_stop(2), Some((false, true)));
        assert_eq!(ChainParameter::to_start_stop(3), Some((false, false)));
        assert_eq!(ChainParameter::to_start_stop(0x10), None);

        for level in 0..4u16 {
            let (start, stop) = ChainParameter::to_start_stop(level).unwrap();
            assert_eq!(ChainParameter::from_start_stop(start, stop) as u16, level);
        }
    }

    #[test]
    fn test_response_encode_literal_bytes() {
        // GET_SLOT_STATUS response, no card in slot 0, seq 7
        let response = Response {
            slot: 0,
            seq: 7,
            icc_status: IccStatus::NotPresent,
            command_status: CommandStatus::Ok,
            error: 0,
            kind: ResponseKind::SlotStatus { clock_status: 0 },
            body: Vec::new(),
        };
        assert_eq!(response.encode(), [0x81, 0, 0, 0, 0, 0, 7, 0x02, 0, 0]);
    }

    #[test]
    fn test_response_status_byte_packing() {
        let response = Response {
            slot: 1,
            seq: 2,
            icc_status: IccStatus::Inactive,
            command_status: CommandStatus::Failed,
            error: 0xFE,
            kind: ResponseKind::DataBlock {
                chain_parameter: ChainParameter::BeginAndEnd,
            },
            body: Vec::new(),
        };
        let bytes = response.encode();
        assert_eq!(bytes[7], 0x41);
        assert_eq!(bytes[8], 0xFE);
    }

    #[test]
    fn test_response_decode_masks_reserved_bits() {
        let mut bytes = Response {
            slot: 0,
            seq: 0,
            icc_status: IccStatus::NotPresent,
            command_status: CommandStatus::Ok,
            error: 0,
            kind: ResponseKind::SlotStatus { clock_status: 0 },
            body: Vec::new(),
        }
        .encode();
        // Set the reserved bits 2-5; the decoder must ignore them.
        bytes[7] |= 0x3C;
        let decoded = Response::decode(&bytes).unwrap();
        assert_eq!(decoded.icc_status, IccStatus::NotPresent);
        assert_eq!(decoded.command_status, CommandStatus::Ok);
    }

    #[test]
    fn test_response_round_trip_with_body() {
        let response = Response {
            slot: 0,
            seq: 3,
            icc_status: IccStatus::Active,
            command_status: CommandStatus::Ok,
            error: 0,
            kind: ResponseKind::DataBlock {
                chain_parameter: ChainParameter::Begin,
            },
            body: vec![0x3B, 0x80, 0x01, 0x01],
        };
        let bytes = response.encode();
        assert_eq!(
            u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            4
        );
        assert_eq!(Response::decode(&bytes).unwrap(), response);
    }

    #[test]
    fn test_rate_and_clock_payload() {
        let response = Response {
            slot: 0,
            seq: 1,
            icc_status: IccStatus::Active,
            command_status: CommandStatus::Failed,
            error: 0,
            kind: ResponseKind::RateAndClock {
                clock_khz: 3580,
                rate_bps: 9600,
            },
            body: Vec::new(),
        };
        let bytes = response.encode();
        assert_eq!(bytes.len(), BULK_HEADER_LEN + 8);
        assert_eq!(
            u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            8
        );
        assert_eq!(Response::decode(&bytes).unwrap(), response);
    }

    #[test]
    fn test_notification_packing() {
        let notification = Notification::SlotChange(vec![
            SlotState {
                present: true,
                changed: true,
            },
            SlotState {
                present: false,
                changed: true,
            },
            SlotState {
                present: true,
                changed: false,
            },
            SlotState {
                present: false,
                changed: false,
            },
            SlotState {
                present: true,
                changed: true,
            },
        ]);
        let bytes = notification.encode();
        // 5 slots need two bitmap bytes after the message type.
        assert_eq!(bytes, [0x50, 0b0001_1011, 0b0000_0011]);

        match Notification::decode(&bytes).unwrap() {
            Notification::SlotChange(states) => {
                assert_eq!(states.len(), 8);
                assert!(states[0].present && states[0].changed);
                assert!(!states[1].present && states[1].changed);
                assert!(states[4].present && states[4].changed);
                assert!(!states[7].present && !states[7].changed);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_hardware_error_notification() {
        let notification = Notification::HardwareError {
            slot: 1,
            seq: 9,
            code: 0x01,
        };
        let bytes = notification.encode();
        assert_eq!(bytes, [0x51, 1, 9, 0x01]);
        assert_eq!(Notification::decode(&bytes).unwrap(), notification);
    }
}
