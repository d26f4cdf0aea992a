use crate::card::Card;
use crate::gadget::{CompletionStatus, GadgetBackend};
use crate::message::{
    ChainParameter, Notification, Request, RequestKind, Response, ResponseKind,
    SetParametersRequest, SlotState, T1Parameters, SET_PARAMETERS_T1_LEN,
};
use crate::slot::Slot;
use crate::usb::{
    interrupt_max_packet_size, CommandStatus, IccStatus, IccdDescriptor, CCID_REQ_ABORT,
    CCID_REQ_GET_CLOCK_FREQUENCIES, CCID_REQ_GET_DATA_RATES, CLOCK_STATUS_RUNNING,
    CLOCK_STATUS_STOPPED, DATA_MAX_LENGTH, ERROR_BAD_LENGTH, ERROR_BAD_WLEVEL, ERROR_CMD_ABORTED,
    ERROR_CMD_NOT_SUPPORTED, ERROR_ICC_MUTE, ERROR_POWERSELECT_NOT_SUPPORTED,
    ERROR_PROTOCOLNUM_NOT_SUPPORTED, ERROR_SLOT_DOES_NOT_EXIST, USB_DIR_IN, USB_RECIP_INTERFACE,
    USB_RECIP_MASK, USB_TYPE_CLASS, USB_TYPE_MASK,
};
use crate::Error;

/// Parameter block reported for every GET/RESET/SET_PARAMETERS success.
/// The reader negotiates nothing; hosts get these fixed T=1 values.
const DEFAULT_T1_PARAMETERS: T1Parameters = T1Parameters {
    findex_dindex: 0x11,
    tccks: 0x11,
    guard_time: 0xFE,
    waiting_integers: 0x55,
    clock_stop: CLOCK_STATUS_STOPPED,
    ifsc: 0xFE,
    nad: 0,
};

/// Outcome of dispatching one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Ordered group of messages to submit on bulk IN.
    Responses(Vec<Response>),
    /// A bulk abort arrived before its control counterpart; nothing goes
    /// out now, the control endpoint will emit the response later.
    AbortPending,
}

/// USB ICCD function: the CCID message engine behind a gadget interface.
///
/// Owns the slots and the endpoint backend. The gadget glue feeds it
/// lifecycle callbacks, SETUP packets and bulk-OUT completions; the
/// application side inserts and removes cards.
pub struct IccdFunction<B: GadgetBackend> {
    backend: B,
    slots: Vec<Slot>,
    enabled: bool,
    descriptor: IccdDescriptor,
    clocks_khz: Vec<u32>,
    rates_bps: Vec<u32>,
}

impl<B: GadgetBackend> IccdFunction<B> {
    /// Create a function exposing `slot_count` empty slots.
    pub fn new(backend: B, slot_count: usize) -> Result<Self, Error> {
        if slot_count == 0 || slot_count > 255 {
            return Err(Error::InvalidConfiguration(
                "slot count must be between 1 and 255",
            ));
        }
        // Same values as USB-ICC ICCD rev 1.0; they are meaningless for a
        // virtual reader anyway.
        let clocks_khz = vec![3580];
        let rates_bps = vec![9600];
        let clock_khz = *clocks_khz
            .iter()
            .max()
            .ok_or(Error::InvalidConfiguration("empty clock list"))?;
        let rate_bps = *rates_bps
            .iter()
            .max()
            .ok_or(Error::InvalidConfiguration("empty data rate list"))?;
        Ok(Self {
            backend,
            slots: (0..slot_count).map(|_| Slot::new()).collect(),
            enabled: false,
            descriptor: IccdDescriptor::new(slot_count as u8, clock_khz, rate_bps)?,
            clocks_khz,
            rates_bps,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The class-specific descriptor the gadget glue registers.
    pub fn descriptor(&self) -> IccdDescriptor {
        self.descriptor
    }

    /// wMaxPacketSize for the interrupt IN endpoint descriptor.
    pub fn interrupt_max_packet_size(&self) -> u16 {
        interrupt_max_packet_size(self.slots.len())
    }

    /// Insert `card` into slot `slot` and notify the host.
    pub async fn insert(&mut self, slot: usize, card: Box<dyn Card>) -> Result<(), Error> {
        self.slots
            .get_mut(slot)
            .ok_or(Error::BadSlot(slot))?
            .insert(card)?;
        log::info!("card inserted in slot {slot}");
        self.notify_slot_change().await
    }

    /// Remove the card from slot `slot`, notify the host, and hand the
    /// card back.
    pub async fn remove(&mut self, slot: usize) -> Result<Box<dyn Card>, Error> {
        let card = self
            .slots
            .get_mut(slot)
            .ok_or(Error::BadSlot(slot))?
            .remove()?;
        log::info!("card removed from slot {slot}");
        self.notify_slot_change().await?;
        Ok(card)
    }

    /// Called when the gadget gets bound to the bus.
    pub async fn on_bind(&mut self) -> Result<(), Error> {
        self.notify_slot_change().await
    }

    /// Called when the gadget gets unbound from the bus.
    pub async fn on_unbind(&mut self) -> Result<(), Error> {
        self.enabled = false;
        for slot in &mut self.slots {
            slot.power_off();
        }
        Ok(())
    }

    /// Called when the host enables this function.
    pub async fn on_enable(&mut self) -> Result<(), Error> {
        self.enabled = true;
        self.notify_slot_change().await
    }

    /// Called when the host disables this function.
    pub async fn on_disable(&mut self) -> Result<(), Error> {
        self.enabled = false;
        for slot in &mut self.slots {
            slot.power_off();
        }
        Ok(())
    }

    /// Called for SETUP packets addressed to this interface.
    ///
    /// Serves the three CCID class requests; anything else halts
    /// endpoint 0 in the direction of the request.
    pub async fn on_setup(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        length: u16,
    ) -> Result<(), Error> {
        if request_type & USB_TYPE_MASK == USB_TYPE_CLASS
            && request_type & USB_RECIP_MASK == USB_RECIP_INTERFACE
        {
            if request_type & USB_DIR_IN == USB_DIR_IN {
                let values = match request {
                    CCID_REQ_GET_CLOCK_FREQUENCIES => Some(&self.clocks_khz),
                    CCID_REQ_GET_DATA_RATES => Some(&self.rates_bps),
                    _ => None,
                };
                if let Some(values) = values {
                    let mut data: Vec<u8> =
                        values.iter().flat_map(|v| v.to_le_bytes()).collect();
                    data.truncate(length as usize);
                    self.backend.ep0_write(&data).await?;
                    return Ok(());
                }
            } else if request == CCID_REQ_ABORT {
                // wValue: slot in the low byte, sequence in the high byte
                let slot_index = (value & 0xFF) as usize;
                let sequence = (value >> 8) as u8;
                let Some(slot) = self.slots.get_mut(slot_index) else {
                    return self.backend.ep0_halt(request_type).await;
                };
                log::debug!("control abort for slot {slot_index}, seq {sequence}");
                if let Some(response) = slot.abort_from_control(sequence) {
                    self.backend.submit_bulk_in(vec![response.encode()]).await?;
                }
                self.backend.ep0_read(0).await?;
                return Ok(());
            }
        }
        // Standard-request handling lives in the gadget glue; whatever
        // reaches here is not for us.
        self.backend.ep0_halt(request_type).await
    }

    /// Called when a bulk-OUT transfer completes.
    ///
    /// Decodes the request, runs the dispatcher, and submits the resulting
    /// message group on bulk IN. Processing failures (as opposed to
    /// protocol-level errors, which become responses) halt bulk IN and
    /// propagate.
    pub async fn on_bulk_out_complete(
        &mut self,
        data: &[u8],
        status: CompletionStatus,
    ) -> Result<(), Error> {
        match status {
            CompletionStatus::Complete => {}
            CompletionStatus::Shutdown => return Ok(()),
            CompletionStatus::Error(errno) => return Err(Error::Transfer(errno)),
        }
        let reply = match Request::decode(data) {
            Ok((request, body)) => {
                log::debug!(
                    "bulk-OUT request: type={message_type:#04x}, len={length}, slot={slot}, seq={seq}",
                    message_type = request.message_type(),
                    length = request.length,
                    slot = request.slot,
                    seq = request.seq,
                );
                log::trace!("request bytes: {data:02x?}");
                self.on_iccd_request(&request, body)
            }
            Err(Error::InvalidMessageType(message_type)) => {
                log::debug!("unsupported bMessageType {message_type:#04x}");
                Ok(Reply::Responses(vec![self.unknown_type_response(data)]))
            }
            Err(err) => Err(err),
        };
        match reply {
            Ok(Reply::Responses(responses)) => {
                log::debug!(
                    "submitting {count} bulk-IN message(s)",
                    count = responses.len()
                );
                let buffers = responses.iter().map(Response::encode).collect();
                self.backend.submit_bulk_in(buffers).await
            }
            Ok(Reply::AbortPending) => Ok(()),
            Err(err) => {
                log::error!("bulk request processing failed: {err}");
                if let Err(halt_err) = self.backend.halt_bulk_in().await {
                    log::warn!("halting bulk-IN failed too: {halt_err}");
                }
                Err(err)
            }
        }
    }

    /// Handle one decoded bulk request. Inspired by WSGI design: the
    /// return value is the full ordered response group, or the marker that
    /// an abort response is parked with the control endpoint.
    pub fn on_iccd_request(&mut self, request: &Request, body: &[u8]) -> Result<Reply, Error> {
        // No command may run on a non-existent slot.
        let Some(slot) = self.slots.get_mut(request.slot as usize) else {
            return Ok(Reply::Responses(vec![failure(
                request,
                IccStatus::NotPresent,
                ERROR_SLOT_DOES_NOT_EXIST,
            )]));
        };

        // Messages served with or without a card.
        match request.kind {
            RequestKind::Abort => {
                if request.length != 0 {
                    return Ok(fail(request, slot, ERROR_BAD_LENGTH));
                }
                let response = respond(
                    request,
                    slot.status(),
                    ResponseKind::SlotStatus {
                        clock_status: CLOCK_STATUS_RUNNING,
                    },
                    Vec::new(),
                );
                return Ok(match slot.abort_from_bulk(response) {
                    Some(response) => Reply::Responses(vec![response]),
                    None => Reply::AbortPending,
                });
            }
            RequestKind::PowerOff => {
                if request.length != 0 {
                    return Ok(fail(request, slot, ERROR_BAD_LENGTH));
                }
                slot.power_off();
                return Ok(slot_status_reply(request, slot));
            }
            RequestKind::GetSlotStatus => {
                if request.length != 0 {
                    return Ok(fail(request, slot, ERROR_BAD_LENGTH));
                }
                return Ok(slot_status_reply(request, slot));
            }
            // Single-clock, single-rate reader.
            RequestKind::SetRateAndClock => {
                return Ok(fail(request, slot, ERROR_CMD_NOT_SUPPORTED));
            }
            _ => {}
        }

        // All other commands require a card being present.
        if slot.status() == IccStatus::NotPresent {
            return Ok(fail(request, slot, ERROR_ICC_MUTE));
        }

        match &request.kind {
            RequestKind::GetParameters | RequestKind::ResetParameters => {
                if request.length != 0 {
                    return Ok(fail(request, slot, ERROR_BAD_LENGTH));
                }
                return Ok(parameters_reply(request, slot));
            }
            RequestKind::SetParameters(params) => {
                let error = match params {
                    SetParametersRequest::T1(_) if request.length == SET_PARAMETERS_T1_LEN => {
                        return Ok(parameters_reply(request, slot));
                    }
                    SetParametersRequest::T1(_) => ERROR_BAD_LENGTH,
                    SetParametersRequest::Other { protocol: 1 } => ERROR_BAD_LENGTH,
                    _ => ERROR_PROTOCOLNUM_NOT_SUPPORTED,
                };
                return Ok(fail(request, slot, error));
            }
            // Cannot stop the clock, and no motor in this reader.
            RequestKind::IccClock { .. } | RequestKind::Mechanical { .. } => {
                return Ok(fail(request, slot, ERROR_CMD_NOT_SUPPORTED));
            }
            _ => {}
        }

        // Reject everything else while an abort is going on.
        if slot.is_aborting() {
            return Ok(fail(request, slot, ERROR_CMD_ABORTED));
        }

        match &request.kind {
            RequestKind::PowerOn { power_select } => {
                if request.length != 0 {
                    return Ok(fail(request, slot, ERROR_BAD_LENGTH));
                }
                if *power_select != 0 {
                    return Ok(fail(request, slot, ERROR_POWERSELECT_NOT_SUPPORTED));
                }
                let atr = slot.power_on()?;
                Ok(Reply::Responses(vec![respond(
                    request,
                    slot.status(),
                    ResponseKind::DataBlock {
                        chain_parameter: ChainParameter::BeginAndEnd,
                    },
                    atr,
                )]))
            }
            RequestKind::XfrBlock {
                level_parameter, ..
            } => {
                if body.len() != request.length as usize {
                    return Ok(fail(request, slot, ERROR_BAD_LENGTH));
                }
                let Some((start, stop)) = ChainParameter::to_start_stop(*level_parameter) else {
                    return Ok(fail(request, slot, ERROR_BAD_WLEVEL));
                };
                if start {
                    slot.clear_apdu();
                }
                slot.store_apdu(body);
                if stop {
                    let response_body = slot.run_apdu()?;
                    Ok(Reply::Responses(fragment(
                        request,
                        slot.status(),
                        &response_body,
                    )))
                } else {
                    Ok(Reply::Responses(vec![respond(
                        request,
                        slot.status(),
                        ResponseKind::DataBlock {
                            chain_parameter: ChainParameter::Continue,
                        },
                        Vec::new(),
                    )]))
                }
            }
            // No escape features, no T=0 support, no PIN pad.
            _ => Ok(fail(request, slot, ERROR_CMD_NOT_SUPPORTED)),
        }
    }

    /// Response for a type byte the codec has no mapping for: echo the raw
    /// header fields back with a slot-status failure.
    fn unknown_type_response(&self, data: &[u8]) -> Response {
        let slot = data[5];
        let seq = data[6];
        let (icc_status, error) = match self.slots.get(slot as usize) {
            Some(slot) => (slot.status(), ERROR_CMD_NOT_SUPPORTED),
            None => (IccStatus::NotPresent, ERROR_SLOT_DOES_NOT_EXIST),
        };
        Response {
            slot,
            seq,
            icc_status,
            command_status: CommandStatus::Failed,
            error,
            kind: ResponseKind::SlotStatus {
                clock_status: CLOCK_STATUS_RUNNING,
            },
            body: Vec::new(),
        }
    }

    /// Update the host on all slots which changed since the previous
    /// notification. Does nothing while the function is not enabled or
    /// when no slot changed.
    async fn notify_slot_change(&mut self) -> Result<(), Error> {
        if !self.enabled || !self.slots.iter().any(Slot::changed) {
            return Ok(());
        }
        let states: Vec<SlotState> = self
            .slots
            .iter_mut()
            .map(Slot::slot_change_notification)
            .collect();
        let buffer = Notification::SlotChange(states).encode();
        log::debug!("interrupt-IN slot change: {buffer:02x?}");
        self.backend.submit_interrupt_in(buffer).await
    }
}

/// Response echoing the request's slot and sequence, with the status byte
/// taken from the slot.
fn respond(request: &Request, icc_status: IccStatus, kind: ResponseKind, body: Vec<u8>) -> Response {
    Response {
        slot: request.slot,
        seq: request.seq,
        icc_status,
        command_status: CommandStatus::Ok,
        error: 0,
        kind,
        body,
    }
}

/// Failed response of the type matching the request, with the
/// type-specific byte zeroed.
fn failure(request: &Request, icc_status: IccStatus, error: u8) -> Response {
    let kind = match request.kind {
        RequestKind::PowerOn { .. } | RequestKind::XfrBlock { .. } | RequestKind::Secure { .. } => {
            ResponseKind::DataBlock {
                chain_parameter: ChainParameter::BeginAndEnd,
            }
        }
        RequestKind::GetParameters
        | RequestKind::ResetParameters
        | RequestKind::SetParameters(_) => ResponseKind::Parameters { protocol: 0 },
        RequestKind::Escape => ResponseKind::Escape,
        RequestKind::SetRateAndClock => ResponseKind::RateAndClock {
            clock_khz: 0,
            rate_bps: 0,
        },
        _ => ResponseKind::SlotStatus {
            clock_status: CLOCK_STATUS_RUNNING,
        },
    };
    Response {
        slot: request.slot,
        seq: request.seq,
        icc_status,
        command_status: CommandStatus::Failed,
        error,
        kind,
        body: Vec::new(),
    }
}

fn fail(request: &Request, slot: &Slot, error: u8) -> Reply {
    Reply::Responses(vec![failure(request, slot.status(), error)])
}

fn slot_status_reply(request: &Request, slot: &Slot) -> Reply {
    Reply::Responses(vec![respond(
        request,
        slot.status(),
        ResponseKind::SlotStatus {
            clock_status: CLOCK_STATUS_RUNNING,
        },
        Vec::new(),
    )])
}

fn parameters_reply(request: &Request, slot: &Slot) -> Reply {
    Reply::Responses(vec![respond(
        request,
        slot.status(),
        ResponseKind::Parameters { protocol: 1 },
        DEFAULT_T1_PARAMETERS.encode().to_vec(),
    )])
}

/// Split a card response into chained DATA_BLOCK messages of at most
/// DATA_MAX_LENGTH bytes each. A chunk of exactly the maximum length is
/// never final, so an exact multiple gets an empty trailing END message.
fn fragment(request: &Request, icc_status: IccStatus, body: &[u8]) -> Vec<Response> {
    let mut responses = Vec::with_capacity(body.len() / DATA_MAX_LENGTH + 1);
    let mut offset = 0;
    let mut start = true;
    loop {
        let end = body.len().min(offset + DATA_MAX_LENGTH);
        let chunk = &body[offset..end];
        let stop = chunk.len() < DATA_MAX_LENGTH;
        responses.push(respond(
            request,
            icc_status,
            ResponseKind::DataBlock {
                chain_parameter: ChainParameter::from_start_stop(start, stop),
            },
            chunk.to_vec(),
        ));
        if stop {
            break;
        }
        start = false;
        offset = end;
    }
    responses
}
