use crate::card::Card;
use crate::message::{Response, SlotState};
use crate::usb::IccStatus;
use crate::Error;

/// One card slot of the reader.
///
/// Applications drive `insert` and `remove` (through
/// [`IccdFunction`](crate::function::IccdFunction), which also pushes the
/// slot-change notification); everything else is called by the dispatcher.
pub struct Slot {
    status: IccStatus,
    changed: bool,
    data: Vec<Vec<u8>>,
    abort_response: Option<Response>,
    abort_control_sequence: Option<u8>,
    card: Option<Box<dyn Card>>,
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    pub fn new() -> Self {
        Self {
            status: IccStatus::NotPresent,
            changed: false,
            data: Vec::new(),
            abort_response: None,
            abort_control_sequence: None,
            card: None,
        }
    }

    pub fn status(&self) -> IccStatus {
        self.status
    }

    /// Whether the presence changed since the last notification read.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Insert `card` into this slot.
    ///
    /// Fails with [`Error::AlreadyPresent`] if the slot is occupied.
    pub fn insert(&mut self, card: Box<dyn Card>) -> Result<(), Error> {
        if self.card.is_some() {
            return Err(Error::AlreadyPresent);
        }
        self.card = Some(card);
        self.status = IccStatus::Inactive;
        self.clear_apdu();
        self.changed = true;
        Ok(())
    }

    /// Remove the card from this slot and return it.
    ///
    /// Fails with [`Error::NotPresent`] if the slot is empty.
    pub fn remove(&mut self) -> Result<Box<dyn Card>, Error> {
        let mut card = self.card.take().ok_or(Error::NotPresent)?;
        card.clear_volatile();
        self.status = IccStatus::NotPresent;
        self.clear_apdu();
        self.changed = true;
        Ok(card)
    }

    /// Whether an abort is in progress on either endpoint.
    pub fn is_aborting(&self) -> bool {
        self.abort_control_sequence.is_some() || self.abort_response.is_some()
    }

    /// Record an abort command received on the bulk endpoint.
    ///
    /// If the control abort for the same sequence number was already seen,
    /// the latch is cleared and `response` is handed back for transmission.
    /// Otherwise `response` is kept until the control side arrives and
    /// `None` signals that nothing goes out now.
    pub fn abort_from_bulk(&mut self, response: Response) -> Option<Response> {
        if self.abort_control_sequence == Some(response.seq) {
            self.abort_control_sequence = None;
            return Some(response);
        }
        if self.abort_response.is_some() {
            log::warn!(
                "bulk abort seq={seq} replaces an unmatched latched abort",
                seq = response.seq
            );
        }
        self.abort_response = Some(response);
        None
    }

    /// Record an abort request received on the control endpoint.
    ///
    /// If the bulk abort for `sequence` was already seen, its kept response
    /// is returned for transmission on bulk-IN. Otherwise the sequence
    /// number is latched and `None` is returned.
    pub fn abort_from_control(&mut self, sequence: u8) -> Option<Response> {
        match &self.abort_response {
            Some(response) if response.seq == sequence => self.abort_response.take(),
            _ => {
                self.abort_control_sequence = Some(sequence);
                None
            }
        }
    }

    /// Current presence and whether it changed since the last call.
    /// Reading resets the changed flag.
    pub fn slot_change_notification(&mut self) -> SlotState {
        let changed = self.changed;
        self.changed = false;
        SlotState {
            present: self.status != IccStatus::NotPresent,
            changed,
        }
    }

    /// Power the card up and return its Answer-To-Reset.
    pub fn power_on(&mut self) -> Result<Vec<u8>, Error> {
        let card = self.card.as_ref().ok_or(Error::NotPresent)?;
        if self.status == IccStatus::Inactive {
            self.status = IccStatus::Active;
        }
        debug_assert!(self.data.is_empty());
        let atr = card.atr()?;
        log::debug!("slot powered on, ATR: {atr:02x?}");
        Ok(atr)
    }

    /// Power the card down. A no-op unless the slot is active; any partial
    /// APDU transfer is dropped either way.
    pub fn power_off(&mut self) {
        if self.status == IccStatus::Active {
            self.status = IccStatus::Inactive;
            if let Some(card) = self.card.as_mut() {
                card.clear_volatile();
            }
        }
        self.clear_apdu();
    }

    /// Drop any previous, possibly incomplete, APDU transfer.
    pub fn clear_apdu(&mut self) {
        self.data.clear();
    }

    /// Store one chunk of a chained command APDU.
    pub fn store_apdu(&mut self, chunk: &[u8]) {
        self.data.push(chunk.to_vec());
    }

    /// Hand the accumulated APDU to the card and return its response.
    pub fn run_apdu(&mut self) -> Result<Vec<u8>, Error> {
        let card = self.card.as_mut().ok_or(Error::NotPresent)?;
        let command = match self.data.len() {
            1 => self.data.swap_remove(0),
            _ => self.data.concat(),
        };
        let response = card.run_apdu(&command)?;
        self.clear_apdu();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseKind;
    use crate::usb::CommandStatus;
    use std::cell::Cell;
    use std::rc::Rc;

    struct TestCard {
        atr: Vec<u8>,
        cleared: Rc<Cell<u32>>,
    }

    impl TestCard {
        fn new() -> Self {
            Self {
                atr: vec![0x3B, 0x80, 0x01, 0x01],
                cleared: Rc::new(Cell::new(0)),
            }
        }
    }

    impl Card for TestCard {
        fn atr(&self) -> Result<Vec<u8>, Error> {
            Ok(self.atr.clone())
        }

        fn run_apdu(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
            let mut response = command.to_vec();
            response.extend_from_slice(&[0x90, 0x00]);
            Ok(response)
        }

        fn clear_volatile(&mut self) {
            self.cleared.set(self.cleared.get() + 1);
        }
    }

    fn abort_response(seq: u8) -> Response {
        Response {
            slot: 0,
            seq,
            icc_status: IccStatus::Inactive,
            command_status: CommandStatus::Ok,
            error: 0,
            kind: ResponseKind::SlotStatus { clock_status: 0 },
            body: Vec::new(),
        }
    }

    #[test]
    fn test_state_machine_walk() {
        let mut slot = Slot::new();
        assert_eq!(slot.status(), IccStatus::NotPresent);

        slot.insert(Box::new(TestCard::new())).unwrap();
        assert_eq!(slot.status(), IccStatus::Inactive);

        slot.power_on().unwrap();
        assert_eq!(slot.status(), IccStatus::Active);

        slot.power_off();
        assert_eq!(slot.status(), IccStatus::Inactive);

        // powerOff while inactive is the only allowed self-loop
        slot.power_off();
        assert_eq!(slot.status(), IccStatus::Inactive);

        slot.remove().unwrap();
        assert_eq!(slot.status(), IccStatus::NotPresent);
    }

    #[test]
    fn test_double_insert_rejected() {
        let mut slot = Slot::new();
        slot.insert(Box::new(TestCard::new())).unwrap();
        assert!(matches!(
            slot.insert(Box::new(TestCard::new())),
            Err(Error::AlreadyPresent)
        ));
    }

    #[test]
    fn test_remove_empty_rejected() {
        let mut slot = Slot::new();
        assert!(matches!(slot.remove(), Err(Error::NotPresent)));
    }

    #[test]
    fn test_remove_clears_volatile_state() {
        let card = TestCard::new();
        let cleared = card.cleared.clone();
        let mut slot = Slot::new();
        slot.insert(Box::new(card)).unwrap();
        slot.remove().unwrap();
        assert_eq!(cleared.get(), 1);
    }

    #[test]
    fn test_power_off_clears_volatile_only_when_active() {
        let card = TestCard::new();
        let cleared = card.cleared.clone();
        let mut slot = Slot::new();
        slot.insert(Box::new(card)).unwrap();

        slot.power_off();
        assert_eq!(cleared.get(), 0);

        slot.power_on().unwrap();
        slot.power_off();
        assert_eq!(cleared.get(), 1);
    }

    #[test]
    fn test_changed_flag_bookkeeping() {
        let mut slot = Slot::new();
        let state = slot.slot_change_notification();
        assert!(!state.present && !state.changed);

        slot.insert(Box::new(TestCard::new())).unwrap();
        let state = slot.slot_change_notification();
        assert!(state.present && state.changed);

        // Reading resets the flag
        let state = slot.slot_change_notification();
        assert!(state.present && !state.changed);

        slot.remove().unwrap();
        let state = slot.slot_change_notification();
        assert!(!state.present && state.changed);
    }

    #[test]
    fn test_apdu_chunks_concatenated() {
        let mut slot = Slot::new();
        slot.insert(Box::new(TestCard::new())).unwrap();
        slot.power_on().unwrap();

        slot.store_apdu(&[0x00, 0xA4]);
        slot.store_apdu(&[0x04, 0x00]);
        let response = slot.run_apdu().unwrap();
        assert_eq!(response, [0x00, 0xA4, 0x04, 0x00, 0x90, 0x00]);

        // The buffer resets after execution
        slot.store_apdu(&[0x80, 0x01]);
        let response = slot.run_apdu().unwrap();
        assert_eq!(response, [0x80, 0x01, 0x90, 0x00]);
    }

    #[test]
    fn test_abort_bulk_first() {
        let mut slot = Slot::new();
        assert!(!slot.is_aborting());

        assert!(slot.abort_from_bulk(abort_response(7)).is_none());
        assert!(slot.is_aborting());

        let response = slot.abort_from_control(7).expect("matched abort");
        assert_eq!(response.seq, 7);
        assert!(!slot.is_aborting());
    }

    #[test]
    fn test_abort_control_first() {
        let mut slot = Slot::new();
        assert!(slot.abort_from_control(9).is_none());
        assert!(slot.is_aborting());

        let response = slot.abort_from_bulk(abort_response(9)).expect("matched abort");
        assert_eq!(response.seq, 9);
        assert!(!slot.is_aborting());
    }

    #[test]
    fn test_abort_sequence_mismatch_keeps_latch() {
        let mut slot = Slot::new();
        assert!(slot.abort_from_bulk(abort_response(3)).is_none());

        // A control abort for another sequence does not release the bulk
        // response.
        assert!(slot.abort_from_control(4).is_none());
        assert!(slot.is_aborting());

        let response = slot.abort_from_bulk(abort_response(4)).expect("matched abort");
        assert_eq!(response.seq, 4);
    }
}
