use crate::gadget::GadgetBackend;
use crate::Error;
use std::collections::VecDeque;

/// In-memory gadget backend.
///
/// Plays the role of the kernel endpoint files so the function can be
/// exercised without any USB hardware: submitted IN transfers land in
/// queues the caller drains, and halts are recorded as flags.
#[derive(Debug, Default)]
pub struct LoopbackGadget {
    bulk_in: VecDeque<Vec<u8>>,
    interrupt_in: VecDeque<Vec<u8>>,
    ep0_in: VecDeque<Vec<u8>>,
    bulk_in_halted: bool,
    ep0_halted: Option<u8>,
}

impl LoopbackGadget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every message queued on the bulk IN endpoint, oldest first.
    pub fn take_bulk_in(&mut self) -> Vec<Vec<u8>> {
        self.bulk_in.drain(..).collect()
    }

    /// Drain every message queued on the interrupt IN endpoint.
    pub fn take_interrupt_in(&mut self) -> Vec<Vec<u8>> {
        self.interrupt_in.drain(..).collect()
    }

    /// Drain every endpoint-0 data stage written so far.
    pub fn take_ep0_in(&mut self) -> Vec<Vec<u8>> {
        self.ep0_in.drain(..).collect()
    }

    pub fn bulk_in_halted(&self) -> bool {
        self.bulk_in_halted
    }

    /// bmRequestType of the SETUP packet that halted endpoint 0, if any
    pub fn ep0_halted(&self) -> Option<u8> {
        self.ep0_halted
    }

    pub fn clear_bulk_in_halt(&mut self) {
        self.bulk_in_halted = false;
    }
}

impl GadgetBackend for LoopbackGadget {
    async fn submit_bulk_in(&mut self, buffers: Vec<Vec<u8>>) -> Result<(), Error> {
        self.bulk_in.extend(buffers);
        Ok(())
    }

    async fn submit_interrupt_in(&mut self, buffer: Vec<u8>) -> Result<(), Error> {
        self.interrupt_in.push_back(buffer);
        Ok(())
    }

    async fn ep0_write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ep0_in.push_back(data.to_vec());
        Ok(())
    }

    async fn ep0_read(&mut self, length: usize) -> Result<Vec<u8>, Error> {
        // No host on the other side; the status-stage acknowledge and any
        // OUT data stage read back as zeroes.
        Ok(vec![0; length])
    }

    async fn ep0_halt(&mut self, request_type: u8) -> Result<(), Error> {
        self.ep0_halted = Some(request_type);
        Ok(())
    }

    async fn halt_bulk_in(&mut self) -> Result<(), Error> {
        self.bulk_in_halted = true;
        Ok(())
    }
}
