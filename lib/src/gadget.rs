use crate::Error;
use std::future::Future;

/// Completion status of a bulk-OUT transfer, as reported by the gadget
/// glue. A shutdown (endpoint disabled or function unbound mid-transfer)
/// is absorbed quietly; any other failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Complete,
    Shutdown,
    Error(i32),
}

/// Endpoint I/O consumed from the kernel gadget glue.
///
/// One implementation wraps the configfs/functionfs endpoint files of a
/// real gadget; [`LoopbackGadget`](crate::loopback::LoopbackGadget) is an
/// in-memory stand-in for tests and demos. Each submission is an ordered
/// group of buffers queued as a unit, and each call is a yield point of
/// the single-threaded event loop.
pub trait GadgetBackend {
    /// Queue response messages on the bulk IN endpoint.
    fn submit_bulk_in(
        &mut self,
        buffers: Vec<Vec<u8>>,
    ) -> impl Future<Output = Result<(), Error>>;

    /// Queue one notification message on the interrupt IN endpoint.
    fn submit_interrupt_in(
        &mut self,
        buffer: Vec<u8>,
    ) -> impl Future<Output = Result<(), Error>>;

    /// Write the data stage of an IN control transfer on endpoint 0.
    fn ep0_write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), Error>>;

    /// Read the data stage of an OUT control transfer on endpoint 0;
    /// reading zero bytes acknowledges the status stage.
    fn ep0_read(&mut self, length: usize) -> impl Future<Output = Result<Vec<u8>, Error>>;

    /// Halt endpoint 0, direction taken from the SETUP bmRequestType.
    fn ep0_halt(&mut self, request_type: u8) -> impl Future<Output = Result<(), Error>>;

    /// Halt the bulk IN endpoint after an unrecoverable processing error.
    fn halt_bulk_in(&mut self) -> impl Future<Output = Result<(), Error>>;
}
