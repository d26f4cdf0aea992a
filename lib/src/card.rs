use crate::Error;

/// The contract a pluggable card implementation provides to a slot.
///
/// Calls are synchronous and strictly sequential per slot: the reader never
/// enters the same card from two contexts at once. `run_apdu` may take a
/// while but must not suspend; a card doing real I/O has to arrange its own
/// offload and still return promptly.
pub trait Card {
    /// Answer-To-Reset bytes produced on power-on.
    fn atr(&self) -> Result<Vec<u8>, Error>;

    /// Execute one command APDU and return the response APDU.
    fn run_apdu(&mut self, command: &[u8]) -> Result<Vec<u8>, Error>;

    /// Drop per-session state. Called on power-off and on removal.
    fn clear_volatile(&mut self);
}
