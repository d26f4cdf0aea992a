use usbf_iccd::loopback::LoopbackGadget;
use usbf_iccd::message::{Request, Response};
use usbf_iccd::{Card, CompletionStatus, Error, IccdFunction};

/// Toy card: fixed ATR, echoes every APDU back with a success trailer.
struct EchoCard;

impl Card for EchoCard {
    fn atr(&self) -> Result<Vec<u8>, Error> {
        Ok(vec![0x3B, 0x80, 0x01, 0x01])
    }

    fn run_apdu(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
        let mut response = command.to_vec();
        response.extend_from_slice(&[0x90, 0x00]);
        Ok(response)
    }

    fn clear_volatile(&mut self) {}
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let mut function = IccdFunction::new(LoopbackGadget::new(), 1)?;
    function.on_bind().await?;
    function.on_enable().await?;

    println!("Descriptor: {hex}", hex = hex(&function.descriptor().encode()));

    println!("\nInserting card into slot 0...");
    function.insert(0, Box::new(EchoCard)).await?;
    for buffer in function.backend_mut().take_interrupt_in() {
        println!("  interrupt-IN: {hex}", hex = hex(&buffer));
    }

    println!("\nPowering the card on...");
    let request = Request::power_on(0, 1).to_bytes(&[]);
    function
        .on_bulk_out_complete(&request, CompletionStatus::Complete)
        .await?;
    for buffer in function.backend_mut().take_bulk_in() {
        let response = Response::decode(&buffer)?;
        println!("  bulk-IN: {hex}", hex = hex(&buffer));
        println!("  ATR: {atr:02x?}", atr = response.body);
    }

    println!("\nRunning a SELECT APDU...");
    let apdu = [0x00, 0xA4, 0x04, 0x00, 0x00];
    let request = Request::xfr_block(0, 2, apdu.len() as u32, 0).to_bytes(&apdu);
    function
        .on_bulk_out_complete(&request, CompletionStatus::Complete)
        .await?;
    for buffer in function.backend_mut().take_bulk_in() {
        let response = Response::decode(&buffer)?;
        println!("  bulk-IN: {hex}", hex = hex(&buffer));
        println!(
            "  response APDU ({len} bytes): {apdu:02x?}",
            len = response.body.len(),
            apdu = response.body
        );
    }

    println!("\nRemoving the card...");
    function.remove(0).await?;
    for buffer in function.backend_mut().take_interrupt_in() {
        println!("  interrupt-IN: {hex}", hex = hex(&buffer));
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
