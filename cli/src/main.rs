mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::*;
use usbf_iccd::loopback::LoopbackGadget;
use usbf_iccd::message::{Notification, Request, Response, ResponseKind};
use usbf_iccd::usb::CommandStatus;
use usbf_iccd::{Card, CompletionStatus, Error, IccdFunction};

/// CLI for usbf-iccd - exercise the ICCD function against an in-memory
/// gadget backend
#[derive(Parser)]
#[command(author, version = option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"), about, long_about = None, propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "json", global = true)]
    format: OutputFormat,

    /// Number of card slots the reader exposes
    #[arg(long, default_value_t = 1, global = true)]
    slots: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the class-specific ICCD descriptor
    Descriptor,

    /// Feed hex-encoded bulk-OUT messages to the reader and print every
    /// message it produces
    Exchange {
        /// Insert an echo card into slot 0 first
        #[arg(long)]
        card: bool,

        /// Bulk-OUT messages, hex-encoded, processed in order
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Run a scripted insert / power-on / APDU / remove session
    Demo,
}

/// Test card used by the demo and `--card`: fixed ATR, echoes every APDU
/// back with a 90 00 trailer.
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
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let mut function = IccdFunction::new(LoopbackGadget::new(), cli.slots)
        .context("Failed to create ICCD function")?;
    function.on_bind().await?;
    function.on_enable().await?;

    match cli.command {
        Commands::Descriptor => handle_descriptor(&function, cli.format),
        Commands::Exchange { card, messages } => {
            handle_exchange(&mut function, card, messages, cli.format).await
        }
        Commands::Demo => handle_demo(&mut function, cli.format).await,
    }
}

fn handle_descriptor(function: &IccdFunction<LoopbackGadget>, format: OutputFormat) -> Result<()> {
    let descriptor = function.descriptor();
    let response = DescriptorOutput {
        hex: hex_encode(&descriptor.encode()),
        slots: function.slot_count(),
        max_slot_index: descriptor.max_slot_index,
        protocols: "T=1".to_string(),
        default_clock_khz: descriptor.default_clock_khz,
        data_rate_bps: descriptor.data_rate_bps,
        max_message_length: descriptor.max_message_length,
        interrupt_packet_size: function.interrupt_max_packet_size(),
    };
    output_response(response, format)
}

async fn handle_exchange(
    function: &mut IccdFunction<LoopbackGadget>,
    card: bool,
    messages: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    if card {
        function
            .insert(0, Box::new(EchoCard))
            .await
            .context("Failed to insert card")?;
    }
    // Drop the notifications triggered by setup so the output starts with
    // the first request.
    function.backend_mut().take_interrupt_in();

    let mut wire = Vec::new();
    for message in messages {
        let bytes = hex_decode(&message)
            .with_context(|| format!("Invalid hex message: {message}"))?;
        wire.push(WireMessage {
            endpoint: "bulk-OUT".to_string(),
            hex: hex_encode(&bytes),
            summary: describe_request(&bytes),
        });
        function
            .on_bulk_out_complete(&bytes, CompletionStatus::Complete)
            .await
            .context("Request processing failed")?;
        wire.extend(drain(function));
    }
    output_response(ExchangeOutput { messages: wire }, format)
}

async fn handle_demo(
    function: &mut IccdFunction<LoopbackGadget>,
    format: OutputFormat,
) -> Result<()> {
    let mut steps = Vec::new();

    function
        .insert(0, Box::new(EchoCard))
        .await
        .context("Failed to insert card")?;
    steps.push(DemoStep {
        action: "insert card into slot 0".to_string(),
        messages: drain(function),
    });

    let requests: [(&str, Vec<u8>); 3] = [
        ("get slot status", Request::get_slot_status(0, 1).to_bytes(&[])),
        ("power the card on", Request::power_on(0, 2).to_bytes(&[])),
        ("run a SELECT APDU", {
            let apdu = [0x00, 0xA4, 0x04, 0x00, 0x00];
            Request::xfr_block(0, 3, apdu.len() as u32, 0).to_bytes(&apdu)
        }),
    ];
    for (action, bytes) in requests {
        let mut messages = vec![WireMessage {
            endpoint: "bulk-OUT".to_string(),
            hex: hex_encode(&bytes),
            summary: describe_request(&bytes),
        }];
        function
            .on_bulk_out_complete(&bytes, CompletionStatus::Complete)
            .await
            .context("Request processing failed")?;
        messages.extend(drain(function));
        steps.push(DemoStep {
            action: action.to_string(),
            messages,
        });
    }

    function.remove(0).await.context("Failed to remove card")?;
    steps.push(DemoStep {
        action: "remove the card".to_string(),
        messages: drain(function),
    });

    output_response(DemoOutput { steps }, format)
}

/// Collect everything the function queued on its IN endpoints.
fn drain(function: &mut IccdFunction<LoopbackGadget>) -> Vec<WireMessage> {
    let backend = function.backend_mut();
    let mut messages = Vec::new();
    for buffer in backend.take_bulk_in() {
        messages.push(WireMessage {
            endpoint: "bulk-IN".to_string(),
            summary: describe_response(&buffer),
            hex: hex_encode(&buffer),
        });
    }
    for buffer in backend.take_interrupt_in() {
        messages.push(WireMessage {
            endpoint: "interrupt-IN".to_string(),
            summary: describe_notification(&buffer),
            hex: hex_encode(&buffer),
        });
    }
    messages
}

fn describe_request(bytes: &[u8]) -> String {
    match Request::decode(bytes) {
        Ok((request, body)) => format!(
            "{kind:?} slot={slot} seq={seq} body={len} byte(s)",
            kind = request.kind,
            slot = request.slot,
            seq = request.seq,
            len = body.len()
        ),
        Err(e) => format!("undecodable request: {e}"),
    }
}

fn describe_response(bytes: &[u8]) -> String {
    match Response::decode(bytes) {
        Ok(response) => {
            let kind = match response.kind {
                ResponseKind::DataBlock { chain_parameter } => {
                    format!("DataBlock chain={chain_parameter:?}")
                }
                ResponseKind::SlotStatus { clock_status } => {
                    format!("SlotStatus clock={clock_status}")
                }
                ResponseKind::Parameters { protocol } => {
                    format!("Parameters protocol={protocol}")
                }
                ResponseKind::Escape => "Escape".to_string(),
                ResponseKind::RateAndClock { .. } => "RateAndClock".to_string(),
            };
            let error = match response.command_status {
                CommandStatus::Ok => String::new(),
                _ => format!(" error={error:#04x}", error = response.error),
            };
            format!(
                "{kind} slot={slot} seq={seq} icc={icc:?} status={status:?}{error} body={len} byte(s)",
                slot = response.slot,
                seq = response.seq,
                icc = response.icc_status,
                status = response.command_status,
                len = response.body.len()
            )
        }
        Err(e) => format!("undecodable response: {e}"),
    }
}

fn describe_notification(bytes: &[u8]) -> String {
    match Notification::decode(bytes) {
        Ok(Notification::SlotChange(states)) => {
            let slots: Vec<String> = states
                .iter()
                .enumerate()
                .filter(|(_, s)| s.present || s.changed)
                .map(|(i, s)| {
                    format!("slot {i}: present={p} changed={c}", p = s.present, c = s.changed)
                })
                .collect();
            format!("NotifySlotChange [{slots}]", slots = slots.join(", "))
        }
        Ok(Notification::HardwareError { slot, seq, code }) => {
            format!("NotifyHardwareError slot={slot} seq={seq} code={code:#04x}")
        }
        Err(e) => format!("undecodable notification: {e}"),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(text: &str) -> Result<Vec<u8>> {
    let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    anyhow::ensure!(text.is_ascii(), "non-ASCII character in hex string");
    anyhow::ensure!(text.len() % 2 == 0, "odd number of hex digits");
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let bytes = hex_decode("62 00 00 00 00 00 08 00 00 00").unwrap();
        assert_eq!(bytes, [0x62, 0, 0, 0, 0, 0, 8, 0, 0, 0]);
        assert_eq!(hex_encode(&bytes), "62000000000008000000");
    }

    #[test]
    fn test_hex_decode_rejects_garbage() {
        assert!(hex_decode("123").is_err());
        assert!(hex_decode("zz").is_err());
    }
}
