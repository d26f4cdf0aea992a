use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Plain,
}

/// Descriptor command response
#[derive(Debug, Serialize)]
pub struct DescriptorOutput {
    pub hex: String,
    pub slots: usize,
    pub max_slot_index: u8,
    pub protocols: String,
    pub default_clock_khz: u32,
    pub data_rate_bps: u32,
    pub max_message_length: u32,
    pub interrupt_packet_size: u16,
}

/// One message seen on the wire during an exchange
#[derive(Debug, Serialize)]
pub struct WireMessage {
    pub endpoint: String,
    pub hex: String,
    pub summary: String,
}

/// Exchange command response
#[derive(Debug, Serialize)]
pub struct ExchangeOutput {
    pub messages: Vec<WireMessage>,
}

/// One step of the scripted demo
#[derive(Debug, Serialize)]
pub struct DemoStep {
    pub action: String,
    pub messages: Vec<WireMessage>,
}

/// Demo command response
#[derive(Debug, Serialize)]
pub struct DemoOutput {
    pub steps: Vec<DemoStep>,
}

/// Helper function to output a response based on format
pub fn output_response<T: Serialize>(response: T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{json}", json = serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Plain => {
            print_plain(&serde_json::to_value(&response)?, 0);
        }
    }
    Ok(())
}

fn print_plain(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                match value {
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        println!("{pad}{key}:");
                        print_plain(value, indent + 1);
                    }
                    _ => println!("{pad}{key}: {value}"),
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                print_plain(item, indent);
            }
        }
        other => println!("{pad}{other}"),
    }
}
