use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use serialmux_frame::{Checksum, Crc16Modbus, Crc16Xmodem};

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod decode;
pub mod encode;
pub mod monitor;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build one frame and print its wire bytes.
    Encode(EncodeArgs),
    /// Decode wire bytes and print the packets they carry.
    Decode(DecodeArgs),
    /// Read packets from a serial device until interrupted.
    Monitor(MonitorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Encode(args) => encode::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Monitor(args) => monitor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ChecksumKind {
    /// CRC-16/XMODEM (poly 0x1021, init 0).
    #[default]
    Xmodem,
    /// CRC-16/MODBUS (poly 0x8005 reflected, init 0xFFFF).
    Modbus,
}

impl ChecksumKind {
    pub fn build(self) -> Box<dyn Checksum> {
        match self {
            ChecksumKind::Xmodem => Box::new(Crc16Xmodem),
            ChecksumKind::Modbus => Box::new(Crc16Modbus),
        }
    }
}

/// Receive-side link settings shared by `decode` and `monitor`.
#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Frame checksum.
    #[arg(long, value_enum, default_value = "xmodem")]
    pub checksum: ChecksumKind,
    /// Format ids carrying headerless packets (comma-separated).
    #[arg(long, value_delimiter = ',', value_parser = parse_u8)]
    pub raw_format: Vec<u8>,
    /// Receive buffer size in bytes.
    #[arg(long, default_value = "255")]
    pub capacity: usize,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Format id (first payload byte).
    #[arg(long, default_value = "0", value_parser = parse_u8)]
    pub format_id: u8,
    /// Active message destination address.
    #[arg(long, default_value = "0xFFFF", value_parser = parse_u16)]
    pub dest: u16,
    /// Active message group.
    #[arg(long, default_value = "0x22", value_parser = parse_u8)]
    pub group: u8,
    /// Active message type.
    #[arg(long, default_value = "0", value_parser = parse_u8)]
    pub am_type: u8,
    /// Send the payload without an active message header.
    #[arg(long, conflicts_with_all = ["dest", "group", "am_type"])]
    pub raw: bool,
    /// Text payload.
    #[arg(long, conflicts_with = "hex")]
    pub data: Option<String>,
    /// Hex payload (whitespace and ':' separators allowed).
    #[arg(long, conflicts_with = "data")]
    pub hex: Option<String>,
    /// Mark the frame acknowledgment-eligible.
    #[arg(long)]
    pub acked: bool,
    /// Sequence number.
    #[arg(long, default_value = "0", value_parser = parse_u8)]
    pub sequence: u8,
    /// Frame checksum.
    #[arg(long, value_enum, default_value = "xmodem")]
    pub checksum: ChecksumKind,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Wire bytes as hex.
    #[arg(long, conflicts_with = "input")]
    pub hex: Option<String>,
    /// Read wire bytes from a file. Default: stdin.
    #[arg(long, short = 'i', conflicts_with = "hex")]
    pub input: Option<PathBuf>,
    /// Exit non-zero if any frame failed its checksum or lost sync.
    #[arg(long)]
    pub strict: bool,
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Serial device (or FIFO) to read from. ACKs are written back to it.
    pub path: PathBuf,
    /// Exit after receiving N packets.
    #[arg(long)]
    pub count: Option<usize>,
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_int(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid number {text:?}: {err}"))
}

pub fn parse_u8(text: &str) -> Result<u8, String> {
    let value = parse_int(text)?;
    u8::try_from(value).map_err(|_| format!("{text} does not fit in one byte"))
}

pub fn parse_u16(text: &str) -> Result<u16, String> {
    let value = parse_int(text)?;
    u16::try_from(value).map_err(|_| format!("{text} does not fit in two bytes"))
}

/// Decode a hex string, ignoring whitespace and ':' separators.
pub fn parse_hex(text: &str) -> CliResult<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&digits).map_err(|err| CliError::usage(format!("invalid hex input: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_hex_prefix() {
        assert_eq!(parse_u16("0xBEEF"), Ok(0xBEEF));
        assert_eq!(parse_u8("125"), Ok(125));
        assert!(parse_u8("0x100").is_err());
        assert!(parse_u8("abc").is_err());
    }

    #[test]
    fn hex_input_ignores_separators() {
        assert_eq!(parse_hex("7E 40:09\n00").unwrap(), vec![0x7E, 0x40, 0x09, 0x00]);
        assert!(parse_hex("7E4").is_err());
    }
}
