use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::capture::{ReceivedPacket, Summary};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A frame built by `encode`.
pub struct EncodedFrame<'a> {
    pub format_id: u8,
    pub protocol: &'static str,
    pub sequence: u8,
    pub checksum: &'static str,
    pub payload_len: usize,
    pub wire: &'a [u8],
}

#[derive(Serialize)]
struct EncodedOutput<'a> {
    format_id: u8,
    protocol: &'a str,
    sequence: u8,
    checksum: &'a str,
    payload_len: usize,
    wire_len: usize,
    wire: String,
}

#[derive(Serialize)]
struct PacketOutput<'a> {
    format_id: u8,
    format_name: &'a str,
    length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    am_type: Option<u8>,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

impl<'a> From<&'a ReceivedPacket> for PacketOutput<'a> {
    fn from(packet: &'a ReceivedPacket) -> Self {
        Self {
            format_id: packet.format,
            format_name: packet.format_name,
            length: packet.len,
            dest: packet.header.map(|h| h.dest),
            group: packet.header.map(|h| h.group),
            am_type: packet.header.map(|h| h.am_type),
            payload: hex::encode(&packet.payload),
            text: printable(&packet.payload),
        }
    }
}

pub fn print_encoded(frame: &EncodedFrame<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EncodedOutput {
                format_id: frame.format_id,
                protocol: frame.protocol,
                sequence: frame.sequence,
                checksum: frame.checksum,
                payload_len: frame.payload_len,
                wire_len: frame.wire.len(),
                wire: hex::encode(frame.wire),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FORMAT", "PROTO", "SEQ", "SIZE", "WIRE"])
                .add_row(vec![
                    format!("{:#04x}", frame.format_id),
                    frame.protocol.to_string(),
                    frame.sequence.to_string(),
                    frame.payload_len.to_string(),
                    spaced_hex(frame.wire),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{}", spaced_hex(frame.wire)),
        OutputFormat::Raw => print_raw(frame.wire),
    }
}

pub fn print_packets(packets: &[ReceivedPacket], format: OutputFormat) {
    if packets.is_empty() {
        return;
    }
    match format {
        OutputFormat::Json => {
            for packet in packets {
                print_json(&PacketOutput::from(packet));
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FORMAT", "DEST", "GROUP", "TYPE", "SIZE", "PAYLOAD"]);
            for packet in packets {
                let header = packet.header;
                table.add_row(vec![
                    format!("{:#04x} ({})", packet.format, packet.format_name),
                    header.map_or("-".to_string(), |h| format!("{:#06x}", h.dest)),
                    header.map_or("-".to_string(), |h| format!("{:#04x}", h.group)),
                    header.map_or("-".to_string(), |h| h.am_type.to_string()),
                    packet.len.to_string(),
                    payload_preview(&packet.payload),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for packet in packets {
                match packet.header {
                    Some(h) => println!(
                        "format={:#04x} dest={:#06x} group={:#04x} type={} size={} payload={}",
                        packet.format,
                        h.dest,
                        h.group,
                        h.am_type,
                        packet.len,
                        payload_preview(&packet.payload)
                    ),
                    None => println!(
                        "format={:#04x} size={} payload={}",
                        packet.format,
                        packet.len,
                        payload_preview(&packet.payload)
                    ),
                }
            }
        }
        OutputFormat::Raw => {
            for packet in packets {
                print_raw(&packet.payload);
            }
        }
    }
}

pub fn print_summary(summary: &Summary, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct SummaryOutput<'a> {
                summary: &'a Summary,
            }
            print_json(&SummaryOutput { summary });
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["COUNTER", "VALUE"]);
            for (name, value) in [
                ("packets", summary.packets),
                ("frames", summary.frames),
                ("crc errors", summary.crc_errors),
                ("loss of sync", summary.loss_of_sync),
                ("unknown format", summary.unknown_format),
                ("overflows", summary.overflows),
                ("length errors", summary.length_errors),
                ("duplicates", summary.duplicates),
                ("acks sent", summary.acks_sent),
                ("nacks sent", summary.nacks_sent),
            ] {
                table.add_row(vec![name.to_string(), value.to_string()]);
            }
            eprintln!("{table}");
        }
        OutputFormat::Pretty => eprintln!(
            "packets={} frames={} crc_errors={} loss_of_sync={} unknown_format={}",
            summary.packets,
            summary.frames,
            summary.crc_errors,
            summary.loss_of_sync,
            summary.unknown_format
        ),
        OutputFormat::Raw => {}
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn printable(payload: &[u8]) -> Option<&str> {
    std::str::from_utf8(payload)
        .ok()
        .filter(|text| !text.is_empty() && !text.chars().any(char::is_control))
}

fn payload_preview(payload: &[u8]) -> String {
    match printable(payload) {
        Some(text) => text.to_string(),
        None => spaced_hex(payload),
    }
}
