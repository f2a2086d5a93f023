use serialmux_dispatch::{
    ActiveMessageFormat, AmHeader, Delivery, Dispatcher, DispatcherConfig, PacketBuffer,
    PacketHandler, RawFormat, DEFAULT_HEADER_RESERVE,
};
use serialmux_frame::{Checksum, OutboundMode, ProtocolByte, ProtocolConfig, ProtocolEngine};
use serialmux_transport::MemoryTransport;
use tracing::{debug, warn};

use crate::cmd::{parse_hex, EncodeArgs};
use crate::exit::{dispatch_error, CliError, CliResult, SUCCESS};
use crate::output::{print_encoded, EncodedFrame, OutputFormat};

struct Discard;

impl PacketHandler for Discard {
    fn received(&mut self, _delivery: &mut Delivery<'_>) {}

    fn send_done(&mut self, format: u8, _buffer: PacketBuffer, result: serialmux_dispatch::Result<()>) {
        if let Err(err) = result {
            warn!(format, error = %err, "encode send failed");
        }
    }
}

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = match (&args.data, &args.hex) {
        (Some(text), None) => text.as_bytes().to_vec(),
        (None, Some(hex)) => parse_hex(hex)?,
        (None, None) => Vec::new(),
        (Some(_), Some(_)) => return Err(CliError::usage("--data conflicts with --hex")),
    };

    let outbound = if args.acked {
        OutboundMode::Acknowledged
    } else {
        OutboundMode::BestEffort
    };
    let protocol = ProtocolConfig {
        initial_sequence: args.sequence,
        outbound,
        ..ProtocolConfig::default()
    };
    let (transport, link) = MemoryTransport::new();
    let engine = ProtocolEngine::with_checksum(transport, protocol, args.checksum.build());
    let mut dispatcher = Dispatcher::with_engine(
        engine,
        DispatcherConfig {
            header_reserve: DEFAULT_HEADER_RESERVE,
            data_capacity: payload.len(),
        },
    );

    let mut buffer = dispatcher.new_buffer();
    let len = if args.raw {
        dispatcher
            .register(args.format_id, RawFormat, Discard)
            .map_err(|err| dispatch_error("register format", err))?;
        buffer
            .set_payload(&payload)
            .map_err(|err| dispatch_error("fill buffer", err))?;
        payload.len()
    } else {
        dispatcher
            .register(args.format_id, ActiveMessageFormat, Discard)
            .map_err(|err| dispatch_error("register format", err))?;
        let header = AmHeader::new(args.dest, args.group, args.am_type);
        ActiveMessageFormat::prepare(&mut buffer, header, &payload)
            .map_err(|err| dispatch_error("build active message", err))?
    };

    dispatcher
        .send(args.format_id, buffer, len)
        .map_err(|rejected| dispatch_error("encode", rejected.error))?;
    let handled = dispatcher.process_pending();
    let wire = link.take_sent();
    debug!(handled, wire_len = wire.len(), "frame encoded");

    let protocol = if args.acked {
        ProtocolByte::DataAcked
    } else {
        ProtocolByte::Data
    };
    print_encoded(
        &EncodedFrame {
            format_id: args.format_id,
            protocol: protocol.name(),
            sequence: args.sequence,
            checksum: dispatcher.engine().checksum().name(),
            payload_len: payload.len(),
            wire: &wire,
        },
        format,
    );

    Ok(SUCCESS)
}
