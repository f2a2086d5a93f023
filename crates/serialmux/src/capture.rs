use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serialmux_dispatch::{
    ActiveMessageFormat, AmHeader, Delivery, DispatchError, Dispatcher, DispatcherConfig,
    PacketBuffer, PacketHandler, RawFormat, DEFAULT_HEADER_RESERVE, FORMAT_ACTIVE_MESSAGE,
};
use serialmux_frame::{Checksum, ProtocolConfig, ProtocolEngine};
use serialmux_transport::ByteTransport;
use serde::Serialize;
use tracing::warn;

use crate::cmd::LinkArgs;
use crate::exit::{dispatch_error, CliResult};

/// A packet copied out of the dispatcher's receive buffer.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub format: u8,
    pub format_name: &'static str,
    pub len: usize,
    pub header: Option<AmHeader>,
    pub payload: Vec<u8>,
}

/// Packets received and not yet printed.
#[derive(Clone, Default)]
pub struct PacketLog(Rc<RefCell<VecDeque<ReceivedPacket>>>);

impl PacketLog {
    pub fn drain(&self) -> Vec<ReceivedPacket> {
        self.0.borrow_mut().drain(..).collect()
    }
}

struct Capture {
    name: &'static str,
    log: PacketLog,
}

impl PacketHandler for Capture {
    fn received(&mut self, delivery: &mut Delivery<'_>) {
        let header = if delivery.format() == FORMAT_ACTIVE_MESSAGE {
            AmHeader::read_from(delivery.bytes())
        } else {
            None
        };
        self.log.0.borrow_mut().push_back(ReceivedPacket {
            format: delivery.format(),
            format_name: self.name,
            len: delivery.len(),
            header,
            payload: delivery.payload().to_vec(),
        });
    }

    fn send_done(&mut self, format: u8, _buffer: PacketBuffer, result: serialmux_dispatch::Result<()>) {
        if let Err(err) = result {
            warn!(format, error = %err, "send failed");
        }
    }
}

pub type Receiver<T> = Dispatcher<T, Box<dyn Checksum>>;

/// Receive stack with active messages on format 0 and raw packets on the
/// ids listed in `link`.
pub fn receiver<T: ByteTransport>(transport: T, link: &LinkArgs) -> CliResult<(Receiver<T>, PacketLog)> {
    let engine = ProtocolEngine::with_checksum(transport, ProtocolConfig::device(), link.checksum.build());
    let config = DispatcherConfig {
        header_reserve: DEFAULT_HEADER_RESERVE,
        data_capacity: link.capacity,
    };
    let mut dispatcher = Dispatcher::with_engine(engine, config);
    let log = PacketLog::default();

    let register = |dispatcher: &mut Receiver<T>, format: u8, raw: bool| -> Result<(), DispatchError> {
        if raw {
            dispatcher.register(format, RawFormat, Capture { name: "raw", log: log.clone() })
        } else {
            dispatcher.register(
                format,
                ActiveMessageFormat,
                Capture {
                    name: "active-message",
                    log: log.clone(),
                },
            )
        }
    };
    register(&mut dispatcher, FORMAT_ACTIVE_MESSAGE, false)
        .map_err(|err| dispatch_error("register active messages", err))?;
    for &format in &link.raw_format {
        register(&mut dispatcher, format, true)
            .map_err(|err| dispatch_error(&format!("register raw format {format}"), err))?;
    }

    Ok((dispatcher, log))
}

/// Counters printed after a capture.
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub packets: u64,
    pub frames: u64,
    pub crc_errors: u64,
    pub loss_of_sync: u64,
    pub unknown_format: u64,
    pub overflows: u64,
    pub length_errors: u64,
    pub duplicates: u64,
    pub acks_sent: u64,
    pub nacks_sent: u64,
}

impl Summary {
    pub fn collect<T: ByteTransport>(dispatcher: &Receiver<T>) -> Self {
        let dispatch = dispatcher.stats();
        let engine = dispatcher.engine_stats();
        Self {
            packets: dispatch.delivered,
            frames: engine.frames_received,
            crc_errors: engine.crc_errors,
            loss_of_sync: engine.loss_of_sync,
            unknown_format: dispatch.unknown_format,
            overflows: dispatch.overflows,
            length_errors: dispatch.length_errors,
            duplicates: engine.duplicates,
            acks_sent: engine.acks_sent,
            nacks_sent: engine.nacks_sent,
        }
    }

    /// True when some frame was damaged on the wire.
    pub fn failed(&self) -> bool {
        self.crc_errors > 0 || self.loss_of_sync > 0
    }
}
