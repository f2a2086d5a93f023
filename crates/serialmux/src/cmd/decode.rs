use std::fs::File;
use std::io::{self, Cursor, Read};

use serialmux_transport::IoTransport;
use tracing::{debug, warn};

use crate::capture::{receiver, Summary};
use crate::cmd::{parse_hex, DecodeArgs};
use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_packets, print_summary, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let input: Box<dyn Read> = match (&args.hex, &args.input) {
        (Some(hex), None) => Box::new(Cursor::new(parse_hex(hex)?)),
        (None, Some(path)) => Box::new(
            File::open(path).map_err(|err| io_error(&format!("open {}", path.display()), err))?,
        ),
        (None, None) => Box::new(io::stdin().lock()),
        (Some(_), Some(_)) => return Err(CliError::usage("--hex conflicts with --input")),
    };

    // Replies (ACK/NACK) have nowhere to go when decoding offline.
    let transport = IoTransport::new(input, io::sink());
    let (mut dispatcher, log) = receiver(transport, &args.link)?;

    let handled = dispatcher.process_pending();
    debug!(handled, "input decoded");
    if !dispatcher.transport().is_exhausted() {
        warn!("input stopped before end of file");
    }

    print_packets(&log.drain(), format);
    let summary = Summary::collect(&dispatcher);
    print_summary(&summary, format);

    if args.strict && summary.failed() {
        return Err(CliError::new(
            DATA_INVALID,
            format!(
                "{} damaged frame(s) in input",
                summary.crc_errors + summary.loss_of_sync
            ),
        ));
    }
    Ok(SUCCESS)
}
