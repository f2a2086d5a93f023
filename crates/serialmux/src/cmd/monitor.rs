use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serialmux_transport::{ByteTransport, IoTransport};
use tracing::info;

use crate::capture::{receiver, Summary};
use crate::cmd::MonitorArgs;
use crate::exit::{io_error, CliError, CliResult, SUCCESS};
use crate::output::{print_packets, print_summary, OutputFormat};

const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    let context = format!("open {}", args.path.display());
    let device = open_device(&args.path).map_err(|err| io_error(&context, err))?;
    let reader = device
        .try_clone()
        .map_err(|err| io_error(&context, err))?;

    let transport = IoTransport::new(reader, device);
    let (mut dispatcher, log) = receiver(transport, &args.link)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    info!(path = %args.path.display(), "monitoring");

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        match dispatcher.transport_mut().poll_event() {
            Some(event) => dispatcher.handle_event(event),
            None if dispatcher.transport().is_exhausted() => {
                info!("device closed");
                break;
            }
            None => thread::sleep(IDLE_SLEEP),
        }
        if dispatcher
            .next_deadline()
            .is_some_and(|deadline| deadline <= Instant::now())
        {
            dispatcher.poll_timeout(Instant::now());
        }

        let mut packets = log.drain();
        if let Some(limit) = args.count {
            packets.truncate(limit.saturating_sub(printed));
        }
        printed += packets.len();
        print_packets(&packets, format);

        if args.count.is_some_and(|limit| printed >= limit) {
            break;
        }
    }

    print_summary(&Summary::collect(&dispatcher), format);
    Ok(SUCCESS)
}

/// Open the device read/write without blocking, so an idle line does not
/// hold the loop inside `read` and Ctrl-C is noticed within `IDLE_SLEEP`.
fn open_device(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY);
    }
    options.open(path)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
