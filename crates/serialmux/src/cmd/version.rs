use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("serialmux {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: serialmux");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("SERIALMUX_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: dispatch={}, async={}, cli=true",
        cfg!(feature = "dispatch"),
        cfg!(feature = "async")
    );
    println!(
        "defaults: checksum=CRC-16/XMODEM, ack_timeout={}ms, max_retries={}, lookahead={}",
        serialmux_frame::DEFAULT_ACK_TIMEOUT.as_millis(),
        serialmux_frame::DEFAULT_MAX_RETRIES,
        serialmux_frame::DEFAULT_LOOKAHEAD
    );

    Ok(SUCCESS)
}
