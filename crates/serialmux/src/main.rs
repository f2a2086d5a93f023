mod capture;
mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "serialmux",
    version,
    about = "Encode, decode and monitor framed serial packets"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encode_subcommand() {
        let cli = Cli::try_parse_from([
            "serialmux",
            "encode",
            "--dest",
            "0xBEEF",
            "--am-type",
            "6",
            "--hex",
            "0102",
            "--acked",
        ])
        .expect("encode args should parse");

        let Command::Encode(args) = cli.command else {
            panic!("expected encode");
        };
        assert_eq!(args.dest, 0xBEEF);
        assert_eq!(args.am_type, 6);
        assert!(args.acked);
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "serialmux",
            "encode",
            "--hex",
            "0102",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn raw_encode_rejects_header_fields() {
        let err = Cli::try_parse_from(["serialmux", "encode", "--raw", "--dest", "1"])
            .expect_err("raw frames carry no header");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_decode_with_raw_formats() {
        let cli = Cli::try_parse_from([
            "serialmux",
            "decode",
            "--hex",
            "7e",
            "--raw-format",
            "7,0x10",
            "--strict",
        ])
        .expect("decode args should parse");

        let Command::Decode(args) = cli.command else {
            panic!("expected decode");
        };
        assert_eq!(args.link.raw_format, vec![7, 0x10]);
        assert!(args.strict);
    }
}
