//! Binary entry point for RACA-RS.
//!
//! RACA-RS: Retrieval-Augmented Compliance Auditor.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use clap::Parser;
use raca_rs::cli::output::{OutputFormat, format_error};
use raca_rs::cli::{Cli, execute};
use raca_rs::config::AppConfig;
use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = OutputFormat::parse(&cli.format);

    // Logging failures (e.g. a second subscriber in tests) are not fatal.
    if let Ok(config) = AppConfig::from_env() {
        let _ = raca_rs::logging::init(&config);
    }

    match execute(&cli) {
        Ok(output) => {
            if !output.is_empty() {
                // Handle broken pipe gracefully (e.g., when piped to `head` or `jq`)
                if let Err(e) = write!(io::stdout(), "{output}")
                    && e.kind() != io::ErrorKind::BrokenPipe
                {
                    eprintln!("Error writing to stdout: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            let error_output = format_error(&e, format);
            match format {
                OutputFormat::Json => {
                    // JSON errors go to stdout for programmatic parsing
                    println!("{error_output}");
                }
                OutputFormat::Text => {
                    eprintln!("Error: {error_output}");
                }
            }
            ExitCode::FAILURE
        }
    }
}
