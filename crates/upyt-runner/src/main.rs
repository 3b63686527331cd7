//! `upyt`: talk to boards running the upyt listener.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use upyt_host::{Connection, LinkConfig};
use upyt_runner::commands::{
    break_loop, call_instruction, comport, device_info, list_devices, parse_call_args,
    reset_device, resolve_connection,
};
use upyt_runner::sim::SimulatedBoard;
use upyt_runner::RunnerResult;

#[derive(Parser, Debug)]
#[command(name = "upyt", version, about = "Remote procedure calls over a serial link")]
struct Cli {
    /// Log at debug level (trace with -vv). RUST_LOG overrides this.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Project configuration file, instead of searching for .upytester.yml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Talk to an in-process simulated board instead of real hardware.
    #[arg(long, global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the serial numbers of attached USB serial devices.
    List,
    /// Show the instructions and remote classes a device offers.
    Info {
        /// Configured device name or USB serial number.
        device: String,
    },
    /// Call an instruction and print its response.
    Call {
        /// Configured device name or USB serial number.
        device: String,
        /// Instruction name.
        instruction: String,
        /// Arguments: JSON values, plain strings, or key=value.
        args: Vec<String>,
    },
    /// Make the device leave its listener loop.
    Break {
        /// Configured device name or USB serial number.
        device: String,
    },
    /// Restart the device.
    Reset {
        /// Configured device name or USB serial number.
        device: String,
        /// Reset through the REPL with pyb.hard_reset() instead of machine_reset.
        #[arg(long)]
        hard: bool,
    },
    /// Print the serial port a device is attached to.
    Comport {
        /// Configured device name or USB serial number.
        device: String,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> RunnerResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Open a connection, run `f` on it and close it again.
fn with_device<T>(
    cli: &Cli,
    device: &str,
    f: impl FnOnce(&Connection) -> RunnerResult<T>,
) -> RunnerResult<T> {
    if cli.simulated {
        let board = SimulatedBoard::spawn(device)?;
        let connection = board.connect(LinkConfig::default());
        connection.open()?;
        return f(&connection);
    }
    let connection = resolve_connection(device, cli.config.as_deref())?;
    connection.open()?;
    let result = f(&connection);
    connection.close();
    result
}

fn run(cli: &Cli) -> RunnerResult<()> {
    match &cli.command {
        Command::List => {
            for serial in list_devices()? {
                println!("{}", serial);
            }
            Ok(())
        }
        Command::Info { device } => {
            let info = with_device(cli, device, device_info)?;
            print_json(&info)
        }
        Command::Call {
            device,
            instruction,
            args,
        } => {
            let args = parse_call_args(args.as_slice());
            match with_device(cli, device, |c| call_instruction(c, instruction, args))? {
                Some(value) => print_json(&value),
                None => Ok(()),
            }
        }
        Command::Break { device } => with_device(cli, device, break_loop),
        Command::Reset { device, hard } => with_device(cli, device, |c| reset_device(c, *hard)),
        Command::Comport { device } => {
            if cli.simulated {
                println!("{}", device);
                return Ok(());
            }
            println!("{}", comport(device, cli.config.as_deref())?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    upyt_metrics::describe_metrics();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("upyt: {}", e);
            ExitCode::FAILURE
        }
    }
}
