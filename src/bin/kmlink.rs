// src/bin/kmlink.rs
//
// Thin CLI dispatcher over `kmlink::Engine` (§4.I). Opens the link,
// runs one command, closes the link, and maps every error to a short
// message on stderr with exit code 1.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kmlink::codec::EncodeInput;
use kmlink::{
    Engine, ParameterCache, Result as KmResult,
};

#[derive(Parser)]
#[command(name = "kmlink", about = "Buderus WPS heat pump CAN/SLCAN link")]
struct Cli {
    /// Serial device path (e.g. /dev/ttyUSB0). Defaults to KMLINK_DEVICE.
    #[arg(long, global = true)]
    device: Option<String>,

    /// Parameter cache file path. Defaults to KMLINK_CACHE.
    #[arg(long, global = true)]
    cache: Option<String>,

    /// Open the link read-only; any write is rejected.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a single parameter by name or index.
    Read {
        name: String,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        broadcast: bool,
        #[arg(long, default_value_t = 5)]
        duration: u64,
        #[arg(long)]
        no_fallback: bool,
    },
    /// Write a value to a parameter by name or index.
    Write { name: String, value: String },
    /// List known parameters, optionally filtered by substring.
    List {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Dump the full parameter table.
    Dump {
        #[arg(long)]
        json: bool,
    },
    /// Passively monitor broadcast traffic.
    Monitor {
        #[arg(long, default_value_t = 10)]
        duration: u64,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        temps_only: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kmlink: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> KmResult<()> {
    let device = cli
        .device
        .or_else(|| std::env::var("KMLINK_DEVICE").ok())
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let cache_path = cli
        .cache
        .or_else(|| std::env::var("KMLINK_CACHE").ok())
        .unwrap_or_else(|| "kmlink-params.json".to_string());

    let transport = kmlink::open_serial(&device, kmlink::DEFAULT_BAUD_RATE)?;
    let cache = ParameterCache::new(cache_path);
    let mut engine = Engine::open(transport, device.clone(), cli.dry_run, &cache, Default::default())?;

    let result = dispatch(&mut engine, cli.command);
    let _ = engine.close();
    result
}

fn dispatch<T: kmlink::SerialTransport>(engine: &mut Engine<T>, command: Command) -> KmResult<()> {
    match command {
        Command::Read {
            name,
            json,
            broadcast,
            duration,
            no_fallback,
        } => {
            let outcome = if broadcast {
                engine.read_broadcast_only(&name, Duration::from_secs(duration))?
            } else {
                engine.read(&name, Duration::from_secs(duration), no_fallback)?
            };
            print_read_outcome(&outcome, json);
            Ok(())
        }
        Command::Write { name, value } => {
            let input = EncodeInput::Text(&value);
            engine.write(&name, input)?;
            println!("{name} written");
            Ok(())
        }
        Command::List { filter } => {
            for p in engine.table().all() {
                if let Some(ref needle) = filter {
                    if !p.name.to_uppercase().contains(&needle.to_uppercase()) {
                        continue;
                    }
                }
                println!(
                    "{:>5}  {:<32}  {}  [{}, {}]",
                    p.index,
                    p.name,
                    p.format,
                    p.min,
                    p.max
                );
            }
            Ok(())
        }
        Command::Dump { json } => {
            let params = engine.table().all();
            if json {
                let values: Vec<&kmlink::Parameter> = params;
                println!("{}", serde_json::to_string_pretty(&values).unwrap());
            } else {
                for p in params {
                    println!("{} = {} (idx={}, format={})", p.name, if p.is_writable() { "rw" } else { "ro" }, p.index, p.format);
                }
            }
            Ok(())
        }
        Command::Monitor {
            duration,
            json,
            temps_only,
        } => {
            let cache = engine.monitor(Duration::from_secs(duration))?;
            for reading in cache.all() {
                if temps_only && !reading.is_temperature() {
                    continue;
                }
                if json {
                    println!(
                        "{{\"can_id\":\"0x{:08X}\",\"base\":{},\"idx\":{},\"raw\":\"0x{}\"}}",
                        reading.can_id,
                        reading.base,
                        reading.idx,
                        hex::encode_upper(&reading.raw_bytes)
                    );
                } else {
                    println!(
                        "0x{:08X}  base={:04X} idx={}  raw=0x{}",
                        reading.can_id,
                        reading.base,
                        reading.idx,
                        hex::encode_upper(&reading.raw_bytes)
                    );
                }
            }
            Ok(())
        }
    }
}

fn print_read_outcome(outcome: &kmlink::ReadOutcome, json: bool) {
    if json {
        println!(
            "{{\"name\":\"{}\",\"idx\":{},\"raw\":\"0x{}\",\"decoded\":\"{}\",\"source\":\"{}\"}}",
            outcome.name,
            outcome.idx,
            hex::encode_upper(&outcome.raw),
            outcome.decoded.display(),
            outcome.source.as_str()
        );
    } else {
        println!(
            "{} = {}  (raw=0x{}, idx={}, source={})",
            outcome.name,
            outcome.decoded.display(),
            hex::encode_upper(&outcome.raw),
            outcome.idx,
            outcome.source.as_str()
        );
    }
}
