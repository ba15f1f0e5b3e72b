use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use lsmkv::client::Client;
use std::process::ExitCode;

#[derive(Parser)]
struct Args {
    /// The address in the form host:port.
    #[clap(short, long, default_value = "localhost:9999")]
    address: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the value of the key.
    Get { key: String },
    /// Stores the value under the key.
    Set { key: String, value: String },
    /// Prints the engine counters.
    Stats,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut client = Client::connect(&args.address).await?;

    match args.command {
        Command::Get { key } => match client.get(Bytes::from(key.clone())).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                eprintln!("{}: not found", key);
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Set { key, value } => {
            client.set(Bytes::from(key), Bytes::from(value)).await?;
        }
        Command::Stats => print!("{}", client.stats().await?),
    }

    Ok(ExitCode::SUCCESS)
}
