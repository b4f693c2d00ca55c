use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use runway::api::{SettingsArgs, run_http_server, simulate_json};

#[derive(Parser, Debug)]
#[command(
    name = "runway",
    about = "Historical-window portfolio projections with staged withdrawal policies"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(
            long,
            default_value_t = 250,
            help = "Delay before a request starts, so rapid resubmissions collapse to the latest"
        )]
        throttle_ms: u64,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Run one request from a JSON file and print the response.
    Simulate {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            throttle_ms,
            settings,
        } => {
            if let Err(e) =
                run_http_server(port, Duration::from_millis(throttle_ms), settings.into()).await
            {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Simulate { input, settings } => {
            let json = match fs::read_to_string(&input) {
                Ok(json) => json,
                Err(e) => {
                    eprintln!("Failed to read {}: {e}", input.display());
                    std::process::exit(1);
                }
            };
            match simulate_json(&json, settings.into()) {
                Ok(response) => println!("{response}"),
                Err(e) => {
                    eprintln!("Simulation error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
