use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Operator CLI for pausing and resuming intercepted packets", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version, live sessions and held packet count
    Status,
    /// List packets currently held
    Held,
    /// Re-arm the hold deadline of a packet
    Pause { id: Uuid },
    /// Release a held packet
    Resume { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let base = cli.url.trim_end_matches('/');
    let request = match &cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Held => client.get(format!("{}/admin/packets/held", base)),
        Commands::Pause { id } => client.post(format!("{}/admin/packets/{}/pause", base, id)),
        Commands::Resume { id } => client.post(format!("{}/admin/packets/{}/resume", base, id)),
    };

    let res = request.headers(headers).send().await?;
    let status = res.status();
    if !status.is_success() {
        eprintln!("admin API answered {}: {}", status, res.text().await.unwrap_or_default());
        return Ok(ExitCode::FAILURE);
    }

    let body: Value = res.json().await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(ExitCode::SUCCESS);
    }

    match cli.command {
        Commands::Held => print_held(&body),
        Commands::Pause { id } | Commands::Resume { id } => {
            if body["applied"].as_bool() == Some(true) {
                println!("{} updated", id);
            } else {
                println!("{} is not held", id);
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status => println!("{}", serde_json::to_string_pretty(&body)?),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_held(body: &Value) {
    let Some(held) = body.as_array() else {
        println!("{}", body);
        return;
    };
    if held.is_empty() {
        println!("no packets held");
        return;
    }
    for packet in held {
        println!(
            "{}  {:<6} {:<16} {:>6} B  held {} ms",
            packet["id"].as_str().unwrap_or("?"),
            packet["protocol"].as_str().unwrap_or("?"),
            packet["direction"].as_str().unwrap_or("?"),
            packet["length"],
            packet["held_ms"],
        );
    }
}
