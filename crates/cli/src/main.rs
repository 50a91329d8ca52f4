//! Loanq CLI - submit loans and inspect the daemon over JSON-RPC

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9630";
const DEMO_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "loanq")]
#[command(about = "Loanq approval pipeline CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "LOANQ_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one loan for approval
    Submit {
        #[arg(short, long)]
        borrower_id: i64,

        /// Principal amount
        #[arg(short, long)]
        amount: f64,

        /// Term in months (1-60)
        #[arg(short, long)]
        term: u32,
    },

    /// Send three sample loans one second apart
    Demo,

    /// Show daemon and queue status
    Health,
}

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: serde_json::Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: u64,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize, Tabled)]
#[serde(rename_all = "camelCase")]
struct SubmitResult {
    loan_id: i64,
    status: String,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LoanInput {
    borrower_id: i64,
    amount: f64,
    term: u32,
}

/// The three sample requests: one approved, one over the threshold, one approved
fn demo_loans() -> [LoanInput; 3] {
    [
        LoanInput { borrower_id: 1, amount: 30000.0, term: 12 },
        LoanInput { borrower_id: 2, amount: 75000.0, term: 24 },
        LoanInput { borrower_id: 3, amount: 45000.0, term: 18 },
    ]
}

fn submit_params(loan: &LoanInput) -> serde_json::Value {
    json!({
        "borrowerId": loan.borrower_id,
        "amount": loan.amount,
        "term": loan.term,
    })
}

async fn call_rpc(url: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params,
        id: 1,
    };

    let client = reqwest::Client::new();
    let response: JsonRpcResponse = client
        .post(url)
        .json(&request)
        .send()
        .await
        .context("Failed to connect to daemon")?
        .json()
        .await
        .context("Failed to parse response")?;

    if let Some(error) = response.error {
        anyhow::bail!("RPC error ({}): {}", error.code, error.message);
    }

    response
        .result
        .ok_or_else(|| anyhow::anyhow!("No result in response"))
}

/// Submit one loan and print the receipt; returns the parsed result
async fn submit(url: &str, loan: &LoanInput) -> Result<SubmitResult> {
    let result = call_rpc(url, "loans.submit.v1", submit_params(loan)).await?;
    let warning = result
        .get("warning")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let submit_result: SubmitResult = serde_json::from_value(result)?;

    match warning {
        None => println!("{}", "✓ Loan submitted for approval".green().bold()),
        Some(warning) => println!("{}", format!("! {}", warning).yellow().bold()),
    }
    Ok(submit_result)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            borrower_id,
            amount,
            term,
        } => {
            let loan = LoanInput {
                borrower_id,
                amount,
                term,
            };
            let result = submit(&cli.rpc_url, &loan).await?;
            println!();
            println!("{}", Table::new(vec![result]));
        }

        Commands::Demo => {
            println!("{}", "--- Starting Loan Request Submission ---".cyan().bold());
            println!();

            let mut results = Vec::new();
            for (i, loan) in demo_loans().iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(DEMO_INTERVAL).await;
                }
                println!(
                    "  {} borrower {} amount {} term {}",
                    "→".bold(),
                    loan.borrower_id,
                    loan.amount,
                    loan.term
                );
                results.push(submit(&cli.rpc_url, loan).await?);
            }

            println!();
            println!("{}", Table::new(results));
            println!();
            println!("{}", "--- All loan requests sent! ---".cyan().bold());
        }

        Commands::Health => {
            println!("{}", "System Status".cyan().bold());
            println!();

            match call_rpc(&cli.rpc_url, "system.health.v1", json!({})).await {
                Ok(health) => {
                    println!("  {} {}", "RPC URL:".bold(), cli.rpc_url);
                    println!("  {} {}", "Status:".bold(), "ONLINE".green());
                    println!("  {} {}", "Version:".bold(), health["version"]);
                    println!("  {} {}", "Queue:".bold(), health["queue"]);
                    let queue_status = if health["queueAvailable"].as_bool().unwrap_or(false) {
                        "AVAILABLE".green()
                    } else {
                        "UNAVAILABLE (manual approval)".yellow()
                    };
                    println!("  {} {}", "Queue status:".bold(), queue_status);
                    println!("  {} {} seconds", "Uptime:".bold(), health["uptimeSeconds"]);
                }
                Err(e) => {
                    println!("  {} {}", "Status:".bold(), "ERROR".red());
                    println!("  {} {}", "Error:".bold(), e);
                }
            }
        }
    }

    Ok(())
}
