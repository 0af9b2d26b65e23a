use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use shared::domain::{CountryCode, GraphCategory};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/market_scout.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the database is reachable.
    Check,
    /// List cached country reports in rank order.
    ListReports,
    /// Print one cached report as JSON.
    ShowReport { country_code: String },
    /// Delete every cached report.
    ClearReports,
    /// Write one cached graph PNG to disk.
    ExportGraph {
        country_code: String,
        /// Category slug, e.g. ease_of_doing_business.
        category: String,
        #[arg(long, default_value = "graph.png")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Check => {
            storage.health_check().await?;
            println!("database ok");
        }
        Command::ListReports => {
            let reports = storage.list_reports_by_rank().await?;
            if reports.is_empty() {
                println!("no cached reports");
            }
            for stored in reports {
                println!(
                    "#{} {} {} generated_at={}",
                    stored.rank,
                    stored.report.country_code,
                    stored.report.country_code.display_name(),
                    stored.generated_at
                );
            }
        }
        Command::ShowReport { country_code } => {
            let code = CountryCode::from(country_code.as_str());
            let stored = storage
                .report_for_country(&code)
                .await?
                .ok_or_else(|| anyhow!("no cached report for {code}"))?;
            println!("{}", serde_json::to_string_pretty(&stored.report)?);
        }
        Command::ClearReports => {
            let deleted = storage.delete_all_reports().await?;
            println!("deleted {deleted} cached reports");
        }
        Command::ExportGraph {
            country_code,
            category,
            out,
        } => {
            let code = CountryCode::from(country_code.as_str());
            let category = GraphCategory::parse(&category)
                .ok_or_else(|| anyhow!("unknown graph category '{category}'"))?;
            let graph = storage
                .load_graph(&code, category)
                .await?
                .ok_or_else(|| anyhow!("no cached {} graph for {code}", category.as_str()))?;
            std::fs::write(&out, &graph.png)?;
            println!(
                "wrote {} bytes to {} title={}",
                graph.png.len(),
                out.display(),
                graph.title
            );
        }
    }

    Ok(())
}
