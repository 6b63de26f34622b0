use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "paidops-cli")]
#[command(about = "Paid opportunity service command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Print the ranked top-paid opportunities of a site as JSON.
    TopPaid {
        #[arg(long)]
        site: Uuid,
        #[arg(long)]
        year: Option<i64>,
        #[arg(long)]
        week: Option<i64>,
        #[arg(long)]
        month: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => paidops_web::serve_from_env().await?,
        Commands::TopPaid {
            site,
            year,
            week,
            month,
        } => {
            let opportunities = paidops_engine::top_paid_from_env(site, year, week, month).await?;
            println!("{}", serde_json::to_string_pretty(&opportunities)?);
        }
    }

    Ok(())
}
