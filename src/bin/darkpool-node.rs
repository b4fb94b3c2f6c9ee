// src/bin/darkpool-node.rs
use clap::{Parser, Subcommand};
use std::env;
use yansi::Paint;

#[derive(Parser)]
#[command(name = "darkpool-node", about = "Darkpool transaction pool node CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pool node (API + batch cycle + reconciler)
    Start {
        /// API port (default: 8080)
        #[arg(long, default_value_t = 8080)]
        api_port: u16,

        /// SQLite database path (optional)
        #[arg(long)]
        db_path: Option<String>,

        /// Seconds between batch cycles (optional)
        #[arg(long)]
        window_secs: Option<u64>,

        /// Maximum transactions per batch (optional)
        #[arg(long)]
        max_batch_size: Option<usize>,

        /// Run on the in-memory backend (nothing survives a restart)
        #[arg(long)]
        memory: bool,
    },
}

fn banner() {
    let name = r#"
 ____    _    ____  _  ______   ___   ___  _
|  _ \  / \  |  _ \| |/ /  _ \ / _ \ / _ \| |
| | | |/ _ \ | |_) | ' /| |_) | | | | | | | |
| |_| / ___ \|  _ <| . \|  __/| |_| | |_| | |___
|____/_/   \_\_| \_\_|\_\_|    \___/ \___/|_____|

"#;
    println!("{}", Paint::cyan(name).bold());
    println!(
        "{} {}",
        Paint::green("Darkpool Node").bold(),
        Paint::white("— private transaction pool with batched execution").dimmed()
    );
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    banner();

    match cli.command {
        Commands::Start {
            api_port,
            db_path,
            window_secs,
            max_batch_size,
            memory,
        } => {
            // Set env variables the rest of the node expects
            env::set_var("API_ADDR", format!("0.0.0.0:{}", api_port));
            if let Some(p) = db_path {
                env::set_var("SQLITE_PATH", p);
            }
            if let Some(w) = window_secs {
                env::set_var("BATCH_WINDOW_SECS", w.to_string());
            }
            if let Some(m) = max_batch_size {
                env::set_var("MAX_BATCH_SIZE", m.to_string());
            }
            if memory {
                env::set_var("STORAGE_MODE", "memory");
            }

            println!(
                "{} API -> http://127.0.0.1:{}",
                Paint::blue("[starting]").bold(),
                api_port
            );

            let config = darkpool::config::Config::from_env();
            darkpool::run(config).await?;
        }
    }

    Ok(())
}
