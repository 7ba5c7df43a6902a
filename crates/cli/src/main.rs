mod console;
mod ipc_client;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use attache_config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "attache",
    version,
    about = "A session-aware personal agent bridging chat and a local LLM CLI"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "attache.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon with a console channel (stdin/stdout).
    Start,
    /// Query the running daemon's status over IPC.
    Status,
    /// Manage scheduled jobs in the running daemon.
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },
    /// Inspect and control workflows in the running daemon.
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Print the resolved config path and data directory.
    Config,
}

#[derive(Debug, Subcommand)]
enum CronCommands {
    List,
    Add {
        name: String,
        /// Five-field cron expression, quoted.
        schedule: String,
        prompt: String,
        #[arg(long, default_value = "announce")]
        delivery: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Remove a job by id or name.
    Rm { id_or_name: String },
    /// Fire a job once, outside its schedule.
    Run { id_or_name: String },
    Toggle { id_or_name: String },
}

#[derive(Debug, Subcommand)]
enum WorkflowCommands {
    List,
    Show { id: String },
    Cancel { id: String },
    Pause { id: String },
    Resume { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::Start => console::run_daemon(config).await,
        Commands::Status => {
            let client = ipc_client::IpcClient::connect(&config)?;
            let status = client.get("/status").await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Cron { command } => run_cron_command(&config, command).await,
        Commands::Workflow { command } => run_workflow_command(&config, command).await,
        Commands::Config => {
            println!("config: {}", cli.config);
            println!("data:   {}", config.data_dir().display());
            Ok(())
        }
    }
}

async fn run_cron_command(config: &AppConfig, command: CronCommands) -> Result<()> {
    let client = ipc_client::IpcClient::connect(config)?;
    match command {
        CronCommands::List => {
            let jobs = client.get("/crons").await?;
            let Some(jobs) = jobs.as_array() else {
                bail!("unexpected response shape");
            };
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{} {:<20} {:<16} enabled={} last={}",
                    job["id"].as_str().unwrap_or("?"),
                    job["name"].as_str().unwrap_or("?"),
                    job["schedule"].as_str().unwrap_or("?"),
                    job["enabled"],
                    job["state"]["last_status"],
                );
            }
            Ok(())
        }
        CronCommands::Add { name, schedule, prompt, delivery, model } => {
            let body = serde_json::json!({
                "name": name,
                "schedule": schedule,
                "prompt": prompt,
                "delivery": delivery,
                "model": model,
            });
            let created = client.post("/crons", Some(body)).await?;
            println!("created {}", created["id"].as_str().unwrap_or("?"));
            Ok(())
        }
        CronCommands::Rm { id_or_name } => {
            client.post(&format!("/crons/{id_or_name}/delete"), None).await?;
            println!("removed");
            Ok(())
        }
        CronCommands::Run { id_or_name } => {
            client.post(&format!("/crons/{id_or_name}/run"), None).await?;
            println!("fired");
            Ok(())
        }
        CronCommands::Toggle { id_or_name } => {
            let job = client.post(&format!("/crons/{id_or_name}/toggle"), None).await?;
            println!("enabled={}", job["enabled"]);
            Ok(())
        }
    }
}

async fn run_workflow_command(config: &AppConfig, command: WorkflowCommands) -> Result<()> {
    let client = ipc_client::IpcClient::connect(config)?;
    match command {
        WorkflowCommands::List => {
            let workflows = client.get("/workflows").await?;
            let Some(workflows) = workflows.as_array() else {
                bail!("unexpected response shape");
            };
            for wf in workflows {
                println!(
                    "{} {:<24} {}",
                    wf["id"].as_str().unwrap_or("?"),
                    wf["name"].as_str().unwrap_or("?"),
                    wf["status"].as_str().unwrap_or("?"),
                );
            }
            Ok(())
        }
        WorkflowCommands::Show { id } => {
            let workflows = client.get("/workflows").await?;
            let found = workflows
                .as_array()
                .and_then(|list| list.iter().find(|w| w["id"].as_str() == Some(id.as_str())));
            match found {
                Some(wf) => println!("{}", serde_json::to_string_pretty(wf)?),
                None => bail!("no workflow {id}"),
            }
            Ok(())
        }
        WorkflowCommands::Cancel { id } => {
            client.post(&format!("/workflows/{id}/cancel"), None).await?;
            println!("cancelled");
            Ok(())
        }
        WorkflowCommands::Pause { id } => {
            client.post(&format!("/workflows/{id}/pause"), None).await?;
            println!("paused");
            Ok(())
        }
        WorkflowCommands::Resume { id } => {
            client.post(&format!("/workflows/{id}/resume"), None).await?;
            println!("resumed");
            Ok(())
        }
    }
}
