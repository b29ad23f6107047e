mod client;
mod engine;
mod error;
mod http;
mod registry;
mod scheduler;
mod source;
mod storage;
mod types;
mod util;

use crate::client::{ClientError, FetcherClient};
use crate::engine::FetchEngine;
use crate::http::{ApiState, HttpApi};
use crate::registry::JobRegistry;
use crate::scheduler::Scheduler;
use crate::source::{BlockSource, CachedBlockSource, RpcBlockSource};
use crate::storage::ResultStorage;
use crate::types::cfg::{AppCfg, Cli, Commands};
use crate::util::{display_path, setup_log};
use clap::Parser;
use log::info;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_log();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(app_cfg) => serve(app_cfg).await,
        command => run_client(&cli.server, command).await,
    }
}

async fn serve(app_cfg: AppCfg) -> anyhow::Result<()> {
    info!("Start app");
    let result_storage = Arc::new(ResultStorage::new(app_cfg.result_path.clone())?);
    let rpc = RpcBlockSource::new(&app_cfg.rpc_url, app_cfg.rpc_rate_limit)?;
    let source: Arc<dyn BlockSource> =
        Arc::new(CachedBlockSource::open(rpc, &app_cfg.cache_path)?);
    let registry = Arc::new(JobRegistry::new());
    let engine = Arc::new(FetchEngine::new(
        source,
        registry.clone(),
        result_storage.clone(),
        app_cfg.engine_cfg(),
    ));
    let scheduler = Scheduler::new(app_cfg.max_workers, registry.clone(), engine);

    let served = HttpApi::launch(
        &app_cfg.http_address,
        app_cfg.http_port,
        ApiState {
            scheduler: scheduler.clone(),
            registry,
            result_storage,
        },
    )
    .await;

    scheduler.shutdown().await;
    info!("Stop app");
    served
}

async fn run_client(server: &str, command: Commands) -> anyhow::Result<()> {
    let client = FetcherClient::new(server)?;
    match command {
        Commands::Request { start, end } => {
            let job = client.request(start, end).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Status { job_id } => {
            let status = client.status(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Stop { job_id } => {
            println!("{}", client.stop(&job_id).await?);
        }
        Commands::Download { job_id, output } => match client.download(&job_id, &output).await {
            Ok(_) => println!("Saved to {}", display_path(&output)),
            Err(ClientError::Status { body, .. }) => {
                println!("Error: {}", body);
                process::exit(1);
            }
            Err(err) => return Err(err.into()),
        },
        Commands::List => {
            for job_id in client.list().await? {
                println!("{}", job_id);
            }
        }
        Commands::Serve(_) => anyhow::bail!("serve is not a client command"),
    }
    Ok(())
}
