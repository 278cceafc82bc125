use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use warden_api::app::{AppServices, build_app};
use warden_core::{TenantId, UserId};
use warden_infra::{WardenConfig, spawn_growth_monitor, spawn_policy_resync};

#[derive(Parser, Debug)]
#[command(name = "warden-api", about = "Multi-tenant RBAC gateway", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve HTTP (the default)
    Serve,
    /// Print a signed token for a principal and exit. Combine with
    /// WARDEN_BOOTSTRAP_ADMIN to get a first administrator token.
    IssueToken {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    warden_observability::init();

    let config = WardenConfig::from_env();
    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::IssueToken { tenant, user } => issue_token(config, &tenant, &user).await,
    }
}

async fn issue_token(config: WardenConfig, tenant: &str, user: &str) -> anyhow::Result<()> {
    let tenant: TenantId = tenant.parse()?;
    let user: UserId = user.parse()?;
    let services = AppServices::from_config(config).await?;
    let issued = services.issuer.issue(&user, &tenant).await?;
    println!("{}", issued.token);
    services.pool.shutdown();
    Ok(())
}

async fn serve(config: WardenConfig) -> anyhow::Result<()> {
    let bind = config.bind.clone();
    let monitor_interval = config.monitor_interval;
    let resync_interval = config.policy_resync_interval;

    let services = Arc::new(AppServices::from_config(config).await?);
    services.bus.start();
    let monitor = spawn_growth_monitor(services.monitor.clone(), services.pool.clone(), monitor_interval);
    let resync = spawn_policy_resync(services.pipeline.clone(), resync_interval);

    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        instance = services.bus.instance_id(),
        "listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    resync.shutdown().await;
    monitor.shutdown().await;
    services.bus.shutdown();
    services.pool.shutdown();
    Ok(())
}
