use clap::Parser;
use roadmap_mcp::cli::{Cli, Command};
use roadmap_mcp::error::ServiceResult;
use roadmap_mcp::metadata::{PKG_NAME, PKG_VERSION};
use roadmap_mcp::transport::start_server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ServiceResult<()> {
    // stdout carries the stdio transport, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Start(args) => {
            tracing::info!(store = ?args.store, "starting {PKG_NAME} {PKG_VERSION}");
            start_server(args).await
        }
        Command::Status(args) => {
            args.validate().map_err(roadmap_mcp::error::ServiceError::FromString)?;
            println!("{}", args.describe());
            Ok(())
        }
        Command::Account(args) => {
            let status = args.apply()?;
            println!("{}: {:?} ({})", args.user_id, status.tier, status.status);
            Ok(())
        }
        Command::Version => {
            println!("{PKG_NAME} {PKG_VERSION}");
            Ok(())
        }
    }
}
