use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as HyperBuilder,
    service::TowerToHyperService,
};
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    cli::CommandArguments,
    error::{ServiceError, ServiceResult},
    guard::Caller,
    server::RoadmapServer,
};

/// Serves the enabled transports until stdio closes, a transport fails, or ctrl-c.
pub async fn start_server(args: CommandArguments) -> ServiceResult<()> {
    args.validate().map_err(ServiceError::FromString)?;

    let service = Arc::new(args.build_service()?);
    let caller = Caller::new(args.user_id.clone());
    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<ServiceResult<()>> = JoinSet::new();

    if args.enable_stdio {
        let server = RoadmapServer::new(service.clone(), caller.clone());
        let ct = shutdown.clone();
        tasks.spawn(async move {
            let running = server
                .serve(rmcp::transport::stdio())
                .await
                .map_err(|e| ServiceError::FromString(format!("Stdio server error: {e}")))?;
            tokio::select! {
                res = running.waiting() => {
                    res.map_err(|e| ServiceError::FromString(format!("Stdio server error: {e}")))?;
                    tracing::info!("stdio client disconnected");
                }
                _ = ct.cancelled() => {}
            }
            Ok(())
        });
    }

    if args.enable_http {
        let addr: SocketAddr = args
            .http_addr
            .parse()
            .map_err(|e| ServiceError::FromString(format!("Invalid MCP_HTTP_ADDR: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::FromString(format!("HTTP listen error: {e}")))?;
        tracing::info!(addr = %listener.local_addr()?, "streamable HTTP transport listening");

        let http_service = StreamableHttpService::new(
            {
                let service = service.clone();
                let caller = caller.clone();
                move || Ok(RoadmapServer::new(service.clone(), caller.clone()))
            },
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        );
        let ct = shutdown.clone();
        tasks.spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = listener.accept() => accepted
                        .map_err(|e| ServiceError::FromString(format!("HTTP accept error: {e}")))?,
                    _ = ct.cancelled() => return Ok(()),
                };
                let svc = http_service.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let hyper_svc = TowerToHyperService::new(svc);
                    if let Err(err) = HyperBuilder::new(TokioExecutor::new())
                        .serve_connection(io, hyper_svc)
                        .await
                    {
                        tracing::warn!(%peer, "HTTP connection error: {err}");
                    }
                });
            }
        });
    }

    let result = loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break Ok(()),
                Some(res) => {
                    let res = res
                        .map_err(|e| ServiceError::FromString(format!("Task join error: {e}")))
                        .and_then(|r| r);
                    if res.is_err() || args.enable_stdio {
                        break res;
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break Ok(());
            }
        }
    };

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    result
}
