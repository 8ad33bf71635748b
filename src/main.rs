use anyhow::{Context, Result};
use clap::Parser;
use flycast_server::services::pipeline::{PipelineService, PipelineTrigger};
use flycast_server::services::scheduler::SchedulerService;
use flycast_server::{cli, config, db, routes, services, state};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind flycast-server listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind flycast-server listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ServiceConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;

    let http = reqwest::Client::new();
    let push = Arc::new(services::push::PushGateway::from_config(
        http.clone(),
        &config,
    )?);

    let state = state::AppState {
        config: config.clone(),
        db: pool,
        http,
        push,
    };

    let pipeline = PipelineService::new(state.clone());

    if args.run_once {
        let run_at = pipeline.weather().latest_run_at().await?;
        match pipeline.run_full(PipelineTrigger::Manual, run_at).await? {
            Some(result) => {
                tracing::info!(
                    predictions = result.predictions_written,
                    events = result.events_emitted,
                    sent = result.delivery.sent,
                    "single pipeline run finished"
                );
            }
            None => tracing::warn!("pipeline was already running"),
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    SchedulerService::new(state.clone(), pipeline).start(cancel.clone());

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "flycast-server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err.to_string().to_lowercase().contains("operation not permitted") {
            // Sandbox environments can block binding attempts; skip assertions in that case.
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
