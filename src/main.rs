use clap::Parser;
use dotenvy::dotenv;
use sheet_ingest::config::IngestConfig;
use sheet_ingest::infrastructure::{database, scanner, storage};
use sheet_ingest::services::key_management::MasterKeyProvider;
use sheet_ingest::{assemble, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initial Environment & Logging Setup
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheet_ingest=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let run_api = matches!(args.mode.as_str(), "api" | "all");
    let run_worker = matches!(args.mode.as_str(), "worker" | "all");
    if !run_api && !run_worker {
        anyhow::bail!("unknown mode '{}', expected api, worker or all", args.mode);
    }

    info!("🚀 Starting Sheet Ingest [Mode: {}]...", args.mode);

    // 2. Setup Common Infrastructure
    let db = database::setup_database().await?;
    let storage_service = storage::setup_storage().await?;

    let config = IngestConfig::from_env();
    info!(
        "🛡️  Ingest Config: Max Size={}MB, Virus Scan={}, Scanner={}, Workers={}",
        config.max_file_size / 1024 / 1024,
        config.enable_virus_scan,
        config.virus_scanner_type,
        config.worker_concurrency
    );

    let scanner_service = scanner::setup_scanner(&config).await;
    let keys = Arc::new(MasterKeyProvider::from_env(
        &config.master_key_id,
        &config.retired_key_ids,
    )?);

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("⚠️  JWT_SECRET not set, using the development default");
        "secret".to_string()
    });

    // 3. Setup Graceful Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    let components = assemble(
        db,
        storage_service,
        scanner_service,
        keys,
        config,
        &jwt_secret,
        shutdown_rx.clone(),
    );

    if let Err(e) = components.state.queue.resume_incomplete().await {
        error!("❌ Failed to resume unfinished jobs: {}", e);
    }

    // 4. Maintenance Worker
    if run_worker {
        let worker = components.worker;
        handles.push(tokio::spawn(async move {
            worker.run().await;
        }));
        info!("👷 Worker service initialized.");
    }

    // 5. API Service
    if run_api {
        // Configure tracing layer for HTTP requests
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");

                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri().path());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(components.state).layer(trace_layer);

        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!(
            "📖 Swagger UI documentation: http://localhost:{}/swagger-ui",
            args.port
        );

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    // 6. Wait for Shutdown Signal
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down services...");

    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .is_err()
        {
            warn!("⏱️  A service did not stop within 30s");
        }
    }

    info!("👋 Sheet Ingest exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📡 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
