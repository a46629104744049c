//! photo-vault 可执行程序。
//!
//! `serve` 在会话网关之后提供分片上传与媒体流接口；
//! `upload` 通过与浏览器相同的分片协议把本地图片上传到运行中服务的相册。

mod assembly;
mod atomic;
mod auth;
mod background;
mod client;
mod config;
mod error;
mod etag;
mod http;
mod logging;
mod protocol;
mod queue;
mod rate_limit;
mod storage;
mod store;
mod streaming;
mod tls;
mod transform;
mod upload;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::assembly::ChunkAssemblyService;
use crate::auth::SessionGate;
use crate::background::spawn_background_tasks;
use crate::config::{Cli, Command, ServeArgs};
use crate::http::{RequestScheme, TrustedProxies, build_cors_layer};
use crate::rate_limit::FileRateLimiter;
use crate::storage::MediaLayout;
use crate::store::{MetadataStore, SqliteStore};
use crate::streaming::StreamingService;
use crate::transform::{FfmpegFrameExtractor, ImageThumbnailer};

shadow!(build);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            logging::init_logging("info");
            serve(args).await
        }
        Command::Upload(args) => {
            logging::init_logging("info");
            client::run_upload(args).await
        }
    }
}

/// 启动服务并阻塞直到退出。
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let layout = MediaLayout::new(
        args.media_root.clone(),
        args.thumb_root.clone(),
        args.variant_root.clone(),
    );
    layout
        .ensure_roots()
        .await
        .context("failed to create media directories")?;

    let store: Arc<dyn MetadataStore> = Arc::new(
        SqliteStore::connect(&args.database_url)
            .await
            .context("failed to open metadata store")?,
    );
    let limiter = Arc::new(FileRateLimiter::new(
        args.rate_limit_file.clone(),
        args.login_max_attempts,
        Duration::from_secs(args.login_lockout_secs),
    ));
    let lockout = limiter.lockout();
    let gate = Arc::new(SessionGate::new(
        args.auth_user.clone(),
        args.auth_pass.clone(),
        Duration::from_secs(args.session_ttl_secs),
        limiter,
        lockout,
    ));
    let assembly = Arc::new(ChunkAssemblyService::new(
        layout.clone(),
        store.clone(),
        gate.clone(),
        Arc::new(ImageThumbnailer),
        &args.allowed_extensions,
        args.max_chunks,
    ));
    let streaming = Arc::new(StreamingService::new(
        layout.clone(),
        store,
        gate.clone(),
        Arc::new(FfmpegFrameExtractor::new(args.ffmpeg_path.clone())),
        args.stream_strategy,
        args.proxy_prefix.clone(),
    ));
    let proxies = TrustedProxies::new(args.trusted_proxies.clone());
    let span_proxies = proxies.clone();
    info!(
        media_root = ?layout.media_root(),
        strategy = ?args.stream_strategy,
        extensions = ?args.allowed_extensions,
        trusted_proxies = ?args.trusted_proxies,
        "media services ready"
    );

    let mut app = Router::new()
        .route(
            "/api/upload",
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(upload::UPLOAD_BODY_LIMIT)),
        )
        .route("/api/media/{id}", delete(upload::delete_media))
        .route("/api/media/{mode}/{id}", get(streaming::serve_media))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| {
                            span_proxies.client_ip(request.headers(), addr.ip()).to_string()
                        })
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = %client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(proxies))
        .layer(Extension(gate.clone()))
        .layer(Extension(assembly))
        .layer(Extension(streaming));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("invalid bind address {}", args.host))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(gate, layout, Duration::from_secs(args.arena_ttl_secs));

    match args.https_port {
        Some(https_port) => {
            let https_addr = SocketAddr::new(host, https_port);
            let tls_config = tls::build_rustls_config(&args, host)
                .await
                .context("failed to load TLS configuration")?;
            info!("Starting HTTPS server at {}", https_addr);
            let https_app = app.layer(Extension(RequestScheme::Https));
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(https_app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
