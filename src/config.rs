//! 命令行参数与服务端默认配置。

use clap::{Args, Parser, Subcommand, ValueEnum};
use shadow_rs::formatcp;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const AUTH_COOKIE_NAME: &str = "PV_SESSION";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";
pub const DEFAULT_AUTH_USER: &str = "admin";
pub const DEFAULT_AUTH_PASS: &str = "admin";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_ALLOWED_EXTENSIONS: &str = "jpg,jpeg";
pub const DEFAULT_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_ARENA_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PROXY_PREFIX: &str = "/internal-media";
pub const DEFAULT_UPLOAD_PARALLEL: usize = 3;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const ARENA_SWEEP_INTERVAL_SECS: u64 = 900;
pub const THUMBNAIL_WIDTH: u32 = 400;
pub const THUMBNAIL_QUALITY: u8 = 95;
pub const VIDEO_THUMBNAIL_WIDTH: u32 = 120;
pub const VIDEO_THUMBNAIL_AT_SECS: u32 = 5;
pub const MAX_IMAGE_DIMENSION: u32 = 16_384;
pub const MAX_DECODE_ALLOC_BYTES: u64 = 512 * 1024 * 1024;

/// Top-level command line.
#[derive(Parser, Debug)]
#[command(name = "photo-vault", version = VERSION_INFO, about = "Photo vault media server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload and streaming server
    Serve(ServeArgs),
    /// Upload image files into an album on a running server
    Upload(UploadArgs),
}

/// 媒体字节的输出方式。
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStrategy {
    /// Copy the bytes from disk in this process.
    Direct,
    /// Hand the request to the fronting static-file layer via `X-Accel-Redirect`.
    Proxy,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "PHOTO_VAULT_MEDIA_ROOT",
        default_value = ".photo-vault/media",
        help = "Root directory for original media"
    )]
    pub media_root: PathBuf,
    #[arg(
        long,
        env = "PHOTO_VAULT_THUMB_ROOT",
        default_value = ".photo-vault/thumbnails",
        help = "Root directory for thumbnails"
    )]
    pub thumb_root: PathBuf,
    #[arg(
        long,
        env = "PHOTO_VAULT_VARIANT_ROOT",
        default_value = ".photo-vault/variants",
        help = "Root directory for pre-converted streaming variants"
    )]
    pub variant_root: PathBuf,
    #[arg(
        long,
        env = "PHOTO_VAULT_DATABASE_URL",
        default_value = "sqlite://.photo-vault/photo-vault.db",
        help = "Metadata database URL"
    )]
    pub database_url: String,
    #[arg(
        long,
        env = "PHOTO_VAULT_RATE_LIMIT_FILE",
        default_value = ".photo-vault/rate_limits.json",
        help = "Login rate limit state file"
    )]
    pub rate_limit_file: PathBuf,
    #[arg(
        long,
        env = "PHOTO_VAULT_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Admin username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "PHOTO_VAULT_AUTH_PASS",
        default_value = DEFAULT_AUTH_PASS,
        help = "Admin password"
    )]
    pub auth_pass: String,
    #[arg(
        short = 'b',
        long,
        env = "PHOTO_VAULT_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PHOTO_VAULT_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "PHOTO_VAULT_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "PHOTO_VAULT_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "PHOTO_VAULT_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "PHOTO_VAULT_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "PHOTO_VAULT_TRUSTED_PROXIES",
        value_delimiter = ',',
        help = "Peer addresses whose X-Forwarded-For / X-Forwarded-Proto are honoured"
    )]
    pub trusted_proxies: Vec<IpAddr>,
    #[arg(
        long,
        env = "PHOTO_VAULT_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session idle timeout in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "PHOTO_VAULT_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Failed logins before lockout"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "PHOTO_VAULT_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Lockout window in seconds"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "PHOTO_VAULT_ALLOWED_EXTENSIONS",
        default_value = DEFAULT_ALLOWED_EXTENSIONS,
        value_delimiter = ',',
        help = "Accepted upload extensions"
    )]
    pub allowed_extensions: Vec<String>,
    #[arg(
        long,
        env = "PHOTO_VAULT_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub max_chunks: u64,
    #[arg(
        long,
        env = "PHOTO_VAULT_ARENA_TTL_SECS",
        default_value_t = DEFAULT_ARENA_TTL_SECS,
        help = "Age after which abandoned chunks are removed (0 to disable)"
    )]
    pub arena_ttl_secs: u64,
    #[arg(
        long,
        env = "PHOTO_VAULT_STREAM_STRATEGY",
        value_enum,
        default_value_t = StreamStrategy::Direct,
        help = "Serve media bytes directly or via proxy handoff"
    )]
    pub stream_strategy: StreamStrategy,
    #[arg(
        long,
        env = "PHOTO_VAULT_PROXY_PREFIX",
        default_value = DEFAULT_PROXY_PREFIX,
        help = "Internal location prefix used for proxy handoff"
    )]
    pub proxy_prefix: String,
    #[arg(
        long,
        env = "PHOTO_VAULT_FFMPEG_PATH",
        default_value = "ffmpeg",
        help = "ffmpeg binary for video thumbnails"
    )]
    pub ffmpeg_path: PathBuf,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[arg(
        short = 's',
        long,
        env = "PHOTO_VAULT_SERVER",
        default_value = "http://127.0.0.1:5005",
        help = "Server base URL"
    )]
    pub server: String,
    #[arg(short = 'a', long, help = "Target album id")]
    pub album: i64,
    #[arg(long, env = "PHOTO_VAULT_AUTH_USER", default_value = DEFAULT_AUTH_USER)]
    pub user: String,
    #[arg(long, env = "PHOTO_VAULT_AUTH_PASS", default_value = DEFAULT_AUTH_PASS)]
    pub pass: String,
    #[arg(
        short = 'j',
        long,
        default_value_t = DEFAULT_UPLOAD_PARALLEL,
        help = "Files uploaded at the same time"
    )]
    pub parallel: usize,
    #[arg(required = true, help = "Files to upload")]
    pub files: Vec<PathBuf>,
}
