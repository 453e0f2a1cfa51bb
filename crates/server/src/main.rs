//! ChatBridge background host
//!
//! Runs the extension background process: session ports and content scripts
//! attach over WebSocket, runtime control messages arrive over HTTP.

mod background;
mod bridge;
mod browser;
mod config;
mod credentials;
mod dispatch;
mod host;
mod intercept;
mod lifecycle;
mod logging;
mod paths;
mod redact;
mod relay;
mod router;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chatbridge_connectors::{ApiStyle, OpenAiCompatible};
use chatbridge_protocol::ModelGroup;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::background::Background;
use crate::bridge::HostState;
use crate::config::ConfigStore;
use crate::credentials::ConfigCredentials;
use crate::dispatch::AdapterSet;
use crate::host::HostBrowser;
use crate::logging::{LogFormat, LogOptions};
use crate::paths::DataPaths;

#[derive(Parser, Debug)]
#[command(name = "chatbridge")]
#[command(about = "Background host for the ChatBridge extension")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CHATBRIDGE_BIND", default_value = "127.0.0.1:4747")]
    bind: SocketAddr,

    /// Data directory for config and logs
    #[arg(long, env = "CHATBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL extension pages are served from
    #[arg(long, env = "CHATBRIDGE_EXTENSION_BASE")]
    extension_base: Option<String>,

    /// Log filter directives; RUST_LOG applies when unset
    #[arg(long, env = "CHATBRIDGE_LOG_FILTER")]
    log_filter: Option<String>,

    /// Log line format
    #[arg(long, env = "CHATBRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

fn adapters(http: &reqwest::Client) -> AdapterSet {
    let chat = Arc::new(OpenAiCompatible::new(http.clone(), ApiStyle::Chat));
    let completion = Arc::new(OpenAiCompatible::new(http.clone(), ApiStyle::Completion));
    AdapterSet::default()
        .with(ModelGroup::Custom, chat.clone())
        .with(ModelGroup::ChatgptApi, chat.clone())
        .with(ModelGroup::MoonshotApi, chat.clone())
        .with(ModelGroup::OllamaApi, chat.clone())
        .with(ModelGroup::ChatGlmApi, chat)
        .with(ModelGroup::GptCompletionApi, completion)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    paths.ensure_dirs()?;
    let _logging = logging::init_logging(
        &paths.log_dir(),
        &LogOptions {
            filter: cli.log_filter,
            format: cli.log_format,
        },
    )?;

    info!(
        component = "server",
        event = "server.starting",
        data_dir = %paths.root().display(),
        "Starting ChatBridge background host"
    );

    let config = ConfigStore::load(paths.config_path()).await?;
    let http = reqwest::Client::new();
    let extension_base = cli
        .extension_base
        .unwrap_or_else(|| format!("http://{}/extension", cli.bind));
    let browser = Arc::new(HostBrowser::new(extension_base));
    let background = Background::new(
        config.clone(),
        browser.clone(),
        Arc::new(ConfigCredentials::new(config)),
        adapters(&http),
        http,
    );

    let app = bridge::router(HostState {
        background,
        browser,
    })
    .layer(TraceLayer::new_for_http())
    .layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %cli.bind,
        "Listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}
