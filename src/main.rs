#![warn(
    rust_2024_compatibility,
    clippy::all,
    clippy::future_not_send,
    clippy::mod_module_files,
    clippy::needless_pass_by_ref_mut,
    clippy::unused_async
)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
use rama::{
    Layer as RamaLayer,
    graceful::Shutdown,
    http::{layer::trace::TraceLayer, server::HttpServer},
    layer::ConsumeErrLayer,
    rt::Executor,
    tcp::server::TcpListener,
};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};
use vein_npm::config::Config;
use vein_npm::npm::{Backend, NpmService};
use vein_npm::proxy::ProxyCache;
use vein_npm::registry::LocalRegistry;
use vein_npm::upstream::HttpRemote;

#[derive(Debug, Parser)]
#[command(author, version, about = "Vein npm registry and caching proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the registry server
    Serve {
        /// Path to the configuration file
        #[arg(long, default_value = "vein-npm.toml")]
        config: PathBuf,
    },
    /// Perform a health check against a running registry
    Health {
        /// URL of the ping endpoint
        #[arg(long, default_value = "http://127.0.0.1:8346/-/ping")]
        url: String,
        /// Timeout in seconds for the request
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => run_server(config),
        Command::Health { url, timeout } => run_health(url, timeout),
    }
}

fn run_server(config_path: PathBuf) -> Result<()> {
    let config = Arc::new(Config::load(Some(config_path)).context("loading configuration")?);
    config.validate().context("validating configuration")?;
    init_tracing(&config)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("constructing setup runtime")?;

    let storage = Arc::new(config.storage.open());
    rt.block_on(storage.prepare())
        .context("preparing storage directory")?;
    drop(rt);

    let backend = match &config.upstream {
        Some(upstream) => {
            let remote = HttpRemote::new(upstream).context("creating upstream client")?;
            let staging_dir = config.proxy.staging_dir();
            tracing::info!(
                upstream = %upstream.url,
                ttl_secs = config.proxy.metadata_ttl_secs,
                staging = %staging_dir.display(),
                "running as caching proxy"
            );
            Backend::Proxy(ProxyCache::new(
                storage,
                remote,
                config.proxy.metadata_ttl(),
                staging_dir,
            ))
        }
        None => {
            tracing::info!(
                storage = %config.storage.path.display(),
                "running as hosted registry"
            );
            Backend::Hosted(LocalRegistry::new(storage))
        }
    };

    let service = NpmService::new(
        backend,
        config.server.base_url.clone(),
        config.server.mount_prefix().map(str::to_string),
    );

    let rt_server = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers)
        .enable_all()
        .build()
        .context("constructing server runtime")?;

    rt_server.block_on(async move {
        let graceful = Shutdown::default();
        let addr = format!("{}:{}", config.server.host, config.server.port);

        tracing::info!(
            %addr,
            public_url = %config.server.public_base_url(),
            "starting Rama HTTP server"
        );

        let tcp_service = TcpListener::build()
            .bind(addr.clone())
            .await
            .map_err(|err| anyhow::anyhow!("binding {addr}: {err}"))?;

        let server_service = service.clone();
        graceful.spawn_task_fn(move |guard| async move {
            let exec = Executor::graceful(guard.clone());
            let http_service = HttpServer::auto(exec).service(
                (TraceLayer::new_for_http(), ConsumeErrLayer::default())
                    .into_layer(server_service),
            );

            tcp_service.serve_graceful(guard, http_service).await;
        });

        tokio::signal::ctrl_c()
            .await
            .context("listening for shutdown signal")?;

        graceful
            .shutdown_with_limit(Duration::from_secs(30))
            .await?;
        service.close().await;

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn run_health(url: String, timeout: u64) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()
        .context("building health check client")?;

    let response = client
        .get(&url)
        .send()
        .context("sending health check request")?;

    if response.status().is_success() {
        println!("Registry healthy: {}", response.status());
        Ok(())
    } else {
        bail!("ping endpoint returned status {}", response.status());
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(config.logging.filter_directive()))
        .context("building log filter")?;

    let fmt_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        use opentelemetry_otlp::WithExportConfig;

        let resource = Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", "vein-npm"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build();

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?;

        let provider = sdktrace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();

        let tracer = provider.tracer("vein-npm");
        global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}
