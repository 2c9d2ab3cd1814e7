use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

use ghoststream_server::config::{generate_config_template, Cli, Config, Secrets};
use ghoststream_server::pipeline::{PipelineSettings, RequestPipeline};
use ghoststream_server::presign::UrlSigner;
use ghoststream_server::{db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ghoststream_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!(
        "GhostStream server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Secret material is decoded once; a bad key stops startup here
    let secrets = Secrets::from_config(&config)?;

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Missing object store credentials keep the server up; every signing
    // stage then answers SigningUnavailable.
    let signer = match &config.object_store {
        Some(store) => match UrlSigner::new(store.credentials()) {
            Ok(signer) => {
                tracing::info!(endpoint = %store.endpoint, "Object store signer ready");
                Some(signer)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Object store config rejected, URL signing disabled");
                None
            }
        },
        None => {
            tracing::warn!("No [object_store] section configured, URL signing disabled");
            None
        }
    };

    let settings = PipelineSettings::from_config(&config)?;
    tracing::info!(
        feed_per_window = settings.feed_rule.limit,
        play_per_window = settings.play_rule.limit,
        window_secs = settings.feed_rule.window_secs,
        url_ttl_secs = settings.url_ttl_secs,
        "Delivery pipeline configured"
    );
    let pipeline = RequestPipeline::new(&secrets, settings, signer, db);

    let app_state = state::AppState {
        pipeline: Arc::new(pipeline),
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
