//! Register an already-uploaded video and thumbnail in the catalog.
//!
//! Transcoding and upload stay outside this tool. It encrypts the title,
//! blind-indexes the tags and inserts the rows, using the same config and
//! secrets as the server.

use clap::Parser;
use uuid::Uuid;

use ghoststream_server::assets::ingest::{
    register_asset, thumb_key, video_key, NewAsset, DEFAULT_THUMB_PREFIX, DEFAULT_VIDEO_PREFIX,
};
use ghoststream_server::assets::CatalogStore;
use ghoststream_server::config::{Cli, Config, Secrets};
use ghoststream_server::crypto::{BlindIndex, MetadataCipher};
use ghoststream_server::db;

#[derive(Parser, Debug)]
#[command(name = "ghoststream-ingest", version, about = "Register an uploaded asset")]
struct Args {
    /// Video title (plaintext, stored encrypted)
    #[arg(long)]
    title: String,

    /// Comma-separated tags (blind indexed, exact match)
    #[arg(long)]
    tags: String,

    /// Bucket holding both objects
    #[arg(long, env = "GHOSTSTREAM_BUCKET")]
    bucket: String,

    /// Duration in whole seconds
    #[arg(long)]
    duration: i64,

    #[arg(long)]
    width: Option<i64>,

    #[arg(long)]
    height: Option<i64>,

    /// Asset id; also names the objects when keys are not given
    #[arg(long)]
    id: Option<Uuid>,

    /// Explicit object key of the video (default: {video_prefix}/{id}.mp4)
    #[arg(long)]
    video_key: Option<String>,

    /// Explicit object key of the thumbnail (default: {thumb_prefix}/{id}.jpg)
    #[arg(long)]
    thumb_key: Option<String>,

    #[arg(long, default_value = DEFAULT_VIDEO_PREFIX)]
    video_prefix: String,

    #[arg(long, default_value = DEFAULT_THUMB_PREFIX)]
    thumb_prefix: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./ghoststream.toml")]
    config: String,

    /// Data directory for the SQLite database
    #[arg(long)]
    data_dir: Option<String>,

    /// Validate and print the planned row without writing it
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ghoststream_server=info")),
        )
        .init();

    let config = Config::load(&Cli {
        config: args.config.clone(),
        data_dir: args.data_dir.clone(),
        ..Cli::default()
    })?;
    let secrets = Secrets::from_config(&config)?;

    let id = args.id.unwrap_or_else(Uuid::new_v4);
    let asset = NewAsset {
        id,
        title: args.title,
        tags: args.tags,
        duration_seconds: args.duration,
        width: args.width,
        height: args.height,
        bucket: args.bucket,
        video_key: args
            .video_key
            .unwrap_or_else(|| video_key(&args.video_prefix, &id)),
        thumb_key: args
            .thumb_key
            .unwrap_or_else(|| thumb_key(&args.thumb_prefix, &id)),
    };

    let cipher = MetadataCipher::new(&secrets.metadata_key);
    let index = BlindIndex::new(&secrets.tag_key);

    if args.dry_run {
        let tokens = index.tokenize_list(&asset.tags)?;
        println!("DRY RUN: would register {}", asset.id);
        println!("  {}/{}", asset.bucket, asset.video_key);
        println!("  {}/{}", asset.bucket, asset.thumb_key);
        println!("  {} tag token(s)", tokens.len());
        return Ok(());
    }

    let store = CatalogStore::new(db::init_db(&config.data_dir)?);
    let record = register_asset(&store, &cipher, &index, asset)?;

    println!("video_id: {}", record.id);
    println!("{}/{}", record.bucket, record.video_key);
    println!("{}/{}", record.bucket, record.thumb_key);
    Ok(())
}
