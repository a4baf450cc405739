use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use bucket::{
    entry::ExtensionClassifier,
    router,
    thumbnail::{missing_binaries, ThumbnailGenerator, DEFAULT_THUMBNAIL_SIZE, REQUIRED_BINARIES},
    AppState, Root,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// --- Configuration ---
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The root directory to serve files from
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    root_dir: PathBuf,

    /// The network address to bind to
    #[arg(short, long, value_name = "ADDR", default_value = "127.0.0.1:3000")]
    bind_addr: SocketAddr,

    /// Directory holding the web UI (index.html and its assets)
    #[arg(long, value_name = "DIR", default_value = "ui/resources")]
    ui_dir: PathBuf,

    /// Edge length of generated thumbnails, in pixels
    #[arg(long, value_name = "PX", default_value_t = DEFAULT_THUMBNAIL_SIZE)]
    thumbnail_size: u32,

    /// Serve without thumbnails, so `gm` and `ffmpeg` aren't required
    #[arg(long)]
    no_thumbnails: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let root = match Root::establish(&args.root_dir) {
        Ok(root) => root,
        Err(e) => {
            error!("{}. Exiting.", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let thumbnails = if args.no_thumbnails {
        info!("Thumbnails disabled");
        None
    } else {
        let missing = missing_binaries(REQUIRED_BINARIES);
        if !missing.is_empty() {
            for binary in &missing {
                error!("'{}' must be installed and in the PATH", binary);
            }
            eprintln!(
                "Error: missing required binaries: {} (or run with --no-thumbnails)",
                missing.join(", ")
            );
            std::process::exit(1);
        }
        Some(ThumbnailGenerator::new(args.thumbnail_size))
    };

    info!("Serving files from: {}", root.path().display());
    info!("Listening on: {}", args.bind_addr);

    let shared_state = Arc::new(AppState {
        root,
        classifier: Arc::new(ExtensionClassifier),
        thumbnails,
        ui_dir: args.ui_dir,
    });

    let app = router(shared_state);

    let listener = match tokio::net::TcpListener::bind(args.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to address {}: {}", args.bind_addr, e);
            eprintln!("Error: Failed to bind to address {}: {}", args.bind_addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
