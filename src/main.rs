//! CLI entry point. See spec §6: `mongofs <mount_point> [<config_path>]`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use mongofs::{Config, FilesystemEngine, StoreClient};

#[derive(Parser)]
#[command(name = "mongofs", about = "A FUSE filesystem backed by a document database")]
struct Args {
    /// Directory to mount the filesystem at.
    mount_point: PathBuf,

    /// Path to the JSON configuration file.
    #[arg(default_value = "mongofs.json")]
    config_path: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> mongofs::Result<()> {
    let config = Config::load(&args.config_path)?;

    // In case a previous process crashed without unmounting.
    mongofs::mount::detach(&args.mount_point);

    let mountpoint = args.mount_point.clone();
    let abort_hook: Arc<dyn Fn() + Send + Sync> =
        Arc::new(move || mongofs::mount::abort(&mountpoint));
    let store = StoreClient::connect(&config, abort_hook)?;

    if config.development {
        log::warn!("development mode: wiping {} before mount", config.mongo_database);
        store.drop_all()?;
    }

    let engine = FilesystemEngine::new(store, &config)?;

    let mut options = vec![
        MountOption::FSName("mongofs".to_string()),
        MountOption::AutoUnmount,
    ];
    if config.default_root_mode & 0o007 != 0 {
        options.push(MountOption::AllowOther);
    }

    log::info!("mounting at {}", args.mount_point.display());
    fuser::mount2(engine, &args.mount_point, &options)
        .map_err(|e| mongofs::Error::StoreUnreachable(format!("mount failed: {e}")))
}
