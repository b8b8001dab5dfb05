pub mod config;
pub mod error;
pub mod geometry;
pub mod loader;
pub mod logging;
pub mod protocol;
pub mod replay;
pub mod scene;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;
pub mod timer;
pub mod transform;
pub mod viewport;
pub use error::{AppError, AppResult};

use anyhow::Context;
use clap::Parser;

/// Entrypoint used by the `fogsync` binary. Channel frames are read from stdin.
pub fn run() -> anyhow::Result<()> {
    let args = replay::ReplayArgs::parse();
    logging::init();
    tracing::info!("starting fogsync replay");

    let options = args.into_options(config::load_session_config());

    let mut session = replay::build_session(&options).with_context(|| {
        format!(
            "failed to prepare session from {:?}",
            options.initial_scene.as_deref()
        )
    })?;
    let stdin = std::io::stdin();
    let summary =
        replay::replay(stdin.lock(), &mut session).context("failed to replay channel frames")?;

    tracing::info!(
        frames = summary.frames,
        applied = summary.applied,
        dropped = summary.dropped,
        revision = summary.revision,
        "replay complete"
    );
    Ok(())
}
