pub mod applier;
pub mod block;
pub mod checkpoint;
pub mod checkpoint_manager;
pub mod codec;
pub mod collector;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod registry;
pub mod status;
pub mod store;

pub use error::*;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over the `debug` default.
/// Safe to call more than once.
pub fn init_tracing(debug: bool) {
    let default = if debug { "blockmerge=debug" } else { "blockmerge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
