#![forbid(unsafe_code)]

//! Download orchestration and subscription scheduling on top of yt-dlp.
//!
//! The library owns every decision about *what* gets downloaded, *when*, and
//! *where* it lands. The binaries under `src/bin` are thin shells around
//! [`facade::Orchestrator`].

pub mod archive;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod facade;
pub mod fetcher;
pub mod scheduler;
pub mod security;
pub mod store;

/// Installs the `tracing` subscriber shared by every binary.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tubevault_tools=info,backend=info,routine_update=info,download=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
