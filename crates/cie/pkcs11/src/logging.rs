//! Log output of the provider
//!
//! The subscriber is installed once per process, at the first initialize. A
//! host that already installed its own global subscriber keeps it.

use std::fs::OpenOptions;
use std::sync::{Mutex, Once};

use tracing_subscriber::EnvFilter;

use crate::config::ProviderConfig;

static INIT: Once = Once::new();

/// Install the provider's subscriber if none was installed yet
pub(crate) fn init(config: &ProviderConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true);

        let file = config.log_file.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .inspect_err(|e| eprintln!("cie-pkcs11: cannot open log file {}: {e}", path.display()))
                .ok()
        });

        let installed = match file {
            Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).try_init(),
            None => builder.with_writer(std::io::stderr).try_init(),
        };
        if installed.is_err() {
            tracing::debug!("A global subscriber is already installed");
        }
    });
}
