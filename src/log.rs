//! Ambient, reloadable structured logging.
//!
//! Installing a global subscriber is the embedding application's job, not
//! this crate's; [`init`] is a convenience helper for binaries and tests
//! only. [`Handle::set_level`] backs `Context::log_level`.

use std::fmt;
use tracing_subscriber::{
    filter::{LevelFilter, ParseError},
    layer::SubscriberExt as _,
    reload,
    util::SubscriberInitExt as _,
    EnvFilter, Registry,
};

/// Crates that are noisy at `debug`/`trace` and almost never what a NEAT
/// user wants to see when they ask for verbose logging.
const IRRELEVANT_CRATES: &str = "mio=warn,polling=warn";

fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }
    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// A live handle onto the active log filter, stashed on [`crate::Context`]
/// so `log_level` can change verbosity without re-installing a subscriber.
pub struct Handle {
    reload: reload::Handle<EnvFilter, Registry>,
}

impl Handle {
    pub fn set_level(&self, level: tracing::Level) -> crate::Result<()> {
        let filter = try_filter(&level.to_string())
            .map_err(|_| crate::Error::Internal("invalid log level directive"))?;
        self.reload
            .reload(filter)
            .map_err(|_| crate::Error::Internal("log subscriber already dropped"))
    }
}

/// Installs a global subscriber and returns a [`Handle`] for runtime
/// verbosity changes. Intended for binaries/tests embedding this crate
/// directly; a library consumer that already manages its own subscriber
/// should ignore this and call `Context::log_level` against whatever
/// `reload::Handle` it owns instead.
pub fn init() -> Handle {
    let directives = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = try_filter(&directives).unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string()));
    let (filter, reload) = reload::Layer::new(filter);

    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    // Only the first caller in a process wins; later calls in tests are
    // expected to be no-ops.
    let _ = subscriber.try_init();

    Handle { reload }
}

/// Returns a [`fmt::Display`] adapter that prints an error together with
/// its full `std::error::Error::source()` chain, one `: `-joined line.
pub fn err_with_src<'a>(e: &'a (dyn std::error::Error + 'static)) -> ErrorWithSources<'a> {
    ErrorWithSources { e }
}

pub struct ErrorWithSources<'a> {
    e: &'a (dyn std::error::Error + 'static),
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.e)?;
        let mut source = self.e.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(thiserror::Error, Debug)]
    #[error("oh no!")]
    struct Error1;

    #[derive(thiserror::Error, Debug)]
    #[error("failed to do the thing")]
    struct Error2(#[source] Error1);

    #[derive(thiserror::Error, Debug)]
    #[error("argh")]
    struct Error3(#[source] Error2);

    #[test]
    fn prints_errors_with_sources() {
        let error = Error3(Error2(Error1));

        let display = err_with_src(&error);

        assert_eq!(display.to_string(), "argh: failed to do the thing: oh no!");
    }
}
