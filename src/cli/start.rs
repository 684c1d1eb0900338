use crate::cli::{actions::Action, commands, dispatch::handler, telemetry};
use anyhow::Result;

/// The daemon is quiet by default; each `-v` opens it up one notch, from
/// operational messages through debug output to full traces.
const fn verbosity_to_level(verbose_count: u8) -> Option<tracing::Level> {
    match verbose_count {
        0 => None,
        1 => Some(tracing::Level::INFO),
        2 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Parse the command line, bring up logging, and resolve the action to run.
///
/// # Errors
///
/// Returns an error if the tracing subscriber cannot be installed or the
/// arguments do not name a configuration file.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(verbosity_to_level(matches.get_count("verbose")))?;

    handler(&matches)
}
