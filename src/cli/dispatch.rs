use crate::cli::actions::Action;
use anyhow::{Context, Result};
use std::path::PathBuf;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .context("usage: pg_sentinel <config filename>")?;

    Ok(Action::Run { config })
}
