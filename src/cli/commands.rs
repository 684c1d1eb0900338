use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("pg_sentinel")
        .about("PostgreSQL replication monitoring and failover daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(built_info::GIT_COMMIT_HASH.unwrap_or(env!("CARGO_PKG_VERSION")))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("config")
                .help("Path to the JSON configuration file")
                .env("PG_SENTINEL_CONFIG")
                .value_name("CONFIG")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "pg_sentinel");
        assert_eq!(
            command.get_about().unwrap().to_string(),
            env!("CARGO_PKG_DESCRIPTION")
        );
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_config_argument() {
        let command = new();
        let matches =
            command.get_matches_from(vec!["pg_sentinel", "/etc/pg_sentinel/pg_sentinel.json"]);

        assert_eq!(
            matches.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("/etc/pg_sentinel/pg_sentinel.json"))
        );
    }

    #[test]
    fn test_verbosity_count() {
        let command = new();
        let matches = command.get_matches_from(vec!["pg_sentinel", "config.json", "-vv"]);

        assert_eq!(matches.get_count("verbose"), 2);
    }
}
