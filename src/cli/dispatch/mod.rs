use crate::{cli::actions::Action, emitter::SinkKind};
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use tracing::debug;

/// Turn parsed arguments into an [`Action`].
///
/// # Errors
///
/// Returns an error if a required argument is missing or the sink is unknown
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    // Get the port or return an error
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // Get the listen address (None means auto-detect)
    let listen = matches.get_one::<String>("listen").map(ToString::to_string);

    let config = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .ok_or_else(|| anyhow!("Config is required. Please provide it using the --config flag."))?;

    let sink = matches
        .get_one::<String>("sink")
        .map_or(Ok(SinkKind::default()), |s| s.parse::<SinkKind>())?;

    debug!(port, ?listen, config = %config.display(), %sink, "parsed arguments");

    Ok(Action::Run {
        port,
        listen,
        config,
        sink,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn test_handler_defaults_to_prometheus() {
        temp_env::with_var("RDS_METRIC_COLLECTOR_SINK", None::<&str>, || {
            let matches = commands::new().get_matches_from(vec![
                "rds_metric_collector",
                "--config",
                "config.json",
            ]);

            let Action::Run { sink, .. } = handler(&matches).unwrap();
            assert_eq!(sink, SinkKind::Prometheus);
        });
    }

    #[test]
    fn test_handler_stdout_sink() {
        let matches = commands::new().get_matches_from(vec![
            "rds_metric_collector",
            "--config",
            "config.json",
            "--sink",
            "stdout",
        ]);

        let Action::Run { sink, .. } = handler(&matches).unwrap();
        assert_eq!(sink, SinkKind::Stdout);
    }
}
