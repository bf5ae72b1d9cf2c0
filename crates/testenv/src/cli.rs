//! Command-line interfaces of `testenv` and `testenv-mock`

use argh::FromArgs;

/// Start the servers described in a config, run a command against them,
/// then tear everything down
#[derive(FromArgs, Debug)]
pub struct TestenvArgs {
    /// path to the testenv config file
    #[argh(option, short = 'c')]
    pub config: String,

    /// check the config and print the start order without running anything
    #[argh(switch)]
    pub validate: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    /// command to run once all servers are ready (default: env)
    #[argh(positional, greedy)]
    pub command: Vec<String>,
}

/// Serve canned HTTP responses from a routes file
#[derive(FromArgs, Debug)]
pub struct MockArgs {
    /// path to the routes file
    #[argh(option)]
    pub config: String,

    /// address to listen on (ip:port)
    #[argh(option)]
    pub listen: String,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Normalize a `--log-level` value into an env_logger filter
pub fn log_filter(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<TestenvArgs, argh::EarlyExit> {
        TestenvArgs::from_args(&["testenv"], args)
    }

    #[test]
    fn test_command_is_collected() {
        let args = parse(&["--config", "env.yml", "pytest", "-x", "tests/"]).unwrap();
        assert_eq!(args.config, "env.yml");
        assert_eq!(args.command, vec!["pytest", "-x", "tests/"]);
        assert_eq!(args.log_level, "info");
        assert!(!args.validate);
    }

    #[test]
    fn test_separator_and_short_options() {
        let args = parse(&["-c", "env.yml", "-l", "debug", "--", "sh", "-c", "env"]).unwrap();
        assert_eq!(args.config, "env.yml");
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.command, vec!["sh", "-c", "env"]);
    }

    #[test]
    fn test_command_defaults_to_empty() {
        let args = parse(&["--config", "env.yml", "--validate"]).unwrap();
        assert!(args.command.is_empty());
        assert!(args.validate);
        assert!(parse(&["pytest"]).is_err());
    }

    #[test]
    fn test_mock_args() {
        let args = MockArgs::from_args(
            &["testenv-mock"],
            &["--config", "routes.yaml", "--listen", "127.0.0.1:8080"],
        )
        .unwrap();
        assert_eq!(args.listen, "127.0.0.1:8080");
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter("DEBUG"), "debug");
        assert_eq!(log_filter("warn"), "warn");
        assert_eq!(log_filter("verbose"), "info");
    }
}
