use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cidrwatch",
    version,
    about = "Cluster HTTP access-log traffic into CIDR ranges and ban repeat offenders"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// One-shot analysis of an access-log file
    Static(StaticArgs),
    /// Long-running server fed by framed log shippers
    Live(LiveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Jail state file (YAML)
    #[arg(long = "jailFile")]
    pub jail_file: Option<PathBuf>,

    /// Ban output file, one CIDR per line
    #[arg(long = "banFile")]
    pub ban_file: Option<PathBuf>,

    /// IP whitelist file: matching traffic is excluded from analysis
    #[arg(long)]
    pub whitelist: Option<PathBuf>,

    /// IP blacklist file: when given, only matching traffic is analyzed
    #[arg(long)]
    pub blacklist: Option<PathBuf>,

    /// Detection recipe "min,minDepth,maxDepth,threshold"; repeatable
    #[arg(long = "clusterArgSets")]
    pub cluster_arg_sets: Vec<String>,

    /// Ignore requests before this RFC-3339 instant
    #[arg(long = "startTime")]
    pub start_time: Option<DateTime<Utc>>,

    /// Ignore requests after this RFC-3339 instant
    #[arg(long = "endTime")]
    pub end_time: Option<DateTime<Utc>>,

    /// Analyze only requests whose user-agent matches
    #[arg(long = "useragentRegex")]
    pub useragent_regex: Option<String>,

    /// Analyze only requests whose URI matches
    #[arg(long = "endpointRegex")]
    pub endpoint_regex: Option<String>,

    /// Restrict analysis to these CIDR ranges; repeatable
    #[arg(long = "rangesCidr")]
    pub ranges_cidr: Vec<String>,

    /// Plain-text table output (the default)
    #[arg(long, group = "output")]
    pub plain: bool,

    /// One line per detected range
    #[arg(long, group = "output")]
    pub compact: bool,

    /// Interactive terminal UI
    #[arg(long, group = "output")]
    pub tui: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StaticArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Access-log file to analyze
    #[arg(long)]
    pub logfile: PathBuf,

    /// Positional log format template
    #[arg(long = "logFormat")]
    pub log_format: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct LiveArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// TCP port for the log-shipping server
    #[arg(long)]
    pub port: Option<u16>,

    /// Sliding window maximum age, in seconds
    #[arg(long = "slidingWindowMaxTime")]
    pub sliding_window_max_time: Option<u64>,

    /// Sliding window maximum request count
    #[arg(long = "slidingWindowMaxSize")]
    pub sliding_window_max_size: Option<usize>,

    /// Positional log format template
    #[arg(long = "logFormat")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "cidrwatch",
            "static",
            "--logfile",
            "/var/log/access.log",
            "--clusterArgSets",
            "100,8,32,0.1",
            "--clusterArgSets",
            "1000,0,24,0.25",
            "--jailFile",
            "/tmp/jail.yaml",
            "--compact",
        ])
        .unwrap();

        match cli.command {
            Command::Static(args) => {
                assert_eq!(args.logfile, PathBuf::from("/var/log/access.log"));
                assert_eq!(args.common.cluster_arg_sets.len(), 2);
                assert!(args.common.compact);
                assert!(!args.common.plain);
            }
            _ => panic!("expected static subcommand"),
        }
    }

    #[test]
    fn live_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "cidrwatch",
            "live",
            "--port",
            "5044",
            "--slidingWindowMaxTime",
            "600",
            "--slidingWindowMaxSize",
            "50000",
            "--clusterArgSets",
            "100,8,32,0.1",
        ])
        .unwrap();

        match cli.command {
            Command::Live(args) => {
                assert_eq!(args.port, Some(5044));
                assert_eq!(args.sliding_window_max_time, Some(600));
                assert_eq!(args.sliding_window_max_size, Some(50000));
            }
            _ => panic!("expected live subcommand"),
        }
    }

    #[test]
    fn output_modes_are_exclusive() {
        assert!(Cli::try_parse_from([
            "cidrwatch",
            "static",
            "--logfile",
            "a.log",
            "--plain",
            "--tui",
        ])
        .is_err());
    }

    #[test]
    fn time_flags_parse_rfc3339() {
        let cli = Cli::try_parse_from([
            "cidrwatch",
            "static",
            "--logfile",
            "a.log",
            "--startTime",
            "2025-06-01T00:00:00Z",
            "--endTime",
            "2025-06-02T00:00:00Z",
        ])
        .unwrap();

        match cli.command {
            Command::Static(args) => {
                assert!(args.common.start_time.unwrap() < args.common.end_time.unwrap());
            }
            _ => panic!("expected static subcommand"),
        }
    }
}
