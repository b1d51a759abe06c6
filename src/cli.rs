use crate::commands::{self, GlobalOptions};
use crate::logging;
use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "eventmetrics", version)]
#[command(
    about = "Queue and compute edit-a-thon statistics against wiki replicas",
    long_about = "eventmetrics queues statistics jobs for edit-a-thon events, dispatches them within the replica connection quota, and records new editors, pages created/improved and retention per event."
)]
#[command(arg_required_else_help = true)]
#[command(after_long_help = "Examples:
  eventmetrics import events.toml
  eventmetrics spawn --all
  eventmetrics spawn
  eventmetrics process 12
  eventmetrics stats 12
  eventmetrics completion zsh > ~/.zsh/completions/_eventmetrics")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to state DB (default: $XDG_STATE_HOME/eventmetrics/state.db)"
    )]
    state_db: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to config file (default: $XDG_CONFIG_HOME/eventmetrics/config.toml)"
    )]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Directory of per-wiki replica databases (overrides [replicas].dir)"
    )]
    replica_dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Append NDJSON dispatch records to file (overrides [dispatch].log)"
    )]
    log: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Import events from a TOML file",
        long_about = "Import events from a TOML file with one `[[events]]` table per event (title, start, end, timezone, wikis, participants)."
    )]
    #[command(arg_required_else_help = true)]
    Import {
        #[arg(value_name = "FILE", help = "TOML file with [[events]] tables")]
        file: PathBuf,
    },
    #[command(about = "Queue a statistics job for one event")]
    #[command(arg_required_else_help = true)]
    Enqueue {
        #[arg(value_name = "EVENT_ID", help = "Event to queue")]
        event: i64,
    },
    #[command(
        about = "Compute statistics for one event now",
        long_about = "Compute statistics for one event synchronously, without going through the dispatcher. The event's job, if any, is removed whether the run succeeds or fails. Exits 1 when the event does not exist."
    )]
    #[command(arg_required_else_help = true)]
    Process {
        #[arg(value_name = "EVENT_ID", help = "Event to process")]
        event: i64,
        #[arg(long, help = "Print the statistics as JSON")]
        json: bool,
    },
    #[command(
        about = "Dispatch queued jobs within the replica quota",
        long_about = "Dispatch queued jobs, oldest first, up to the available replica connection quota. Intended to run from cron."
    )]
    #[command(after_long_help = "Examples:
  eventmetrics spawn
  eventmetrics spawn --all
  eventmetrics spawn --all --no-spawn
  eventmetrics spawn --job 7")]
    Spawn {
        #[arg(long, help = "Queue jobs for every valid event without one first")]
        all: bool,
        #[arg(long, requires = "all", help = "With --all, only queue jobs")]
        no_spawn: bool,
        #[arg(
            long,
            value_name = "JOB_ID",
            conflicts_with = "all",
            help = "Run a single job"
        )]
        job: Option<i64>,
    },
    #[command(about = "List queued and running jobs")]
    Jobs,
    #[command(about = "Show stored statistics for an event")]
    #[command(arg_required_else_help = true)]
    Stats {
        #[arg(value_name = "EVENT_ID", help = "Event to inspect")]
        event: i64,
    },
    #[command(
        about = "Show available replica connection quota (busy jobs count as open connections)",
        long_about = "Show available replica connection quota. Open replica connections are not measured directly: every job marked busy in the state DB counts as one held connection, and the quota is the hard limit minus that count."
    )]
    Quota,
    #[command(
        about = "Generate shell completion script",
        long_about = "Generate shell completion script for your shell. Redirect output to your shell completion directory."
    )]
    #[command(arg_required_else_help = true)]
    Completion {
        #[arg(value_enum, value_name = "SHELL", help = "Target shell")]
        shell: Shell,
    },
    #[command(about = "Generate a man page")]
    Man {
        #[arg(
            long,
            value_name = "PATH",
            help = "Write man page to file (stdout when omitted)"
        )]
        output: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.global.verbose);
    let opts = GlobalOptions {
        state_db: cli.global.state_db,
        config: cli.global.config,
        replica_dir: cli.global.replica_dir,
        log: cli.global.log,
    };
    match cli.command {
        Commands::Import { file } => commands::import_events(opts, &file).map(|_| ()),
        Commands::Enqueue { event } => commands::enqueue_event(opts, event),
        Commands::Process { event, json } => commands::process_event(opts, event, json).map(|_| ()),
        Commands::Spawn { all, no_spawn, job } => commands::spawn_jobs(opts, all, no_spawn, job),
        Commands::Jobs => commands::list_jobs(opts),
        Commands::Stats { event } => commands::show_stats(opts, event),
        Commands::Quota => commands::show_quota(opts),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        Commands::Man { output } => {
            let man = clap_mangen::Man::new(Cli::command());
            match output {
                Some(path) => {
                    let mut bytes = Vec::new();
                    man.render(&mut bytes)?;
                    fs::write(path, bytes)?;
                }
                None => {
                    man.render(&mut io::stdout())?;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from([
            "eventmetrics",
            "process",
            "12",
            "--json",
            "--state-db",
            "/tmp/state.db",
        ])
        .unwrap();
        assert_eq!(cli.global.state_db, Some(PathBuf::from("/tmp/state.db")));
        assert!(matches!(
            cli.command,
            Commands::Process {
                event: 12,
                json: true
            }
        ));
    }

    #[test]
    fn quota_help_explains_connection_source() {
        let cmd = Cli::command();
        let quota = cmd
            .get_subcommands()
            .find(|sub| sub.get_name() == "quota")
            .unwrap();
        let about = quota.get_about().unwrap().to_string();
        assert!(about.contains("busy jobs count as open connections"));
    }

    #[test]
    fn no_spawn_requires_all() {
        assert!(Cli::try_parse_from(["eventmetrics", "spawn", "--no-spawn"]).is_err());
        assert!(Cli::try_parse_from(["eventmetrics", "spawn", "--all", "--job", "3"]).is_err());
    }
}
