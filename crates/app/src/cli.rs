use anyhow::Result;
use clap::{Parser, Subcommand};
use vision::{MonitorCliArgs, RunOptions};

/// Watches each machine's camera, checks that every pair slot holds one oil
/// can and one bunk hole, and switches the pair's relay ON while it does not.
#[derive(Debug, Parser)]
#[command(name = "line-monitor", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    args: MonitorCliArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the monitor until Ctrl+C (default).
    Run {
        #[command(flatten)]
        args: MonitorCliArgs,
    },
    /// Pulse each configured machine's relays once and exit.
    TestRelays {
        #[command(flatten)]
        args: MonitorCliArgs,
    },
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Command::Run { args }) => vision::run(RunOptions::from(args)),
        Some(Command::TestRelays { args }) => vision::test_relays(RunOptions::from(args)),
        None => vision::run(RunOptions::from(cli.args)),
    }
}
