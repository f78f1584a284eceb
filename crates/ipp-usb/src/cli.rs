//! Command-line interface: `ipp-usb {standalone|udev|debug|check} [-bg]`.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ipp-usb", about = "IPP-over-USB to HTTP proxy daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run as a normal, long-lived daemon.
    Standalone(ModeArgs),

    /// Run under udev, exiting once no IPP-USB device remains plugged in.
    Udev(ModeArgs),

    /// Like `standalone`, with verbose console tracing forced on.
    Debug(ModeArgs),

    /// Validate the configuration and quirks files, then exit.
    Check,
}

#[derive(Debug, Clone, Copy, Default, clap::Args)]
pub struct ModeArgs {
    /// Detach from the controlling terminal after startup.
    #[arg(short = 'b', long = "bg")]
    pub background: bool,
}

impl Command {
    pub fn mode_args(&self) -> Option<ModeArgs> {
        match self {
            Command::Standalone(args) | Command::Udev(args) | Command::Debug(args) => Some(*args),
            Command::Check => None,
        }
    }

    /// `udev` mode exits once idle; the others run until signaled.
    pub fn exit_when_idle(&self) -> bool {
        matches!(self, Command::Udev(_))
    }

    pub fn forces_debug_logging(&self) -> bool {
        matches!(self, Command::Debug(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udev_exits_when_idle_others_do_not() {
        assert!(Command::Udev(ModeArgs::default()).exit_when_idle());
        assert!(!Command::Standalone(ModeArgs::default()).exit_when_idle());
        assert!(!Command::Debug(ModeArgs::default()).exit_when_idle());
        assert!(!Command::Check.exit_when_idle());
    }

    #[test]
    fn parses_standalone_with_background_flag() {
        let cli = Cli::parse_from(["ipp-usb", "standalone", "-b"]);
        match cli.command {
            Command::Standalone(args) => assert!(args.background),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_check_with_no_args() {
        let cli = Cli::parse_from(["ipp-usb", "check"]);
        assert!(matches!(cli.command, Command::Check));
    }
}
