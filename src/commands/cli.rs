use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use console::style;
use time::macros::format_description;
use time::OffsetDateTime;

use super::console::{ConsoleInteraction, TransferMonitor};
use super::transfer::Orchestrator;
use crate::core::compression::{FormatId, HandlerRegistry};
use crate::core::password::PasswordStore;
use crate::models::error::Result;
use crate::models::{AppConfig, ArchiveItem, CompressRequest, ExtractDestination, ExtractRequest, TransferOutcome};

/// Extract and create archives, trying remembered passwords automatically
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/ctxarc/config.json when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Password store to use instead of the configured one
    #[arg(long, global = true)]
    pub password_file: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Enable keyboard controls while streaming: p/space pause, q/Esc cancel
    #[arg(long, default_value_t = false, global = true)]
    pub controls: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract an archive into a folder named after it.
    /// Files written before a failure or cancel are left in place.
    Extract {
        archive: PathBuf,

        /// Extract next to the archive instead of into a subfolder
        #[arg(long, default_value_t = false, conflicts_with = "to")]
        here: bool,

        /// Extract into this directory
        #[arg(long)]
        to: Option<PathBuf>,

        /// Overwrite existing files without asking
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },

    /// Compress files and directories into a new archive
    Compress {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Archive format: 7z, zip, tar or tgz
        #[arg(short, long, value_parser = parse_format)]
        format: Option<FormatId>,

        /// Output archive path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the items of an archive
    List { archive: PathBuf },

    /// Verify every item of an archive decodes cleanly
    Test { archive: PathBuf },

    /// Show the remembered passwords, most used first
    Passwords {
        /// Print passwords in clear text
        #[arg(long, default_value_t = false)]
        show: bool,
    },
}

fn parse_format(value: &str) -> std::result::Result<FormatId, String> {
    FormatId::from_name(value).ok_or_else(|| format!("unknown archive format: {}", value))
}

/// Run one parsed command line
pub fn execute(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let mut orchestrator = match &cli.password_file {
        Some(path) => Orchestrator::new(
            Arc::new(HandlerRegistry::new()),
            PasswordStore::open(path),
            config,
        ),
        None => Orchestrator::from_config(config),
    };

    match cli.command {
        Command::Extract { archive, here, to, yes } => {
            let destination = match (here, to) {
                (_, Some(dir)) => ExtractDestination::Explicit(dir),
                (true, None) => ExtractDestination::Here,
                (false, None) => ExtractDestination::Subfolder,
            };
            let mut request = ExtractRequest::new(&archive, destination);
            request.overwrite = yes;

            let tracker = orchestrator.tracker();
            let mut interaction =
                ConsoleInteraction::new(yes).with_monitor(Arc::clone(&tracker), "Extracting", cli.controls);
            let outcome = orchestrator.extract(&request, &mut interaction, &tracker);
            interaction.finish_monitor();
            report(outcome?);
        }
        Command::Compress { paths, format, output } => {
            let request = CompressRequest {
                sources: paths,
                output,
                format,
            };
            let tracker = orchestrator.tracker();
            let monitor = TransferMonitor::start(Arc::clone(&tracker), "Compressing", cli.controls);
            let outcome = orchestrator.compress(&request, &tracker);
            monitor.finish();
            report(outcome?);
        }
        Command::List { archive } => {
            let items = orchestrator.list(&archive)?;
            print_items(&items);
        }
        Command::Test { archive } => {
            let tracker = orchestrator.tracker();
            let mut interaction =
                ConsoleInteraction::new(false).with_monitor(Arc::clone(&tracker), "Testing", cli.controls);
            let outcome = orchestrator.test(&archive, &mut interaction, &tracker);
            interaction.finish_monitor();
            report(outcome?);
        }
        Command::Passwords { show } => {
            let store = orchestrator.store();
            println!("{}", style(store.path().display()).dim());
            for entry in store.entries() {
                let shown = if show {
                    entry.password.clone()
                } else {
                    "*".repeat(entry.password.chars().count().min(12))
                };
                println!("{:>6}  {}", entry.usage_count, shown);
            }
        }
    }
    Ok(())
}

fn report(outcome: TransferOutcome) {
    match outcome {
        TransferOutcome::Completed { path, bytes, .. } => println!(
            "{} {} ({})",
            style("✓").green().bold(),
            style(path.display()).green(),
            indicatif::HumanBytes(bytes)
        ),
        TransferOutcome::Cancelled => println!("{} cancelled", style("✗").yellow().bold()),
        TransferOutcome::Skipped => println!("{} skipped, nothing was overwritten", style("-").dim()),
    }
}

fn print_items(items: &[ArchiveItem]) {
    let stamp = format_description!("[year]-[month]-[day] [hour]:[minute]");
    let mut files = 0usize;
    let mut total = 0u64;

    for item in items {
        let modified = item
            .modified
            .and_then(|t| OffsetDateTime::from(t).format(stamp).ok())
            .unwrap_or_else(|| " ".repeat(16));
        let kind = match (item.is_dir, item.is_encrypted) {
            (true, _) => "D",
            (false, true) => "*",
            (false, false) => " ",
        };
        println!("{} {:>12} {} {}", modified, item.size, kind, item.path);
        if !item.is_dir {
            files += 1;
            total += item.size;
        }
    }
    println!("{}", style(format!("{} file(s), {}", files, indicatif::HumanBytes(total))).dim());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extract() {
        let cli = Cli::try_parse_from(["ctxarc", "extract", "a.7z", "--to", "/tmp/x", "-y"]).unwrap();
        match cli.command {
            Command::Extract { archive, here, to, yes } => {
                assert_eq!(archive, PathBuf::from("a.7z"));
                assert!(!here);
                assert_eq!(to, Some(PathBuf::from("/tmp/x")));
                assert!(yes);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_here_conflicts_with_to() {
        assert!(Cli::try_parse_from(["ctxarc", "extract", "a.7z", "--here", "--to", "x"]).is_err());
    }

    #[test]
    fn test_parse_compress_format() {
        let cli = Cli::try_parse_from(["ctxarc", "-vv", "compress", "a", "b", "--format", "tgz"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Compress { paths, format, output } => {
                assert_eq!(paths.len(), 2);
                assert_eq!(format, Some(FormatId::TarGz));
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Cli::try_parse_from(["ctxarc", "compress", "a", "--format", "rar"]).is_err());
        assert!(Cli::try_parse_from(["ctxarc", "compress"]).is_err());
    }
}
