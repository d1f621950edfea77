// CLI argument parsing and definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "vm-backup")]
#[command(about = "Snapshot, export and prune virtual machine backups")]
#[command(version)]
pub struct Args {
    /// Path to the configuration file (defaults to VM_BACKUP_CONFIG or the standard locations)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let args = Args::parse_from(["vm-backup", "--config", "/etc/b.yaml", "-d"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/b.yaml")));
        assert!(args.debug);
    }

    #[test]
    fn rejects_subcommands() {
        assert!(Args::try_parse_from(["vm-backup", "run"]).is_err());
    }
}
