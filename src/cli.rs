//! CLI surface. The usage banner and `--help` text are treated as an
//! external collaborator, so the automatic help flag is disabled to free
//! up `-h` for the `have` override; `-V`/`--version` is clap's default.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gitup", version, disable_help_flag = true)]
pub struct Cli {
    /// Section name used to look up configuration.
    pub section: String,

    /// Override configuration file path.
    #[arg(short = 'C', value_name = "path")]
    pub config_path: Option<PathBuf>,

    /// Force a full clone.
    #[arg(short = 'c')]
    pub force_clone: bool,

    /// Display depth (0 = full path).
    #[arg(short = 'd', value_name = "n")]
    pub display_depth: Option<usize>,

    /// Override `have`.
    #[arg(short = 'h', value_name = "hex40")]
    pub have: Option<String>,

    /// Keep the fetched pack on disk.
    #[arg(short = 'k')]
    pub keep_pack: bool,

    /// Low-memory mode.
    #[arg(short = 'l')]
    pub low_memory: bool,

    /// Force repair.
    #[arg(short = 'r')]
    pub force_repair: bool,

    /// Fetch tag.
    #[arg(short = 't', value_name = "tag")]
    pub tag: Option<String>,

    /// Load pack from a local file instead of fetching.
    #[arg(short = 'u', value_name = "path")]
    pub local_pack: Option<PathBuf>,

    /// Verbosity 0-2.
    #[arg(short = 'v', value_name = "n", default_value_t = 0)]
    pub verbosity: u8,

    /// Override `want`.
    #[arg(short = 'w', value_name = "hex40")]
    pub want: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["gitup", "src"]);
        assert_eq!(cli.section, "src");
        assert_eq!(cli.verbosity, 0);
        assert!(!cli.force_clone);
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(["gitup", "-c", "-l", "-v", "2", "-d", "3", "src"]);
        assert_eq!(cli.section, "src");
        assert!(cli.force_clone);
        assert!(cli.low_memory);
        assert_eq!(cli.verbosity, 2);
        assert_eq!(cli.display_depth, Some(3));
    }
}
