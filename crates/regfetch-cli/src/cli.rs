use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Fetch manifests, tags and blobs from OCI and Docker registries",
    arg_required_else_help = true
)]
pub struct Args {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit log events as JSON
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Disable coloured output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Registry to talk to, by name (defaults to `default_registry`)
    #[arg(short, long, global = true)]
    pub registry: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch and print a manifest
    #[command(arg_required_else_help = true)]
    Manifest {
        /// Image reference: repo, repo:tag, repo@digest or repo:tag@digest
        reference: String,

        /// Resolve an index to the manifest for the configured platform
        #[arg(long)]
        resolve: bool,

        /// Print the manifest bytes exactly as served
        #[arg(long)]
        raw: bool,
    },

    /// List the tags of a repository
    #[command(arg_required_else_help = true)]
    Tags {
        repository: String,

        /// Page size
        #[arg(short = 'n', long)]
        page_size: Option<u32>,

        /// Start after this tag
        #[arg(long, conflicts_with = "all")]
        last: Option<String>,

        /// Walk every page
        #[arg(short, long)]
        all: bool,
    },

    /// Fetch a blob into a file
    #[command(arg_required_else_help = true)]
    Blob {
        repository: String,

        digest: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Expected size in bytes
        #[arg(long)]
        size: Option<u64>,

        /// Only fetch the byte range START-END (END is inclusive and optional)
        #[arg(long, conflicts_with = "size")]
        range: Option<String>,
    },

    /// Check whether a blob or manifest exists
    #[command(arg_required_else_help = true)]
    Head {
        repository: String,

        /// Blob digest, or a tag or digest with --manifest
        reference: String,

        /// Probe a manifest instead of a blob
        #[arg(short, long)]
        manifest: bool,
    },

    /// Fetch an image's manifest, config and layers into a directory
    #[command(arg_required_else_help = true)]
    Pull {
        reference: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Generate a default configuration file
    #[command(name = "defconfig")]
    DefConfig,

    /// Print the paths and registry in use
    Env,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "regfetch", "tags", "library/alpine", "-n", "10", "-vv", "--registry", "ghcr",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.registry.as_deref(), Some("ghcr"));
        assert!(matches!(
            args.command,
            Commands::Tags {
                page_size: Some(10),
                all: false,
                ..
            }
        ));
    }

    #[test]
    fn test_conflicting_flags() {
        assert!(Args::try_parse_from(["regfetch", "-q", "-v", "env"]).is_err());
        assert!(
            Args::try_parse_from(["regfetch", "tags", "app", "--all", "--last", "v1"]).is_err()
        );
    }
}
