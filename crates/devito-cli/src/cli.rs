//! Command-line interface definition.
//!
//! - `devito dev <ENTRY>` - serve an entry point with live reload
//! - `devito check` - load and validate configuration without serving

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// devito - dev server for ES modules with live reload
#[derive(Parser, Debug)]
#[command(
    name = "devito",
    version,
    about = "Dev server for ES modules with live reload",
    long_about = "devito serves a JavaScript/TypeScript entry point to the browser.\n\
                  Bundles are rebuilt incrementally when their inputs change and\n\
                  connected pages reload through a Server-Sent Events channel."
)]
pub struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the development server
    ///
    /// Builds the entry point, serves it over HTTP and rebuilds whenever a
    /// file it was built from changes.
    Dev(DevArgs),

    /// Validate configuration
    ///
    /// Loads devito.toml, DEVITO_* variables and flags exactly like `dev`
    /// would and prints the result.
    Check(CheckArgs),
}

/// Options shared by `dev` and `check`.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Entry point file
    ///
    /// Suffixes and `index` files are tried when the path has no extension,
    /// e.g. `src` resolves to `src/index.ts`.
    #[arg(value_name = "ENTRY")]
    pub entry: Option<PathBuf>,

    /// Root directory for static files
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Common ancestor of every served file, exposed under /@fs/
    ///
    /// Defaults to the home directory.
    #[arg(long, alias = "homedir", value_name = "DIR")]
    pub fs_root: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Serve every module separately instead of one bundle
    #[arg(long)]
    pub no_bundle: bool,

    /// Embed source maps in the bundle
    #[arg(long, conflicts_with = "no_source_maps")]
    pub inline_source_maps: bool,

    /// Do not emit source maps
    #[arg(long)]
    pub no_source_maps: bool,

    /// Send `cache-control: no-store` on every response
    #[arg(long)]
    pub no_cache: bool,

    /// Do not watch inputs or reload clients
    #[arg(long)]
    pub no_watch: bool,

    /// Quiet period before a burst of changes triggers a rebuild
    #[arg(long, value_name = "MS")]
    pub debounce: Option<u64>,

    /// Map an import specifier to a file, e.g. `--alias react=/abs/react.js`
    #[arg(long = "alias", value_name = "SPEC=PATH", value_parser = parse_alias)]
    pub aliases: Vec<(String, PathBuf)>,

    /// Extra files whose imports are analyzed up front in unbundled mode
    #[arg(long = "analyze", value_name = "PATH")]
    pub extra_analyze_paths: Vec<PathBuf>,

    /// esbuild binary to run
    #[arg(long, value_name = "PATH")]
    pub esbuild: Option<PathBuf>,

    /// Configuration file (default: devito.toml in the root)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DevArgs {
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub serve: ServeArgs,

    /// Print the resolved configuration as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse `SPEC=PATH`.
pub fn parse_alias(value: &str) -> Result<(String, PathBuf), String> {
    let (spec, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SPEC=PATH, got '{value}'"))?;
    if spec.is_empty() || path.is_empty() {
        return Err(format!("expected SPEC=PATH, got '{value}'"));
    }
    Ok((spec.to_string(), PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_dev_with_flags() {
        let cli = Cli::try_parse_from([
            "devito",
            "dev",
            "src/index.ts",
            "--port",
            "4000",
            "--no-bundle",
            "--alias",
            "react=/opt/react.js",
            "--alias",
            "vue=/opt/vue.js",
        ])
        .unwrap();

        let Command::Dev(args) = cli.command else {
            panic!("expected dev");
        };
        assert_eq!(args.serve.entry, Some(PathBuf::from("src/index.ts")));
        assert_eq!(args.serve.port, Some(4000));
        assert!(args.serve.no_bundle);
        assert_eq!(args.serve.aliases.len(), 2);
        assert_eq!(args.serve.aliases[0].0, "react");
    }

    #[test]
    fn test_homedir_alias() {
        let cli = Cli::try_parse_from(["devito", "dev", "a.ts", "--homedir", "/work"]).unwrap();
        let Command::Dev(args) = cli.command else {
            panic!("expected dev");
        };
        assert_eq!(args.serve.fs_root, Some(PathBuf::from("/work")));
    }

    #[test]
    fn test_source_map_flags_conflict() {
        let result = Cli::try_parse_from([
            "devito",
            "dev",
            "a.ts",
            "--inline-source-maps",
            "--no-source-maps",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_alias() {
        assert_eq!(
            parse_alias("lit=/x/lit.js").unwrap(),
            ("lit".to_string(), PathBuf::from("/x/lit.js"))
        );
        assert!(parse_alias("lit").is_err());
        assert!(parse_alias("=/x").is_err());
    }
}
