//! Layered configuration.
//!
//! Priority, lowest to highest: built-in defaults, `devito.toml` (in the
//! root, or `--config <path>`), `DEVITO_*` environment variables, flags.

use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devito_core::SourceMapMode;

use crate::cli::ServeArgs;
use crate::error::{ConfigError, Result};

/// Name of the configuration file looked up in the root.
pub const CONFIG_FILE: &str = "devito.toml";

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevitoConfig {
    /// Entry point, relative to the working directory.
    pub entry: PathBuf,
    /// Directory static files are served from.
    pub root: PathBuf,
    /// Common ancestor of every served file; `~` is the home directory.
    pub fs_root: PathBuf,
    pub host: String,
    pub port: u16,
    /// Serve one bundle (`true`) or every module separately.
    pub bundle: bool,
    pub inline_source_maps: bool,
    pub disable_source_maps: bool,
    /// Send caching headers; `false` sends `no-store` everywhere.
    pub cache: bool,
    /// Watch inputs and reload clients.
    pub watch: bool,
    /// Keep the browser console quiet.
    pub quiet: bool,
    pub debounce_ms: u64,
    /// Specifier to absolute file.
    pub alias: BTreeMap<String, PathBuf>,
    /// Analyzed up front in unbundled mode so the import map is complete.
    pub extra_analyze_paths: Vec<PathBuf>,
    /// esbuild binary.
    pub esbuild: PathBuf,
}

impl Default for DevitoConfig {
    fn default() -> Self {
        Self {
            entry: PathBuf::new(),
            root: PathBuf::from("."),
            fs_root: PathBuf::from("~"),
            host: "127.0.0.1".to_string(),
            port: 3000,
            bundle: true,
            inline_source_maps: false,
            disable_source_maps: false,
            cache: true,
            watch: true,
            quiet: false,
            debounce_ms: devito_core::DEFAULT_DEBOUNCE.as_millis() as u64,
            alias: BTreeMap::new(),
            extra_analyze_paths: Vec::new(),
            esbuild: PathBuf::from("esbuild"),
        }
    }
}

/// Flags that were actually given. Absent fields leave lower layers alone.
#[derive(Debug, Default, Serialize)]
struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fs_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bundle: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_source_maps: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_source_maps: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    watch: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quiet: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    alias: BTreeMap<String, PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_analyze_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    esbuild: Option<PathBuf>,
}

impl CliOverrides {
    fn from_args(args: &ServeArgs, quiet: bool) -> Self {
        let flag = |set: bool, value: bool| set.then_some(value);
        Self {
            entry: args.entry.clone(),
            root: args.root.clone(),
            fs_root: args.fs_root.clone(),
            host: args.host.clone(),
            port: args.port,
            bundle: flag(args.no_bundle, false),
            inline_source_maps: flag(args.inline_source_maps, true),
            disable_source_maps: flag(args.no_source_maps, true),
            cache: flag(args.no_cache, false),
            watch: flag(args.no_watch, false),
            quiet: flag(quiet, true),
            debounce_ms: args.debounce,
            alias: args.aliases.iter().cloned().collect(),
            extra_analyze_paths: args.extra_analyze_paths.clone(),
            esbuild: args.esbuild.clone(),
        }
    }
}

impl DevitoConfig {
    /// Load every layer and extract the result. Does not validate.
    pub fn load(args: &ServeArgs, quiet: bool) -> Result<Self> {
        let config = Self::figment(args, quiet)?
            .extract()
            .map_err(ConfigError::from)?;
        Ok(config)
    }

    /// The merged provider stack, for callers that add their own layers.
    pub fn figment(args: &ServeArgs, quiet: bool) -> Result<Figment> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = Self::config_file(args)? {
            tracing::debug!("loading {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        Ok(figment
            .merge(Env::prefixed("DEVITO_"))
            .merge(Serialized::defaults(CliOverrides::from_args(args, quiet))))
    }

    /// `--config` must exist; the implicit `devito.toml` is optional.
    fn config_file(args: &ServeArgs) -> Result<Option<PathBuf>> {
        if let Some(path) = &args.config {
            if !path.is_file() {
                return Err(ConfigError::NotFound(path.clone()).into());
            }
            return Ok(Some(path.clone()));
        }
        let root = args.root.clone().unwrap_or_else(|| PathBuf::from("."));
        let implicit = root.join(CONFIG_FILE);
        Ok(implicit.is_file().then_some(implicit))
    }

    /// Reject configurations that cannot be served.
    pub fn validate(&self) -> Result<()> {
        if self.entry.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "entry".to_string(),
                hint: "Pass an entry point, e.g. `devito dev src/index.ts`, or set `entry` in devito.toml"
                    .to_string(),
            }
            .into());
        }

        if self.debounce_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "debounce_ms".to_string(),
                value: "0".to_string(),
                hint: "Use a quiet period of at least 1ms".to_string(),
            }
            .into());
        }

        if self.inline_source_maps && self.disable_source_maps {
            return Err(ConfigError::ConflictingOptions(
                "inline_source_maps and disable_source_maps".to_string(),
            )
            .into());
        }

        for (specifier, target) in &self.alias {
            if !target.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    field: format!("alias.{specifier}"),
                    value: target.display().to_string(),
                    hint: "Alias targets must be absolute paths".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    pub fn entry_path(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.entry).clean()
    }

    pub fn root_path(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.root).clean()
    }

    /// `fs_root` with `~` expanded and made absolute.
    pub fn fs_root_path(&self, cwd: &Path) -> Result<PathBuf> {
        let home = home_dir();
        let expanded = expand_home(&self.fs_root, home.as_deref()).ok_or_else(|| {
            ConfigError::InvalidValue {
                field: "fs_root".to_string(),
                value: self.fs_root.display().to_string(),
                hint: "No home directory is known; set fs_root to an absolute path".to_string(),
            }
        })?;
        Ok(cwd.join(expanded).clean())
    }

    pub fn source_maps(&self) -> SourceMapMode {
        if self.disable_source_maps {
            SourceMapMode::Disabled
        } else if self.inline_source_maps {
            SourceMapMode::Inline
        } else {
            SourceMapMode::Linked
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// URL shown to the user for the port actually bound.
    pub fn url(&self, port: u16) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "localhost",
            host => host,
        };
        format!("http://{host}:{port}")
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Expand a leading `~`. `None` when the path needs a home that is unknown.
fn expand_home(path: &Path, home: Option<&Path>) -> Option<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => home.map(|home| home.join(rest)),
        Err(_) => Some(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args_in(dir: &TempDir) -> ServeArgs {
        ServeArgs {
            root: Some(dir.path().to_path_buf()),
            ..ServeArgs::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = DevitoConfig::default();
        assert_eq!(config.port, 3000);
        assert!(config.bundle);
        assert!(config.cache);
        assert!(config.watch);
        assert_eq!(config.debounce_ms, 200);
        assert_eq!(config.source_maps(), SourceMapMode::Linked);
        assert_eq!(config.esbuild, PathBuf::from("esbuild"));
    }

    #[test]
    fn test_file_then_flags() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "entry = \"src/main.ts\"\nport = 4000\nbundle = false\n\n[alias]\nreact = \"/opt/react.js\"\n",
        )
        .unwrap();

        let mut args = args_in(&dir);
        args.port = Some(5000);
        args.aliases = vec![("vue".to_string(), PathBuf::from("/opt/vue.js"))];

        let config = DevitoConfig::load(&args, false).unwrap();
        assert_eq!(config.entry, PathBuf::from("src/main.ts"));
        assert_eq!(config.port, 5000);
        assert!(!config.bundle);
        assert_eq!(config.alias.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unset_flags_keep_file_values() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "watch = false\ncache = false\n").unwrap();

        let config = DevitoConfig::load(&args_in(&dir), false).unwrap();
        assert!(!config.watch);
        assert!(!config.cache);
        assert!(config.bundle);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = TempDir::new().unwrap();
        let mut args = args_in(&dir);
        args.config = Some(dir.path().join("missing.toml"));

        let err = DevitoConfig::load(&args, false).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "prot = 1\n").unwrap();

        assert!(DevitoConfig::load(&args_in(&dir), false).is_err());
    }

    #[test]
    fn test_validate_requires_entry() {
        let err = DevitoConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("Missing required field: entry"));
    }

    #[test]
    fn test_validate_rejects_zero_debounce() {
        let config = DevitoConfig {
            entry: "a.ts".into(),
            debounce_ms: 0,
            ..DevitoConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("debounce_ms"));
    }

    #[test]
    fn test_validate_rejects_relative_alias() {
        let mut config = DevitoConfig {
            entry: "a.ts".into(),
            ..DevitoConfig::default()
        };
        config.alias.insert("lit".into(), "node_modules/lit/index.js".into());
        assert!(config.validate().unwrap_err().to_string().contains("alias.lit"));
    }

    #[test]
    fn test_validate_rejects_conflicting_source_maps() {
        let config = DevitoConfig {
            entry: "a.ts".into(),
            inline_source_maps: true,
            disable_source_maps: true,
            ..DevitoConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_home() {
        let home = Path::new("/home/dev");
        assert_eq!(
            expand_home(Path::new("~"), Some(home)),
            Some(PathBuf::from("/home/dev"))
        );
        assert_eq!(
            expand_home(Path::new("~/code"), Some(home)),
            Some(PathBuf::from("/home/dev/code"))
        );
        assert_eq!(
            expand_home(Path::new("/srv"), None),
            Some(PathBuf::from("/srv"))
        );
        assert_eq!(expand_home(Path::new("~"), None), None);
    }

    #[test]
    fn test_paths_resolve_against_cwd() {
        let config = DevitoConfig {
            entry: "src/../src/index.ts".into(),
            root: "public".into(),
            fs_root: "/work".into(),
            ..DevitoConfig::default()
        };
        let cwd = Path::new("/work/app");
        assert_eq!(config.entry_path(cwd), PathBuf::from("/work/app/src/index.ts"));
        assert_eq!(config.root_path(cwd), PathBuf::from("/work/app/public"));
        assert_eq!(config.fs_root_path(cwd).unwrap(), PathBuf::from("/work"));
    }

    #[test]
    fn test_url_for_wildcard_host() {
        let config = DevitoConfig {
            host: "0.0.0.0".into(),
            ..DevitoConfig::default()
        };
        assert_eq!(config.url(8080), "http://localhost:8080");
    }
}
