//! esbuild as the [`Compiler`] collaborator.
//!
//! Bundles are written into a temporary directory together with a metafile;
//! every emitted file is read back as an output and the metafile's inputs
//! become the watch set. Single-file transforms go through stdin/stdout.

use async_trait::async_trait;
use path_clean::PathClean;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use devito_core::{CompileFailure, CompileOutput, CompileRequest, Compiler, Diagnostic, SourceMapMode};
use devito_graph::{AliasTable, FS_PREFIX};

const METAFILE: &str = "meta.json";

static ERROR_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:✘|X|×)\s+\[ERROR\]\s+(.+)$").ok());
static LOCATION_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s+(\S.*?):(\d+):(\d+):\s*$").ok());

/// Runs the `esbuild` binary.
#[derive(Debug, Clone)]
pub struct EsbuildCompiler {
    binary: PathBuf,
    fs_root: PathBuf,
    aliases: AliasTable,
}

impl EsbuildCompiler {
    pub fn new(binary: impl Into<PathBuf>, fs_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            fs_root: fs_root.into(),
            aliases: AliasTable::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    async fn bundle(&self, request: &CompileRequest) -> Result<CompileOutput, CompileFailure> {
        let outdir = tempfile::Builder::new()
            .prefix("devito-")
            .tempdir()
            .map_err(|e| CompileFailure::new(format!("failed to create output directory: {e}")))?;
        let cwd = working_dir(request, &self.fs_root);

        let args = bundle_args(request, outdir.path(), &self.aliases);
        let stdout = self.run(&cwd, args, request.entry_source.as_deref()).await?;
        if !stdout.is_empty() {
            tracing::debug!("esbuild: {}", String::from_utf8_lossy(&stdout).trim());
        }

        let metafile = tokio::fs::read(outdir.path().join(METAFILE))
            .await
            .map_err(|e| CompileFailure::new(format!("esbuild wrote no metafile: {e}")))?;
        let inputs = parse_metafile_inputs(&metafile, &cwd, &request.entry)?;

        let mut outputs = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(outdir.path())
            .await
            .map_err(|e| CompileFailure::new(format!("failed to read esbuild output: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CompileFailure::new(format!("failed to read esbuild output: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == METAFILE {
                continue;
            }
            let mut bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| CompileFailure::new(format!("failed to read {name}: {e}")))?;
            if name.ends_with(".map") {
                bytes = rewrite_map_sources(&bytes, outdir.path(), &self.fs_root);
            }
            outputs.insert(format!("/{name}"), bytes);
        }

        Ok(CompileOutput { outputs, inputs })
    }

    async fn transform(&self, request: &CompileRequest) -> Result<CompileOutput, CompileFailure> {
        let cwd = working_dir(request, &self.fs_root);
        let js = self
            .run(&cwd, transform_args(request), request.entry_source.as_deref())
            .await?;

        let mut outputs = BTreeMap::new();
        outputs.insert(format!("/{}.js", request.output_name), js);
        Ok(CompileOutput {
            outputs,
            inputs: vec![request.entry.clone()],
        })
    }

    /// Run esbuild and return its stdout, or the parsed failure.
    async fn run(
        &self,
        cwd: &Path,
        args: Vec<String>,
        stdin: Option<&str>,
    ) -> Result<Vec<u8>, CompileFailure> {
        tracing::debug!("{} {}", self.binary.display(), args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(cwd)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CompileFailure::new(format!(
                    "failed to run esbuild at '{}': {e}; install esbuild or pass --esbuild <path>",
                    self.binary.display()
                ))
            })?;

        if let (Some(source), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(source.as_bytes())
                .await
                .map_err(|e| CompileFailure::new(format!("failed to write to esbuild: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CompileFailure::new(format!("esbuild did not finish: {e}")))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(parse_failure(&stderr, output.status.code()))
        }
    }
}

#[async_trait]
impl Compiler for EsbuildCompiler {
    async fn compile(&self, request: CompileRequest) -> Result<CompileOutput, CompileFailure> {
        if request.bundle {
            self.bundle(&request).await
        } else {
            self.transform(&request).await
        }
    }
}

/// Relative imports of stdin input resolve against the entry's directory.
fn working_dir(request: &CompileRequest, fs_root: &Path) -> PathBuf {
    request
        .entry
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| fs_root.to_path_buf())
}

fn bundle_args(request: &CompileRequest, outdir: &Path, aliases: &AliasTable) -> Vec<String> {
    let mut args = Vec::new();
    if request.entry_source.is_some() {
        args.extend(stdin_args(&request.entry));
    } else {
        args.push(request.entry.display().to_string());
    }
    args.push("--bundle".to_string());
    args.push("--format=esm".to_string());
    args.push(format!(
        "--outfile={}",
        outdir.join(format!("{}.js", request.output_name)).display()
    ));
    args.push(format!("--metafile={}", outdir.join(METAFILE).display()));
    args.extend(source_map_args(request.source_maps));
    args.push(format!("--source-root=/{FS_PREFIX}"));
    for (specifier, target) in aliases {
        args.push(format!("--alias:{}={}", specifier, target.display()));
    }
    args.extend(common_args());
    args
}

fn transform_args(request: &CompileRequest) -> Vec<String> {
    let mut args = stdin_args(&request.entry);
    args.push("--format=esm".to_string());
    args.extend(source_map_args(request.source_maps));
    args.extend(common_args());
    args
}

fn stdin_args(entry: &Path) -> Vec<String> {
    vec![
        format!("--sourcefile={}", entry.display()),
        format!("--loader={}", loader_for(entry)),
    ]
}

fn source_map_args(mode: SourceMapMode) -> Option<String> {
    match mode {
        SourceMapMode::Linked => Some("--sourcemap".to_string()),
        SourceMapMode::Inline => Some("--sourcemap=inline".to_string()),
        SourceMapMode::Disabled => None,
    }
}

fn common_args() -> [String; 2] {
    ["--log-level=error".to_string(), "--color=false".to_string()]
}

/// esbuild loader by extension.
fn loader_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()).unwrap_or_default() {
        "ts" | "mts" | "cts" => "ts",
        "tsx" | "mtsx" => "tsx",
        "jsx" | "mjsx" => "jsx",
        "css" => "css",
        "json" => "json",
        _ => "js",
    }
}

#[derive(Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, serde_json::Value>,
}

/// Absolute paths of the files esbuild read. Input keys are relative to the
/// working directory; `<stdin>` is the entry.
fn parse_metafile_inputs(
    bytes: &[u8],
    cwd: &Path,
    entry: &Path,
) -> Result<Vec<PathBuf>, CompileFailure> {
    let metafile: Metafile = serde_json::from_slice(bytes)
        .map_err(|e| CompileFailure::new(format!("invalid esbuild metafile: {e}")))?;

    let mut inputs = Vec::with_capacity(metafile.inputs.len());
    for key in metafile.inputs.keys() {
        if key == "<stdin>" {
            inputs.push(entry.to_path_buf());
        } else if key.starts_with('<') || has_namespace(key) {
            continue;
        } else {
            inputs.push(cwd.join(key).clean());
        }
    }
    inputs.sort();
    inputs.dedup();
    Ok(inputs)
}

/// Plugin namespaces appear as `ns:path`. Windows drive letters do not count.
fn has_namespace(key: &str) -> bool {
    match key.split_once(':') {
        Some((ns, _)) => ns.len() > 1 && !ns.contains(['/', '\\']),
        None => false,
    }
}

/// Make source-map `sources` relative to `fs_root` so that, combined with the
/// `/@fs` source root, they point at the served originals.
fn rewrite_map_sources(bytes: &[u8], outdir: &Path, fs_root: &Path) -> Vec<u8> {
    let Ok(mut map) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return bytes.to_vec();
    };
    let Some(sources) = map.get_mut("sources").and_then(|s| s.as_array_mut()) else {
        return bytes.to_vec();
    };

    for source in sources.iter_mut() {
        let Some(rel) = source.as_str() else {
            continue;
        };
        let absolute = outdir.join(rel).clean();
        if let Ok(stripped) = absolute.strip_prefix(fs_root) {
            let slashed = stripped
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            *source = serde_json::Value::String(slashed);
        }
    }

    serde_json::to_vec(&map).unwrap_or_else(|_| bytes.to_vec())
}

/// Turn esbuild's stderr into a failure with one diagnostic per error.
fn parse_failure(stderr: &str, code: Option<i32>) -> CompileFailure {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let (Some(error_line), Some(location_line)) = (ERROR_LINE.as_ref(), LOCATION_LINE.as_ref())
    else {
        return CompileFailure::new(stderr.trim());
    };

    for line in stderr.lines() {
        if let Some(caps) = error_line.captures(line) {
            diagnostics.push(Diagnostic {
                file: None,
                line: None,
                column: None,
                text: caps[1].trim().to_string(),
            });
        } else if let Some(caps) = location_line.captures(line) {
            if let Some(last) = diagnostics.last_mut().filter(|d| d.file.is_none()) {
                last.file = Some(caps[1].to_string());
                last.line = caps[2].parse().ok();
                last.column = caps[3].parse().ok();
            }
        }
    }

    let message = match diagnostics.len() {
        0 => {
            let trimmed = stderr.trim();
            if trimmed.is_empty() {
                match code {
                    Some(code) => format!("esbuild exited with status {code}"),
                    None => "esbuild was terminated".to_string(),
                }
            } else {
                trimmed.to_string()
            }
        }
        1 => "Build failed with 1 error".to_string(),
        n => format!("Build failed with {n} errors"),
    };

    CompileFailure {
        message,
        diagnostics,
    }
}
