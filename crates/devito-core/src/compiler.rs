//! The compiler collaborator.
//!
//! The coordinator treats the bundler/transpiler as an opaque async
//! function: an entry goes in, output files and the list of inputs it read
//! come out.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;

use crate::error::CompileFailure;

/// How source maps are emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceMapMode {
    /// Separate `.map` files.
    #[default]
    Linked,
    /// Embedded as a data URL.
    Inline,
    /// No source maps.
    Disabled,
}

/// One compile invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub entry: PathBuf,
    /// In-memory contents for `entry`, passed instead of reading the file.
    pub entry_source: Option<String>,
    /// Bundle the whole graph (`true`) or transpile one file (`false`).
    pub bundle: bool,
    pub source_maps: SourceMapMode,
    /// Base name of bundled outputs, e.g. `bundle` for `/bundle.js`.
    pub output_name: String,
}

impl CompileRequest {
    pub fn bundle(entry: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            entry_source: None,
            bundle: true,
            source_maps: SourceMapMode::default(),
            output_name: "bundle".to_string(),
        }
    }

    /// Single-file transpile of already-rewritten source.
    pub fn transform(entry: impl Into<PathBuf>, source: String) -> Self {
        Self {
            entry: entry.into(),
            entry_source: Some(source),
            bundle: false,
            source_maps: SourceMapMode::Inline,
            output_name: "out".to_string(),
        }
    }

    pub fn with_source_maps(mut self, mode: SourceMapMode) -> Self {
        self.source_maps = mode;
        self
    }

    pub fn with_entry_source(mut self, source: Option<String>) -> Self {
        self.entry_source = source;
        self
    }
}

/// What a successful compile produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutput {
    /// Output path to bytes, e.g. `/bundle.js`.
    pub outputs: BTreeMap<String, Vec<u8>>,
    /// Absolute paths of every file the compiler read.
    pub inputs: Vec<PathBuf>,
}

impl CompileOutput {
    /// Main JavaScript output of a single-file transform.
    pub fn primary_js(&self) -> Option<&[u8]> {
        self.outputs
            .iter()
            .find(|(path, _)| path.ends_with(".js"))
            .map(|(_, bytes)| bytes.as_slice())
    }
}

/// Source-to-JavaScript compiler.
#[async_trait]
pub trait Compiler: Send + Sync + Debug {
    async fn compile(&self, request: CompileRequest) -> Result<CompileOutput, CompileFailure>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    //! A compiler whose results are scripted by the test.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Responder = Box<dyn Fn(&CompileRequest) -> Result<CompileOutput, CompileFailure> + Send + Sync>;

    /// Compiler that answers from a script, optionally after a delay.
    ///
    /// Queued responses are used first, in order; once the queue is empty
    /// the fallback responder answers.
    pub struct ScriptedCompiler {
        queue: Mutex<VecDeque<(Duration, Result<CompileOutput, CompileFailure>)>>,
        fallback: Responder,
        calls: AtomicUsize,
        requests: Mutex<Vec<CompileRequest>>,
    }

    impl Debug for ScriptedCompiler {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedCompiler")
                .field("calls", &self.calls.load(Ordering::SeqCst))
                .finish()
        }
    }

    impl ScriptedCompiler {
        pub fn new(
            fallback: impl Fn(&CompileRequest) -> Result<CompileOutput, CompileFailure> + Send + Sync + 'static,
        ) -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                fallback: Box::new(fallback),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Queue one response, delivered after `delay`.
        pub fn push(&self, delay: Duration, result: Result<CompileOutput, CompileFailure>) {
            self.queue.lock().push_back((delay, result));
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<CompileRequest> {
            self.requests.lock().clone()
        }
    }

    /// Output with a single `/bundle.js` and the given inputs.
    pub fn bundle_output(js: &str, inputs: &[&str]) -> CompileOutput {
        let mut outputs = BTreeMap::new();
        outputs.insert("/bundle.js".to_string(), js.as_bytes().to_vec());
        CompileOutput {
            outputs,
            inputs: inputs.iter().map(PathBuf::from).collect(),
        }
    }

    #[async_trait]
    impl Compiler for ScriptedCompiler {
        async fn compile(&self, request: CompileRequest) -> Result<CompileOutput, CompileFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            let scripted = self.queue.lock().pop_front();
            match scripted {
                Some((delay, result)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    result
                }
                None => (self.fallback)(&request),
            }
        }
    }
}
