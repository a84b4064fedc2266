//! External compiler invocation
//!
//! Programs given as sources are compiled by a clang-style subprocess
//! before loading. In-memory sources are first written to a temporary
//! directory that lives until the binary has been loaded.

use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// Environment variable naming the compiler executable.
pub const ENV_COMPILER: &str = "PIM_COMPILER";

/// Target triple passed to the compiler by default.
pub const DEFAULT_TARGET: &str = "dpu-upmem-dpurte";

/// Name of the binary produced from sources.
pub const DEFAULT_OUTPUT: &str = "main.dpu";

/// Optimization level flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
    Oz,
}

impl OptLevel {
    pub const fn flag(self) -> &'static str {
        match self {
            OptLevel::O0 => "-O0",
            OptLevel::O1 => "-O1",
            OptLevel::O2 => "-O2",
            OptLevel::O3 => "-O3",
            OptLevel::Os => "-Os",
            OptLevel::Oz => "-Oz",
        }
    }
}

/// One compilation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileRequest {
    pub sources: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub includes: Vec<PathBuf>,
    /// `-D name` when the value is `None`, `-D name=value` otherwise
    pub defines: Vec<(String, Option<String>)>,
    /// Extra arguments placed after the sources
    pub options: Vec<String>,
    /// Overrides the compiler's own target
    pub target: Option<String>,
    pub opt_level: Option<OptLevel>,
    /// Keep debug information; `-g0` is passed otherwise
    pub debug: bool,
}

impl CompileRequest {
    pub fn new(sources: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            debug: true,
            ..Self::default()
        }
    }

    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn include(mut self, dir: impl Into<PathBuf>) -> Self {
        self.includes.push(dir.into());
        self
    }

    pub fn define(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.defines.push((name.into(), value.map(str::to_string)));
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = Some(level);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// A compiler executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiler {
    pub path: PathBuf,
    pub target: Option<String>,
    /// Echo the command line and let the compiler write to the terminal
    pub verbose: bool,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Compiler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            target: None,
            verbose: false,
        }
    }

    /// `PIM_COMPILER` when set, `clang` on `PATH` otherwise, targeting
    /// [`DEFAULT_TARGET`].
    pub fn from_env() -> Self {
        let path = env::var_os(ENV_COMPILER).map_or_else(|| PathBuf::from("clang"), PathBuf::from);
        Self::new(path).with_target(DEFAULT_TARGET)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Arguments passed to the executable for `request`.
    pub fn args(&self, request: &CompileRequest) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(target) = request.target.as_ref().or(self.target.as_ref()) {
            args.push(format!("--target={target}"));
        }
        if let Some(level) = request.opt_level {
            args.push(level.flag().to_string());
        }
        if !request.debug {
            args.push("-g0".to_string());
        }
        for (name, value) in &request.defines {
            args.push("-D".to_string());
            args.push(match value {
                Some(value) => format!("{name}={value}"),
                None => name.clone(),
            });
        }
        for include in &request.includes {
            args.push("-I".to_string());
            args.push(include.display().to_string());
        }
        args.extend(request.sources.iter().map(|source| source.display().to_string()));
        args.extend(request.options.iter().cloned());
        if let Some(output) = &request.output {
            args.push("-o".to_string());
            args.push(output.display().to_string());
        }
        args
    }

    #[tracing::instrument(skip_all, fields(compiler = %self.path.display(), sources = request.sources.len()))]
    pub fn compile(&self, request: &CompileRequest) -> Result<()> {
        let args = self.args(request);
        let mut command = Command::new(&self.path);
        command.args(&args);

        if self.verbose {
            println!("{} {}", self.path.display(), args.join(" "));
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let output = command
            .output()
            .map_err(|err| Error::Compile(format!("cannot run {}: {err}", self.path.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(status = %output.status, "compiler_failed");
            return Err(Error::Compile(format!(
                "{} exited with {}: {}",
                self.path.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Language of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    C,
    Assembly,
}

impl SourceKind {
    fn extension(self) -> &'static str {
        match self {
            SourceKind::C => "c",
            SourceKind::Assembly => "S",
        }
    }
}

/// Source given on disk or as text
#[derive(Clone, PartialEq, Eq)]
pub enum SourceFile {
    Path { kind: SourceKind, path: PathBuf },
    Text { kind: SourceKind, text: String },
}

impl SourceFile {
    pub fn c_file(path: impl Into<PathBuf>) -> Self {
        SourceFile::Path {
            kind: SourceKind::C,
            path: path.into(),
        }
    }

    pub fn c_text(text: impl Into<String>) -> Self {
        SourceFile::Text {
            kind: SourceKind::C,
            text: text.into(),
        }
    }

    pub fn asm_file(path: impl Into<PathBuf>) -> Self {
        SourceFile::Path {
            kind: SourceKind::Assembly,
            path: path.into(),
        }
    }

    pub fn asm_text(text: impl Into<String>) -> Self {
        SourceFile::Text {
            kind: SourceKind::Assembly,
            text: text.into(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceFile::Path { kind, .. } | SourceFile::Text { kind, .. } => *kind,
        }
    }
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFile::Path { kind, path } => write!(f, "{kind:?}({})", path.display()),
            SourceFile::Text { kind, text } => write!(f, "{kind:?}(<{} bytes>)", text.len()),
        }
    }
}

/// What a set loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    /// Compiled binary held in memory
    Binary(Vec<u8>),
    /// Compiled binary on disk
    BinaryFile(PathBuf),
    /// Sources compiled at `-O2` before loading
    Sources(Vec<SourceFile>),
}

/// Binary produced from sources, kept alive with its work directory
#[derive(Debug)]
pub struct PreparedBinary {
    pub path: PathBuf,
    _workdir: TempDir,
}

/// Compile `sources` into a fresh temporary directory.
pub fn prepare(compiler: &Compiler, sources: &[SourceFile]) -> Result<PreparedBinary> {
    if sources.is_empty() {
        return Err(Error::invalid_load_source("no source file given"));
    }

    let workdir = tempfile::tempdir()?;
    let mut paths = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        match source {
            SourceFile::Path { path, .. } => paths.push(path.clone()),
            SourceFile::Text { kind, text } => {
                let path = workdir.path().join(format!("src{index}.{}", kind.extension()));
                fs::write(&path, text)?;
                paths.push(path);
            }
        }
    }

    let output = workdir.path().join(DEFAULT_OUTPUT);
    let mut request = CompileRequest::new(paths)
        .output(&output)
        .opt_level(OptLevel::O2);
    if sources.iter().all(|source| source.kind() == SourceKind::Assembly) {
        request = request.option("-nostartfiles");
    }
    let (compiled, _duration_us) = pim_tracing::timed_block!("compile", { compiler.compile(&request) });
    compiled?;

    Ok(PreparedBinary {
        path: output,
        _workdir: workdir,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn argument_order_follows_clang_conventions() {
        let compiler = Compiler::new("/opt/pim/bin/clang").with_target("dpu-upmem-dpurte");
        let request = CompileRequest::new(["a.c", "b.c"])
            .output("out.dpu")
            .include("inc")
            .define("NR_TASKLETS", Some("16"))
            .define("DEBUG", None)
            .option("-Wall")
            .opt_level(OptLevel::O3)
            .debug(false);

        assert_eq!(
            compiler.args(&request),
            vec![
                "--target=dpu-upmem-dpurte",
                "-O3",
                "-g0",
                "-D",
                "NR_TASKLETS=16",
                "-D",
                "DEBUG",
                "-I",
                "inc",
                "a.c",
                "b.c",
                "-Wall",
                "-o",
                "out.dpu",
            ]
        );
    }

    #[test]
    fn request_target_overrides_compiler_target() {
        let compiler = Compiler::new("clang").with_target("default");
        let args = compiler.args(&CompileRequest::new(["x.c"]).target("other"));
        assert_eq!(args, vec!["--target=other", "x.c"]);

        let args = Compiler::new("clang").args(&CompileRequest::new(["x.c"]));
        assert_eq!(args, vec!["x.c"]);
    }

    #[test]
    #[serial]
    fn compiler_comes_from_environment() {
        env::set_var(ENV_COMPILER, "/custom/clang");
        let compiler = Compiler::from_env();
        env::remove_var(ENV_COMPILER);
        assert_eq!(compiler.path, PathBuf::from("/custom/clang"));
        assert_eq!(compiler.target.as_deref(), Some(DEFAULT_TARGET));

        assert_eq!(Compiler::from_env().path, PathBuf::from("clang"));
    }

    #[test]
    fn missing_compiler_is_a_compile_error() {
        let compiler = Compiler::new("/nonexistent/pim-clang");
        let err = prepare(&compiler, &[SourceFile::c_text("int main() { return 0; }")]).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn empty_source_list_is_rejected() {
        let err = prepare(&Compiler::new("clang"), &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidLoadSource(_)));
    }
}
