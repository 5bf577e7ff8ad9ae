//! External command engine.
//!
//! Pipes the asset source through a program's stdin and takes its stdout as
//! the new source.
//!
//! # Examples
//!
//! ```ignore
//! use assetry::engines::CommandProcessor;
//!
//! // Uppercase every text/plain asset
//! env.register_postprocessor(
//!     "text/plain",
//!     CommandProcessor::new("tr").args(["a-z", "A-Z"]).into_processor(),
//! );
//!
//! // Quiet a chatty compiler
//! CommandProcessor::new("sass")
//!     .args(["--stdin", "--no-source-map"])
//!     .skip_stderr(["Deprecation Warning"]);
//! ```

use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::context::{Context, ProcessData};
use crate::error::Error;
use crate::pipeline::Processor;

/// Runs an external program as an engine.
#[derive(Debug, Clone, Default)]
pub struct CommandProcessor {
    name: String,
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    skip_prefixes: Vec<String>,
}

impl CommandProcessor {
    /// Named after the program unless [`name`](Self::name) overrides it.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let program = program.as_ref().to_owned();
        Self {
            name: program.to_string_lossy().into_owned(),
            program,
            ..Default::default()
        }
    }

    /// Create from a command array (e.g. `["npx", "esbuild"]`).
    pub fn from_slice<S: AsRef<OsStr>>(cmd: &[S]) -> Self {
        let mut iter = cmd.iter();
        let program: &OsStr = iter.next().map(|s| s.as_ref()).unwrap_or_default();
        let mut this = Self::new(program);
        this.args = iter.map(|s| s.as_ref().to_owned()).collect();
        this
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a single argument. Empty arguments are dropped.
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        let arg = arg.as_ref();
        if !arg.is_empty() {
            self.args.push(arg.to_owned());
        }
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        args.into_iter().fold(self, Self::arg)
    }

    pub fn cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    pub fn envs<K, V, I>(mut self, vars: I) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in vars {
            self.envs.push((k.as_ref().to_owned(), v.as_ref().to_owned()));
        }
        self
    }

    /// Drop stderr lines starting with any of `prefixes` from the log.
    pub fn skip_stderr<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_prefixes.extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn into_processor(self) -> Arc<dyn Processor> {
        Arc::new(self)
    }

    /// Spawn the program, feed `input` on stdin and collect its output.
    ///
    /// A non-zero exit is an [`Error::Engine`] carrying both streams.
    pub fn run(&self, filename: &str, input: &[u8]) -> crate::Result<Vec<u8>> {
        let program = self.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().cloned())
            .env("ASSETRY_FILENAME", filename)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| Error::io(&program, e))?;

        // Feed stdin from a second thread so a full stdout pipe can't deadlock us
        let stdin = child.stdin.take();
        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(input),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            (writer.join(), output)
        });

        let output = match output {
            (_, Err(e)) => return Err(Error::io(&program, e)),
            (Ok(Err(e)), Ok(out)) if out.status.success() => return Err(Error::io(&program, e)),
            (_, Ok(out)) => out,
        };

        if !output.status.success() {
            return Err(engine_error(program, output));
        }

        self.log_stderr(&output.stderr);
        Ok(output.stdout)
    }

    fn log_stderr(&self, stderr: &[u8]) {
        let stderr = String::from_utf8_lossy(stderr);
        let lines: Vec<_> = stderr
            .lines()
            .filter(|line| {
                let plain = strip_ansi(line);
                let trimmed = plain.trim();
                !trimmed.is_empty()
                    && !self
                        .skip_prefixes
                        .iter()
                        .any(|p| trimmed.starts_with(p.as_str()))
            })
            .collect();

        if !lines.is_empty() {
            crate::log!("exec"; "{}: {}", self.name, lines.join("\n"));
        }
    }
}

impl Processor for CommandProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()> {
        crate::debug!("exec"; "{} < {}", self.name, ctx.filename());
        let stdout = self.run(ctx.filename(), &data.source)?;
        data.set_source(stdout);
        data.map = None;
        Ok(())
    }
}

fn engine_error(program: String, output: Output) -> Error {
    Error::Engine {
        program,
        status: output.status,
        stdout: strip_ansi(&String::from_utf8_lossy(&output.stdout)).into_owned(),
        stderr: strip_ansi(&String::from_utf8_lossy(&output.stderr)).into_owned(),
    }
}

/// Strip ANSI escape codes from string.
fn strip_ansi(s: &str) -> std::borrow::Cow<'_, str> {
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi pattern"));
    RE.replace_all(s, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::types;
    use crate::testing::Fixture;

    #[test]
    fn test_builder() {
        let cmd = CommandProcessor::new("echo")
            .arg("hello")
            .args(["world", "", "!"])
            .cwd("/tmp");

        assert_eq!(cmd.program, OsString::from("echo"));
        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(Processor::name(&cmd), "echo");
    }

    #[test]
    fn test_from_slice() {
        let cmd = CommandProcessor::from_slice(&["npx", "esbuild", "--minify"]).name("esbuild");
        assert_eq!(cmd.program, OsString::from("npx"));
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(Processor::name(&cmd), "esbuild");
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mRed\x1b[0m"), "Red");
        assert_eq!(strip_ansi("Plain text"), "Plain text");
    }

    #[cfg(unix)]
    #[test]
    fn test_pipes_stdin_to_stdout() {
        let out = CommandProcessor::new("cat").run("a.txt", b"test data").unwrap();
        assert_eq!(out, b"test data");
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_engine_error() {
        let err = CommandProcessor::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run("a.txt", b"")
            .unwrap_err();
        match err {
            Error::Engine {
                program,
                status,
                stderr,
                ..
            } => {
                assert_eq!(program, "sh");
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let err = CommandProcessor::new("assetry-no-such-program")
            .run("a.txt", b"")
            .unwrap_err();
        assert!(matches!(err, Error::Io(..)));
    }

    #[cfg(unix)]
    #[test]
    fn test_as_pipeline_engine() {
        let mut fx = Fixture::new();
        fx.write("note.txt", "shout");
        fx.env.register_postprocessor(
            types::PLAIN,
            CommandProcessor::new("tr").args(["a-z", "A-Z"]).into_processor(),
        );

        let asset = fx.env.find_required("note.txt").unwrap();
        let processed = asset.process(&fx.env).unwrap();
        assert_eq!(processed.source_str(), Some("SHOUT"));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_error_surfaces_from_process() {
        let mut fx = Fixture::new();
        fx.write("note.txt", "x");
        fx.env.register_preprocessor(
            types::PLAIN,
            CommandProcessor::new("false").into_processor(),
        );

        let err = fx.env.find_required("note.txt").unwrap_err();
        assert!(matches!(err, Error::Engine { .. }));
    }
}
