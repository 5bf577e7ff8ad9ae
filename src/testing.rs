//! Test fixtures: scratch asset trees and recording engines.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tempfile::TempDir;

use crate::context::{Context, ProcessData};
use crate::environment::Environment;
use crate::path::normalize_path;
use crate::pipeline::{Processor, processor_fn};

/// A temp directory holding an `assets/` root and an environment over it.
pub struct Fixture {
    pub tmp: TempDir,
    pub root: PathBuf,
    pub env: Environment,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("assets");
        fs::create_dir_all(&root).unwrap();
        let root = normalize_path(&root);
        let env = Environment::with_paths([&root]).unwrap();
        Self { tmp, root, env }
    }

    /// Write a file under the root, creating parents. Returns its path.
    pub fn write(&self, rel: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        write_under(&self.root, rel, contents)
    }

    /// Create a sibling directory and append it as a lower-priority root.
    pub fn add_root(&mut self, name: &str) -> PathBuf {
        let dir = self.tmp.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        self.env.append_path(&dir).unwrap();
        normalize_path(&dir)
    }

    /// A second, independent environment over the same root.
    pub fn environment(&self) -> Environment {
        Environment::with_paths([&self.root]).unwrap()
    }
}

pub fn write_under(dir: &Path, rel: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

/// An engine that leaves its input untouched.
pub fn noop(name: &str) -> Arc<dyn Processor> {
    processor_fn(name, |_, _| Ok(()))
}

/// Counts how often the engines it hands out are invoked.
pub struct Counting {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl Counting {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A counting no-op engine.
    pub fn processor(&self) -> Arc<dyn Processor> {
        self.wrap(noop(&self.name))
    }

    /// Count calls to `inner` and then delegate.
    pub fn wrap(&self, inner: Arc<dyn Processor>) -> Arc<dyn Processor> {
        Arc::new(Counted {
            name: self.name.clone(),
            calls: Arc::clone(&self.calls),
            inner,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct Counted {
    name: String,
    calls: Arc<AtomicUsize>,
    inner: Arc<dyn Processor>,
}

impl Processor for Counted {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.call(ctx, data)
    }
}

/// A toy template engine: `<%= 1 + 2 %>` renders the integer sum.
pub fn erb() -> Arc<dyn Processor> {
    static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<%=(.*?)%>").unwrap());

    processor_fn("erb", |_, data| {
        let source = data.source_str()?;
        let mut error = None;
        let rendered = TAG.replace_all(source, |caps: &regex::Captures<'_>| {
            let sum: Result<i64, _> = caps[1].split('+').map(|t| t.trim().parse::<i64>()).sum();
            match sum {
                Ok(sum) => sum.to_string(),
                Err(e) => {
                    error = Some(anyhow::anyhow!("bad expression `{}`: {e}", caps[1].trim()));
                    String::new()
                }
            }
        });
        if let Some(e) = error {
            return Err(e);
        }
        let rendered = rendered.into_owned();
        data.set_source(rendered);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erb_renders_sums() {
        let fx = Fixture::new();
        let mut data = ProcessData::new("a.txt", vec![], b"1<%= 1+1 %>3 <%=4 + 5 + 6%>".to_vec());
        let ctx = Context::new(&fx.env, "a.txt");
        erb().call(&ctx, &mut data).unwrap();
        assert_eq!(data.source, b"123 15");

        let mut bad = ProcessData::new("a.txt", vec![], b"<%= x %>".to_vec());
        assert!(erb().call(&ctx, &mut bad).is_err());
    }
}
