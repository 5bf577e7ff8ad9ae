//! Per-pass processing context.
//!
//! Engines receive a [`Context`] alongside the mutable [`ProcessData`]
//! record. The context resolves paths relative to the asset being processed
//! and records dependency tokens on the record:
//!
//! | Token              | Meaning                                   |
//! |--------------------|-------------------------------------------|
//! | `/abs/path/a.js`   | file bytes                                |
//! | `env:VAR`          | value of an environment variable          |
//! | `glob:/abs/pat/*`  | set of files matching a filesystem glob   |

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use anyhow::Context as _;

use crate::asset::Asset;
use crate::digest::{key_digest, key_digest_parts};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::resolve::ResolveOptions;

pub(crate) const ENV_TOKEN: &str = "env:";
pub(crate) const GLOB_TOKEN: &str = "glob:";

/// The mutable record engines read and rewrite.
#[derive(Debug, Clone, Default)]
pub struct ProcessData {
    /// Logical filename at the current stage (`a.js.erb` becomes `a.js`).
    pub filename: String,
    /// Mime-type stack; the last entry is the current content type.
    pub content_types: Vec<String>,
    pub source: Vec<u8>,
    pub map: Option<String>,
    pub dependencies: BTreeSet<String>,
    /// Logical filenames of assets referenced but not inlined.
    pub linked_assets: BTreeSet<String>,
}

impl ProcessData {
    pub fn new(filename: impl Into<String>, content_types: Vec<String>, source: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_types,
            source,
            ..Self::default()
        }
    }

    /// Current content type, empty for an untyped file.
    pub fn content_type(&self) -> &str {
        self.content_types.last().map_or("", String::as_str)
    }

    pub fn source_str(&self) -> anyhow::Result<&str> {
        std::str::from_utf8(&self.source)
            .with_context(|| format!("{} is not valid UTF-8", self.filename))
    }

    pub fn set_source(&mut self, source: impl Into<Vec<u8>>) {
        self.source = source.into();
    }
}

/// Handle given to engines for one processing pass of one asset.
pub struct Context<'a> {
    env: &'a Environment,
    filename: &'a str,
}

impl<'a> Context<'a> {
    pub(crate) fn new(env: &'a Environment, filename: &'a str) -> Self {
        Self { env, filename }
    }

    pub fn environment(&self) -> &'a Environment {
        self.env
    }

    /// Logical filename of the asset being processed.
    pub fn filename(&self) -> &str {
        self.filename
    }

    /// Logical directory `./` and `../` paths are resolved against.
    pub fn base(&self) -> Option<&str> {
        self.filename.rsplit_once('/').map(|(dir, _)| dir)
    }

    fn options(&self) -> ResolveOptions {
        ResolveOptions {
            base: self.base().map(str::to_owned),
            ..ResolveOptions::default()
        }
    }

    /// Resolve a pattern relative to the current asset.
    pub fn resolve(&self, pattern: &str) -> Result<Vec<Asset>> {
        self.env.resolve_with(pattern, &self.options())
    }

    /// Depend on every file matching `pattern`, and on the pattern itself so
    /// that files added later invalidate the result.
    pub fn depends_on(&self, data: &mut ProcessData, pattern: &str) -> Result<Vec<Asset>> {
        let assets = self.resolve(pattern)?;
        for asset in &assets {
            data.dependencies
                .insert(asset.source_file().to_string_lossy().into_owned());
        }
        data.dependencies
            .extend(self.env.glob_tokens(pattern, self.base()));
        Ok(assets)
    }

    /// Depend on an environment variable; returns its current value.
    pub fn depends_on_env(&self, data: &mut ProcessData, var: &str) -> Option<String> {
        data.dependencies.insert(format!("{ENV_TOKEN}{var}"));
        std::env::var(var).ok()
    }

    /// Process another asset and take on all of its dependencies.
    pub fn depend_on_asset(&self, data: &mut ProcessData, path: &str) -> Result<Asset> {
        let asset = self.find_required(path)?;
        let processed = asset.process(self.env)?;
        data.dependencies
            .extend(processed.dependencies.iter().cloned());
        Ok(asset)
    }

    /// Record a referenced asset that is emitted alongside this one.
    pub fn link_asset(&self, data: &mut ProcessData, path: &str) -> Result<Asset> {
        let asset = self.find_required(path)?;
        data.linked_assets.insert(asset.filename().to_owned());
        Ok(asset)
    }

    fn find_required(&self, path: &str) -> Result<Asset> {
        self.env
            .find_with(path, &self.options())?
            .ok_or_else(|| Error::not_found(path))
    }
}

/// Current digest of a dependency token.
pub(crate) fn digest_token(token: &str) -> String {
    if let Some(var) = token.strip_prefix(ENV_TOKEN) {
        return match std::env::var_os(var) {
            Some(value) => key_digest(value.as_encoded_bytes()),
            None => "unset".to_owned(),
        };
    }
    if let Some(pattern) = token.strip_prefix(GLOB_TOKEN) {
        let mut listing: Vec<String> = glob::glob(pattern)
            .map(|paths| {
                paths
                    .filter_map(std::result::Result::ok)
                    .filter(|p| p.is_file())
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        listing.sort();
        return key_digest_parts(listing);
    }
    match fs::read(token) {
        Ok(bytes) => key_digest(&bytes),
        Err(_) => "missing".to_owned(),
    }
}

pub(crate) fn digest_tokens(tokens: &BTreeSet<String>) -> BTreeMap<String, String> {
    tokens
        .iter()
        .map(|token| (token.clone(), digest_token(token)))
        .collect()
}

/// Whether every recorded token still has the digest it was recorded with.
pub(crate) fn tokens_fresh(recorded: &BTreeMap<String, String>) -> bool {
    recorded.iter().all(|(token, digest)| {
        let fresh = digest_token(token) == *digest;
        if !fresh {
            crate::debug!("cache"; "stale dependency {}", token);
        }
        fresh
    })
}
