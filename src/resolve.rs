//! Logical path resolution.
//!
//! Turns a logical pattern (`app.js`, `models/*.js`, `**/*`) into the
//! asset candidates found under the environment's root paths:
//!
//! ```text
//! decompose(pattern) -> glob each root -> decompose(file)
//!     -> keep direct mime matches
//!     -> synthesize derivatives via templates/transformers
//!     -> group by accept priority -> dedup -> sort by filename
//! ```

use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::asset::Asset;
use crate::context::GLOB_TOKEN;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::mime::types;
use crate::path::{Decomposed, decompose, join, relative_logical, strip_last_extension};
use crate::pipeline::PipelineConfig;

/// Options for [`Environment::resolve_with`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Logical directory that `./` and `../` patterns are relative to.
    pub base: Option<String>,
    /// Acceptable mime types in priority order; defaults to the pattern's own.
    pub accept: Option<Vec<String>>,
    /// Source files to skip.
    pub ignore: Vec<PathBuf>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn accept<I, S>(mut self, accept: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept = Some(accept.into_iter().map(Into::into).collect());
        self
    }

    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignore.push(path.into());
        self
    }
}

/// A decomposed pattern with its accept list and cache key.
pub(crate) struct Query {
    pub target: Decomposed,
    pub accept: Vec<Vec<String>>,
    /// `<dirname/basename>@<accept>[!<ignored>..]`, the shape the build
    /// cache's coarse invalidation matches against.
    pub key: String,
}

// =============================================================================
// Mime matching
// =============================================================================

/// Match one mime type against `*/*`, `type/*` or an exact matcher.
pub fn match_mime_type(value: &str, matcher: &str) -> bool {
    if matcher == types::ANY {
        return true;
    }
    match matcher.split_once('/') {
        Some((kind, "*")) => value.split_once('/').is_some_and(|(v, _)| v == kind),
        _ => value == matcher,
    }
}

/// Match a mime-type stack pairwise; a lone `*/*` matcher accepts any stack.
pub fn match_mime_types<V, M>(values: &[V], matchers: &[M]) -> bool
where
    V: AsRef<str>,
    M: AsRef<str>,
{
    if let [only] = matchers
        && only.as_ref() == types::ANY
    {
        return true;
    }
    values.len() == matchers.len()
        && values
            .iter()
            .zip(matchers)
            .all(|(v, m)| match_mime_type(v.as_ref(), m.as_ref()))
}

/// Index of the first accept entry matching `stack`.
fn accept_index(stack: &[String], accept: &[Vec<String>]) -> Option<usize> {
    accept.iter().position(|m| match_mime_types(stack, m))
}

// =============================================================================
// Reverse mapping
// =============================================================================

/// Mime stacks a source stack can be turned into through one template pass
/// and/or one transformer.
///
/// Keys are `[source]` and `[source, template]`; identity mappings are
/// excluded.
#[derive(Debug, Default)]
pub struct ReverseMapping {
    map: FxHashMap<Vec<String>, Vec<Vec<String>>>,
}

impl ReverseMapping {
    pub fn build(pipeline: &PipelineConfig) -> Self {
        let transformers: FxHashMap<&str, &str> = pipeline.transformer_targets().collect();
        let mut templates: Vec<&str> = pipeline.template_types().collect();
        templates.sort_unstable();

        let mut mapping = Self::default();
        for mime in pipeline.mime_types().iter() {
            let source = mime.name.as_str();
            let transformed = transformers.get(source).copied().filter(|t| *t != source);

            if let Some(target) = transformed {
                mapping.add(vec![source.to_owned()], vec![target.to_owned()]);
            }

            for template in &templates {
                let key = vec![source.to_owned(), (*template).to_owned()];
                mapping.add(key.clone(), vec![source.to_owned()]);
                if let Some(target) = transformed {
                    mapping.add(key, vec![target.to_owned()]);
                }
            }
        }
        mapping
    }

    fn add(&mut self, from: Vec<String>, to: Vec<String>) {
        if from == to {
            return;
        }
        let outputs = self.map.entry(from).or_default();
        if !outputs.contains(&to) {
            outputs.push(to);
        }
    }

    /// Derived stacks reachable from `stack`.
    pub fn derivatives(&self, stack: &[String]) -> &[Vec<String>] {
        self.map.get(stack).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// =============================================================================
// Resolution
// =============================================================================

impl Environment {
    /// Resolve a logical pattern with default options.
    pub fn resolve(&self, pattern: &str) -> Result<Vec<Asset>> {
        self.resolve_with(pattern, &ResolveOptions::default())
    }

    /// Resolve a logical pattern into candidate assets, sorted by filename.
    ///
    /// An empty result is not an error.
    pub fn resolve_with(&self, pattern: &str, options: &ResolveOptions) -> Result<Vec<Asset>> {
        let query = self.query(pattern, options);
        self.build_cache().map(&query.key, || {
            self.resolve_uncached(&query.target, &query.accept, &options.ignore)
        })
    }

    /// Decompose a pattern and derive its accept list and cache key.
    pub(crate) fn query(&self, pattern: &str, options: &ResolveOptions) -> Query {
        let target = decompose(pattern, options.base.as_deref(), self.pipeline().mime_types());
        let accept: Vec<Vec<String>> = match &options.accept {
            Some(list) => list.iter().map(|m| vec![m.clone()]).collect(),
            None if target.mime_types.is_empty() => vec![vec![types::ANY.to_owned()]],
            None => vec![target.mime_types.clone()],
        };
        let key = query_key(&target, &accept, &options.ignore);
        Query {
            target,
            accept,
            key,
        }
    }

    /// Like [`resolve_with`](Self::resolve_with), but an empty result is
    /// [`Error::FileNotFound`].
    pub fn resolve_required(&self, pattern: &str, options: &ResolveOptions) -> Result<Vec<Asset>> {
        let assets = self.resolve_with(pattern, options)?;
        if assets.is_empty() {
            return Err(Error::not_found(pattern));
        }
        Ok(assets)
    }

    fn resolve_uncached(
        &self,
        target: &Decomposed,
        accept: &[Vec<String>],
        ignore: &[PathBuf],
    ) -> Result<Vec<Asset>> {
        let mut candidates = Vec::new();

        for root in self.search_roots(target.dirname.as_deref()) {
            let pattern = glob_pattern(root, target);
            crate::debug!("resolve"; "glob {}", pattern);

            let mut files: Vec<PathBuf> = glob::glob(&pattern)?
                .filter_map(std::result::Result::ok)
                .filter(|p| p.is_file())
                .collect();
            files.sort();

            for file in files {
                if ignore.contains(&file) {
                    continue;
                }
                let Some(logical) = relative_logical(&file, root) else {
                    continue;
                };
                self.collect_candidates(&mut candidates, target, accept, &file, root, &logical);
            }
        }

        Ok(dedup(candidates, accept))
    }

    fn collect_candidates(
        &self,
        candidates: &mut Vec<Asset>,
        target: &Decomposed,
        accept: &[Vec<String>],
        file: &Path,
        root: &Path,
        logical: &str,
    ) {
        let mime_types = self.pipeline().mime_types();
        let found = decompose(logical, None, mime_types);
        if !(target.is_wildcard() || target.basename == found.basename) {
            return;
        }

        if accept_index(&found.mime_types, accept).is_some() {
            candidates.push(Asset::new(
                logical.to_owned(),
                found.mime_types.clone(),
                file.to_path_buf(),
                root.to_path_buf(),
            ));
        }

        for derived in self.reverse_mapping().derivatives(&found.mime_types) {
            if accept_index(derived, accept).is_none() {
                continue;
            }
            let filename = derived_filename(&found, derived, self.pipeline());
            candidates.push(Asset::new(
                filename,
                derived.clone(),
                file.to_path_buf(),
                root.to_path_buf(),
            ));
        }
    }

    /// `glob:` dependency tokens for the filesystem globs a pattern scans.
    pub(crate) fn glob_tokens(&self, pattern: &str, base: Option<&str>) -> Vec<String> {
        let target = decompose(pattern, base, self.pipeline().mime_types());
        self.search_roots(target.dirname.as_deref())
            .into_iter()
            .map(|root| format!("{GLOB_TOKEN}{}", glob_pattern(root, &target)))
            .collect()
    }

    /// Roots to scan: the one containing an absolute dirname, else all of them.
    fn search_roots(&self, dirname: Option<&str>) -> Vec<&PathBuf> {
        match dirname {
            Some(dir) if dir.starts_with('/') => self
                .paths()
                .iter()
                .filter(|root| Path::new(dir).starts_with(root))
                .take(1)
                .collect(),
            _ => self.paths().iter().collect(),
        }
    }
}

/// Cache key for a query: logical pattern, then accept list, then ignores.
fn query_key(target: &Decomposed, accept: &[Vec<String>], ignore: &[PathBuf]) -> String {
    let mut key = join(target.dirname.as_deref(), &target.basename);
    key.push('@');
    key.push_str(
        &accept
            .iter()
            .map(|stack| stack.join("+"))
            .collect::<Vec<_>>()
            .join(","),
    );
    for path in ignore {
        key.push('!');
        key.push_str(&path.to_string_lossy());
    }
    key
}

fn glob_pattern(root: &Path, target: &Decomposed) -> String {
    let mut pattern = match target.dirname.as_deref() {
        Some(dir) if dir.starts_with('/') => dir.to_owned(),
        Some(dir) => format!("{}/{dir}", glob::Pattern::escape(&root.to_string_lossy())),
        None => glob::Pattern::escape(&root.to_string_lossy()),
    };
    pattern.push('/');
    pattern.push_str(&target.basename);
    if !pattern.ends_with('*') {
        pattern.push_str(".*");
    }
    pattern
}

/// Logical name of a derivative: keep the source's own extension where the
/// derived stack agrees with it, else use the registered primary extension.
fn derived_filename(found: &Decomposed, derived: &[String], pipeline: &PipelineConfig) -> String {
    let own = found.extensions.as_deref().unwrap_or_default();
    let mut name = found.basename.clone();
    for (i, mime) in derived.iter().enumerate() {
        if found.mime_types.get(i) == Some(mime) {
            name.push_str(&own[i]);
        } else if let Some(ext) = pipeline.mime_types().primary_extension(mime) {
            name.push_str(ext);
        }
    }
    join(found.dirname.as_deref(), &name)
}

/// Group by accept priority, keep the first candidate per base path (the
/// filename without its final extension), then sort by filename.
fn dedup(candidates: Vec<Asset>, accept: &[Vec<String>]) -> Vec<Asset> {
    let mut groups: Vec<Vec<Asset>> = vec![Vec::new(); accept.len()];
    for asset in candidates {
        if let Some(idx) = accept_index(asset.content_types(), accept) {
            groups[idx].push(asset);
        }
    }

    let mut seen = FxHashSet::default();
    let mut results: Vec<Asset> = groups
        .into_iter()
        .flatten()
        .filter(|asset| seen.insert(strip_last_extension(asset.filename()).to_owned()))
        .collect();

    results.sort_by(|a, b| a.filename().cmp(b.filename()));
    results
}
