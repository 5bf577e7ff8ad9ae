//! Assets and their process/export lifecycle.
//!
//! ```text
//! Unprocessed --process()--> Processed --export()--> Exported --write()--> files
//! ```
//!
//! Both phases are memoized twice: on the [`Asset`] handle itself, and in the
//! environment's content cache under a key derived from the source bytes and
//! the requested mime-type stack. Invalidation clears the handle's memo and
//! forces the next call past the content cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::context::{Context, ProcessData, digest_tokens, tokens_fresh};
use crate::digest::{self, base64_bytes, fingerprint_path, key_digest, key_digest_parts};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::mime::Charset;
use crate::path::{decompose, relative_logical, strip_last_extension};
use crate::pipeline::Processor;

/// Result of the process phase, as stored in the content cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processed {
    #[serde(with = "base64_bytes")]
    pub source: Vec<u8>,
    pub map: Option<String>,
    /// Filename after templates and transformers rewrote its extensions.
    pub filename: String,
    pub content_types: Vec<String>,
    pub linked_assets: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    #[serde(with = "base64_bytes")]
    pub digest: Vec<u8>,
    pub digest_name: String,
    /// blake3 of the raw source bytes.
    pub source_digest: String,
    /// blake3 of the asset identity and requested stack.
    pub content_digest: String,
    dependency_digests: BTreeMap<String, String>,
}

impl Processed {
    pub fn hexdigest(&self) -> String {
        hex::encode(&self.digest)
    }

    pub fn source_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.source).ok()
    }

    fn is_fresh(&self) -> bool {
        tokens_fresh(&self.dependency_digests)
    }
}

/// Immutable snapshot of an exported asset, consumed by writers and the
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub filename: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub source: Vec<u8>,
    pub map: Option<String>,
    #[serde(with = "base64_bytes")]
    pub digest: Vec<u8>,
    pub digest_name: String,
    pub linked_assets: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    dependency_digests: BTreeMap<String, String>,
}

impl Export {
    pub fn hexdigest(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Fingerprinted filename: `app.js` -> `app-<hexdigest>.js`.
    pub fn path(&self) -> String {
        fingerprint_path(&self.filename, &self.hexdigest())
    }

    /// Subresource integrity value.
    pub fn integrity(&self) -> String {
        digest::integrity(&self.digest_name, &self.digest)
    }

    pub fn size(&self) -> usize {
        self.source.len()
    }

    pub fn source_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.source).ok()
    }

    fn is_fresh(&self) -> bool {
        tokens_fresh(&self.dependency_digests)
    }
}

// =============================================================================
// Asset
// =============================================================================

/// One logical file at one requested mime-type stack.
///
/// Cheap to clone; clones share lifecycle state. Equality and hashing use
/// `(filename, content_types)` only.
#[derive(Clone)]
pub struct Asset {
    inner: Arc<AssetInner>,
}

struct AssetInner {
    filename: String,
    content_types: Vec<String>,
    source_file: PathBuf,
    source_path: PathBuf,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    processed: Option<Arc<Processed>>,
    exported: Option<Arc<Export>>,
    force_reprocess: bool,
    force_reexport: bool,
}

impl Asset {
    pub fn new(
        filename: String,
        content_types: Vec<String>,
        source_file: PathBuf,
        source_path: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AssetInner {
                filename,
                content_types,
                source_file,
                source_path,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn filename(&self) -> &str {
        &self.inner.filename
    }

    pub fn content_types(&self) -> &[String] {
        &self.inner.content_types
    }

    /// Current content type, empty for an untyped file.
    pub fn content_type(&self) -> &str {
        self.inner.content_types.last().map_or("", String::as_str)
    }

    /// Absolute path of the file on disk.
    pub fn source_file(&self) -> &Path {
        &self.inner.source_file
    }

    /// Root path the file was found under.
    pub fn source_path(&self) -> &Path {
        &self.inner.source_path
    }

    /// Whether both handles share lifecycle state.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_processed(&self) -> bool {
        self.inner.state.lock().processed.is_some()
    }

    pub fn is_exported(&self) -> bool {
        self.inner.state.lock().exported.is_some()
    }

    /// Dependencies recorded by the process phase, empty before it ran.
    pub fn process_dependencies(&self) -> BTreeSet<String> {
        let state = self.inner.state.lock();
        state
            .processed
            .as_ref()
            .map(|p| p.dependencies.clone())
            .unwrap_or_default()
    }

    /// Dependencies recorded by the export phase, empty before it ran.
    pub fn export_dependencies(&self) -> BTreeSet<String> {
        let state = self.inner.state.lock();
        state
            .exported
            .as_ref()
            .map(|e| e.dependencies.clone())
            .unwrap_or_default()
    }

    /// Drop the memoized process result; the next `process` recomputes.
    pub fn needs_reprocessing(&self) {
        let mut state = self.inner.state.lock();
        state.processed = None;
        state.exported = None;
        state.force_reprocess = true;
        state.force_reexport = true;
    }

    /// Drop the memoized export result; the next `export` recomputes.
    pub fn needs_reexporting(&self) {
        let mut state = self.inner.state.lock();
        state.exported = None;
        state.force_reexport = true;
    }

    // -------------------------------------------------------------------------
    // Process
    // -------------------------------------------------------------------------

    /// Run the process phase, or return its memoized result.
    pub fn process(&self, env: &Environment) -> Result<Arc<Processed>> {
        let force = {
            let state = self.inner.state.lock();
            if let Some(processed) = &state.processed {
                return Ok(Arc::clone(processed));
            }
            state.force_reprocess
        };

        let raw = std::fs::read(self.source_file()).map_err(|e| Error::io(self.source_file(), e))?;
        let source_digest = key_digest(&raw);
        let content_digest = self.content_digest(env);
        let key = format!("process/{source_digest}/{content_digest}");

        let processed = env.cache().fetch_with(
            &key,
            |cached: &Processed| !force && cached.is_fresh(),
            || {
                crate::debug!("asset"; "processing {}", self.filename());
                self.run_process(env, raw, source_digest.clone(), content_digest.clone())
            },
        )?;

        let processed = Arc::new(processed);
        {
            let mut state = self.inner.state.lock();
            state.processed = Some(Arc::clone(&processed));
            state.force_reprocess = false;
        }
        env.build_cache().track(self);
        Ok(processed)
    }

    fn content_digest(&self, env: &Environment) -> String {
        let source_file = self.source_file().to_string_lossy();
        let content_types = self.content_types().join(",");
        key_digest_parts([
            env.version(),
            env.digest_algorithm().name(),
            &source_file,
            self.filename(),
            &content_types,
        ])
    }

    fn run_process(
        &self,
        env: &Environment,
        raw: Vec<u8>,
        source_digest: String,
        content_digest: String,
    ) -> Result<Processed> {
        let pipeline = env.pipeline();
        let logical = relative_logical(self.source_file(), self.source_path())
            .unwrap_or_else(|| self.filename().to_owned());
        let stack = decompose(&logical, None, pipeline.mime_types()).mime_types;
        let requested = self.content_types();

        let mut data = ProcessData::new(logical, stack, raw);
        data.dependencies
            .insert(self.source_file().to_string_lossy().into_owned());
        let ctx = Context::new(env, self.filename());

        // Templates compile their whole source into the next type down. A
        // rendition that asks for the template type itself stays unrendered.
        while data.content_types.as_slice() != requested
            && let Some(engine) = pipeline.template(data.content_type())
        {
            run_engine(engine, &ctx, &mut data)?;
            data.content_types.pop();
            data.filename = strip_last_extension(&data.filename).to_owned();
        }

        let charset = pipeline.mime_types().charset(data.content_type());
        data.source = apply_charset(charset, std::mem::take(&mut data.source));

        for engine in pipeline.preprocessors(data.content_type()) {
            run_engine(engine, &ctx, &mut data)?;
        }

        let mut visited = BTreeSet::new();
        while data.content_types.as_slice() != requested
            && let Some(transformer) = pipeline.transformer(data.content_type())
            && visited.insert(data.content_type().to_owned())
        {
            run_engine(&transformer.engine, &ctx, &mut data)?;
            data.content_types.pop();
            data.content_types.push(transformer.target.clone());
            let ext = pipeline
                .mime_types()
                .primary_extension(&transformer.target)
                .unwrap_or_default();
            data.filename = format!("{}{ext}", strip_last_extension(&data.filename));
        }

        for engine in pipeline.postprocessors(data.content_type()) {
            run_engine(engine, &ctx, &mut data)?;
        }

        if data.content_types.as_slice() != requested {
            return Err(Error::ContentTypeMismatch {
                filename: self.filename().to_owned(),
                expected: requested.to_vec(),
                actual: data.content_types,
            });
        }

        let algorithm = env.digest_algorithm();
        let dependency_digests = digest_tokens(&data.dependencies);
        Ok(Processed {
            digest: algorithm.digest(&data.source),
            digest_name: algorithm.name().to_owned(),
            source: data.source,
            map: data.map,
            filename: data.filename,
            content_types: data.content_types,
            linked_assets: data.linked_assets,
            dependencies: data.dependencies,
            source_digest,
            content_digest,
            dependency_digests,
        })
    }

    // -------------------------------------------------------------------------
    // Export
    // -------------------------------------------------------------------------

    /// Run the export phase (processing first if needed).
    pub fn export(&self, env: &Environment) -> Result<Arc<Export>> {
        let force = {
            let state = self.inner.state.lock();
            if let Some(exported) = &state.exported {
                return Ok(Arc::clone(exported));
            }
            state.force_reexport
        };

        let processed = self.process(env)?;
        let key = format!(
            "export/{}/{}",
            processed.hexdigest(),
            processed.content_digest
        );

        let export = env.cache().fetch_with(
            &key,
            |cached: &Export| !force && cached.is_fresh(),
            || {
                crate::debug!("asset"; "exporting {}", self.filename());
                self.run_export(env, &processed)
            },
        )?;

        let export = Arc::new(export);
        {
            let mut state = self.inner.state.lock();
            state.exported = Some(Arc::clone(&export));
            state.force_reexport = false;
        }
        env.build_cache().track(self);
        Ok(export)
    }

    fn run_export(&self, env: &Environment, processed: &Processed) -> Result<Export> {
        let pipeline = env.pipeline();
        let content_type = self.content_type().to_owned();

        let mut data = ProcessData::new(
            self.filename(),
            processed.content_types.clone(),
            processed.source.clone(),
        );
        data.map = processed.map.clone();
        data.dependencies = processed.dependencies.clone();
        data.linked_assets = processed.linked_assets.clone();
        let ctx = Context::new(env, self.filename());

        if let Some(engine) = pipeline.exporter(&content_type) {
            run_engine(engine, &ctx, &mut data)?;
        }
        if let Some(engine) = pipeline.minifier(&content_type) {
            run_engine(engine, &ctx, &mut data)?;
        }

        let algorithm = env.digest_algorithm();
        let dependency_digests = digest_tokens(&data.dependencies);
        Ok(Export {
            filename: self.filename().to_owned(),
            content_type,
            digest: algorithm.digest(&data.source),
            digest_name: algorithm.name().to_owned(),
            source: data.source,
            map: data.map,
            linked_assets: data.linked_assets,
            dependencies: data.dependencies,
            dependency_digests,
        })
    }

    // -------------------------------------------------------------------------
    // Write
    // -------------------------------------------------------------------------

    /// Export and hand the result to every writer registered for its type.
    ///
    /// Returns the relative filenames written.
    pub fn write(&self, env: &Environment, output_dir: &Path) -> Result<Vec<String>> {
        let export = self.export(env)?;
        let mut written = Vec::new();
        for writer in env.pipeline().writers_for(&export.content_type) {
            written.extend(writer.call(output_dir, &export)?);
        }
        Ok(written)
    }
}

fn run_engine(engine: &Arc<dyn Processor>, ctx: &Context<'_>, data: &mut ProcessData) -> Result<()> {
    engine
        .call(ctx, data)
        .map_err(|e| Error::from_engine(engine.name(), &data.filename, e))
}

impl PartialEq for Asset {
    fn eq(&self, other: &Self) -> bool {
        self.filename() == other.filename() && self.content_types() == other.content_types()
    }
}

impl Eq for Asset {}

impl Hash for Asset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.filename().hash(state);
        self.content_types().hash(state);
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("filename", &self.filename())
            .field("content_types", &self.content_types())
            .field("source_file", &self.source_file())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Charset handling
// =============================================================================

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16BE_BOM: &[u8] = &[0xFE, 0xFF];

static CHARSET_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^@charset\s+(?:"[^"]*"|'[^']*')\s*;\s*"#).expect("valid regex")
});

fn apply_charset(charset: Charset, source: Vec<u8>) -> Vec<u8> {
    match charset {
        Charset::Default => strip_utf8_bom(source),
        Charset::Unicode | Charset::Html => decode_unicode(source),
        Charset::Css => strip_charset_rule(decode_unicode(source)),
    }
}

fn strip_utf8_bom(source: Vec<u8>) -> Vec<u8> {
    match source.strip_prefix(UTF8_BOM) {
        Some(rest) => rest.to_vec(),
        None => source,
    }
}

/// Decode BOM-marked UTF-16 into UTF-8; anything else passes through.
fn decode_unicode(source: Vec<u8>) -> Vec<u8> {
    let units = |rest: &[u8], be: bool| -> Vec<u16> {
        rest.chunks_exact(2)
            .map(|pair| {
                let bytes = [pair[0], pair[1]];
                if be { u16::from_be_bytes(bytes) } else { u16::from_le_bytes(bytes) }
            })
            .collect()
    };

    if let Some(rest) = source.strip_prefix(UTF16LE_BOM) {
        String::from_utf16_lossy(&units(rest, false)).into_bytes()
    } else if let Some(rest) = source.strip_prefix(UTF16BE_BOM) {
        String::from_utf16_lossy(&units(rest, true)).into_bytes()
    } else {
        strip_utf8_bom(source)
    }
}

fn strip_charset_rule(source: Vec<u8>) -> Vec<u8> {
    match CHARSET_RULE.find(&source) {
        Some(m) => source[m.end()..].to_vec(),
        None => source,
    }
}
