//! The environment: composition root of the pipeline.
//!
//! Owns the root path list, the pipeline registry, the content cache and the
//! build cache. Resolution lives in [`crate::resolve`]; this module holds
//! configuration, lookup and watching.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::asset::{Asset, Export};
use crate::cache::{BuildCache, Cache};
use crate::config::EnvironmentConfig;
use crate::digest::DigestAlgorithm;
use crate::error::{Error, Result};
use crate::mime::Charset;
use crate::path::{Decomposed, decompose, normalize_path};
use crate::pipeline::{PipelineConfig, Processor, Writer};
use crate::resolve::{ResolveOptions, ReverseMapping};
use crate::watch::{self, ChangeListener, WatchBackend, WatchHandle, WatchOptions};
use crate::writer::GzipWriter;

pub struct Environment {
    paths: Vec<PathBuf>,
    pipeline: PipelineConfig,
    cache: Cache,
    build_cache: Arc<BuildCache>,
    digest: DigestAlgorithm,
    /// Mixed into every content cache key; bump to invalidate a shared store.
    version: String,
    reverse_mapping: OnceLock<ReverseMapping>,
    watch_options: WatchOptions,
    watcher: Mutex<Option<WatchHandle>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// An environment with no roots, the default pipeline and an in-memory
    /// cache.
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            pipeline: PipelineConfig::default(),
            cache: Cache::default(),
            build_cache: Arc::new(BuildCache::new()),
            digest: DigestAlgorithm::default(),
            version: String::new(),
            reverse_mapping: OnceLock::new(),
            watch_options: WatchOptions::default(),
            watcher: Mutex::new(None),
        }
    }

    /// An environment searching `paths` in order.
    pub fn with_paths<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut env = Self::new();
        for path in paths {
            env.append_path(path)?;
        }
        Ok(env)
    }

    /// Build an environment from a validated configuration.
    pub fn from_config(config: &EnvironmentConfig) -> Result<Self> {
        config.validate()?;

        let mut env = Self::with_paths(config.resolved_paths())?;
        env.digest = config.digest;
        env.cache = config.cache.build(config.root());
        env.watch_options = config.watch.options();
        if config.output.gzip {
            env.register_writer(Arc::new(GzipWriter::default()));
        }
        if config.watch.enabled {
            env.listen();
        }
        Ok(env)
    }

    // -------------------------------------------------------------------------
    // Root paths
    // -------------------------------------------------------------------------

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Add a root searched after the existing ones.
    pub fn append_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let root = validate_root(path.as_ref())?;
        self.paths.push(root);
        self.paths_changed();
        Ok(())
    }

    /// Add a root searched before the existing ones.
    pub fn prepend_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let root = validate_root(path.as_ref())?;
        self.paths.insert(0, root);
        self.paths_changed();
        Ok(())
    }

    pub fn clear_paths(&mut self) {
        self.paths.clear();
        self.paths_changed();
    }

    fn paths_changed(&mut self) {
        self.build_cache.clear();
        self.build_cache.set_roots(self.paths.clone());

        // A running watcher must follow the new roots
        if self.watcher.get_mut().take().is_some() {
            self.listen();
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Mutable pipeline access; drops everything derived from the old one.
    pub fn pipeline_mut(&mut self) -> &mut PipelineConfig {
        self.reverse_mapping = OnceLock::new();
        self.build_cache.clear();
        &mut self.pipeline
    }

    /// Reset every engine registration, keeping mime types.
    pub fn clear_pipeline(&mut self) {
        self.pipeline_mut().clear();
    }

    pub(crate) fn reverse_mapping(&self) -> &ReverseMapping {
        self.reverse_mapping
            .get_or_init(|| ReverseMapping::build(&self.pipeline))
    }

    pub fn register_mime_type(&mut self, name: &str, extensions: &[&str], charset: Charset) {
        self.pipeline_mut()
            .register_mime_type(name, extensions, charset);
    }

    pub fn register_template(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.pipeline_mut().register_template(mime_type, engine);
    }

    pub fn unregister_template(&mut self, mime_type: &str) {
        self.pipeline_mut().unregister_template(mime_type);
    }

    pub fn register_preprocessor(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.pipeline_mut().register_preprocessor(mime_type, engine);
    }

    pub fn unregister_preprocessor(&mut self, mime_type: &str, name: Option<&str>) {
        self.pipeline_mut()
            .unregister_preprocessor(mime_type, name);
    }

    pub fn register_transformer(&mut self, from: &str, to: &str, engine: Arc<dyn Processor>) {
        self.pipeline_mut().register_transformer(from, to, engine);
    }

    pub fn unregister_transformer(&mut self, from: &str) {
        self.pipeline_mut().unregister_transformer(from);
    }

    pub fn register_postprocessor(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.pipeline_mut()
            .register_postprocessor(mime_type, engine);
    }

    pub fn unregister_postprocessor(&mut self, mime_type: &str, name: Option<&str>) {
        self.pipeline_mut()
            .unregister_postprocessor(mime_type, name);
    }

    pub fn register_minifier(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.pipeline_mut().register_minifier(mime_type, engine);
    }

    pub fn unregister_minifier(&mut self, mime_type: &str) {
        self.pipeline_mut().unregister_minifier(mime_type);
    }

    pub fn register_exporter(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.pipeline_mut().register_exporter(mime_type, engine);
    }

    pub fn unregister_exporter(&mut self, mime_type: &str) {
        self.pipeline_mut().unregister_exporter(mime_type);
    }

    pub fn register_writer(&mut self, writer: Arc<dyn Writer>) {
        self.pipeline_mut().register_writer(writer);
    }

    pub fn unregister_writer(
        &mut self,
        name: &str,
        mime_type: Option<&str>,
        registered_with: Option<&[&str]>,
    ) {
        self.pipeline_mut()
            .unregister_writer(name, mime_type, registered_with);
    }

    // -------------------------------------------------------------------------
    // Caches and digests
    // -------------------------------------------------------------------------

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Swap the content cache, e.g. to share one store between environments.
    pub fn set_cache(&mut self, cache: Cache) {
        self.cache = cache;
    }

    pub fn build_cache(&self) -> &BuildCache {
        &self.build_cache
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn set_digest_algorithm(&mut self, digest: DigestAlgorithm) {
        self.digest = digest;
        self.build_cache.clear();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
        self.build_cache.clear();
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub fn decompose_path(&self, path: &str, base: Option<&str>) -> Decomposed {
        decompose(path, base, self.pipeline.mime_types())
    }

    /// First candidate for `path`, processed.
    pub fn find(&self, path: &str) -> Result<Option<Asset>> {
        self.find_with(path, &ResolveOptions::default())
    }

    pub fn find_with(&self, path: &str, options: &ResolveOptions) -> Result<Option<Asset>> {
        let key = self.query(path, options).key;
        let found = self.build_cache.fetch(&key, || {
            let mut assets = self.resolve_with(path, options)?;
            assets.truncate(1);
            Ok(assets)
        })?;

        let Some(asset) = found.into_iter().next() else {
            return Ok(None);
        };
        asset.process(self)?;
        Ok(Some(asset))
    }

    /// Like [`find`](Self::find), but a missing asset is [`Error::FileNotFound`].
    pub fn find_required(&self, path: &str) -> Result<Asset> {
        self.find(path)?.ok_or_else(|| Error::not_found(path))
    }

    /// Find and export an asset.
    pub fn find_export(&self, path: &str) -> Result<Option<Arc<Export>>> {
        match self.find(path)? {
            Some(asset) => asset.export(self).map(Some),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Watching
    // -------------------------------------------------------------------------

    pub fn set_watch_options(&mut self, options: WatchOptions) {
        self.watch_options = options;
    }

    /// Start feeding filesystem changes under the roots into the build cache.
    ///
    /// Returns the backend in use, or `None` when watching is unavailable.
    pub fn listen(&self) -> Option<WatchBackend> {
        let mut watcher = self.watcher.lock();
        if let Some(handle) = watcher.as_ref() {
            return Some(handle.backend());
        }

        let listener: Arc<dyn ChangeListener> = self.build_cache.clone();
        let handle = watch::watch(&self.paths, &self.watch_options, listener)?;
        let backend = handle.backend();
        *watcher = Some(handle);
        Some(backend)
    }

    pub fn stop_listening(&self) {
        drop(self.watcher.lock().take());
    }

    pub fn is_listening(&self) -> bool {
        self.watcher.lock().is_some()
    }
}

fn validate_root(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(Error::InvalidPath(path.to_path_buf()));
    }
    Ok(normalize_path(path))
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("paths", &self.paths)
            .field("pipeline", &self.pipeline)
            .field("digest", &self.digest)
            .field("version", &self.version)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::mime::types;
    use crate::pipeline::processor_fn;
    use crate::testing::{Fixture, noop};

    #[test]
    fn test_nonexistent_root_is_rejected() {
        let mut env = Environment::new();
        let err = env.append_path("/definitely/not/here").unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
        assert!(env.paths().is_empty());
    }

    #[test]
    fn test_prepend_and_clear_paths() {
        let mut fx = Fixture::new();
        let vendor = fx.add_root("vendor");
        let first = fx.tmp.path().join("first");
        std::fs::create_dir(&first).unwrap();

        fx.env.prepend_path(&first).unwrap();
        let paths = fx.env.paths();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], normalize_path(&first));
        assert_eq!(paths[2], vendor);

        fx.env.clear_paths();
        assert!(fx.env.paths().is_empty());
    }

    #[test]
    fn test_decompose_path() {
        let env = Environment::new();
        let d = env.decompose_path("dir/test.text", None);
        assert_eq!(d.dirname.as_deref(), Some("dir"));
        assert_eq!(d.basename, "test");
        assert_eq!(d.extensions, Some(vec![".text".to_owned()]));
        assert_eq!(d.mime_types, [types::PLAIN]);
    }

    #[test]
    fn test_find_missing() {
        let fx = Fixture::new();
        assert!(fx.env.find("nope.js").unwrap().is_none());
        assert!(fx.env.find_export("nope.js").unwrap().is_none());
        let err = fx.env.find_required("nope.js").unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }

    #[test]
    fn test_find_export() {
        let fx = Fixture::new();
        fx.write("app.js", "x");
        let export = fx.env.find_export("app.js").unwrap().unwrap();
        assert_eq!(export.filename, "app.js");
        assert_eq!(export.content_type, types::JAVASCRIPT);
        assert_eq!(export.size(), 1);
    }

    #[test]
    fn test_registration_refreshes_derivatives() {
        let mut fx = Fixture::new();
        fx.write("style.scss", "a{}");
        assert!(fx.env.resolve("style.css").unwrap().is_empty());

        fx.env
            .register_transformer(types::SCSS, types::CSS, noop("sass"));
        assert_eq!(fx.env.resolve("style.css").unwrap().len(), 1);
    }

    #[test]
    fn test_new_file_seen_by_depends_on() {
        let mut fx = Fixture::new();
        fx.write("models/a.js", "a");
        fx.write("models/b.js", "b");
        fx.write("index.txt", "");
        fx.env.register_preprocessor(
            types::PLAIN,
            processor_fn("list", |ctx, data| {
                let names: Vec<String> = ctx
                    .depends_on(data, "models/*.js")?
                    .iter()
                    .map(|a| a.filename().to_owned())
                    .collect();
                data.set_source(names.join(","));
                Ok(())
            }),
        );

        let shared = fx.env.cache().clone();
        let listing = fx.env.find_required("index.txt").unwrap().process(&fx.env).unwrap();
        assert_eq!(listing.source_str(), Some("models/a.js,models/b.js"));

        fx.write("models/c.js", "c");

        // A fresh environment over the same store notices the new file
        let mut env = fx.environment();
        env.set_cache(shared);
        let list = fx.env.pipeline().preprocessors(types::PLAIN)[0].clone();
        env.register_preprocessor(types::PLAIN, list);
        let listing = env.find_required("index.txt").unwrap().process(&env).unwrap();
        assert_eq!(
            listing.source_str(),
            Some("models/a.js,models/b.js,models/c.js")
        );
    }

    #[test]
    fn test_listen_invalidates_modified_dependency() {
        let fx = Fixture::new();
        fx.write("app.js", "1");
        if fx.env.listen().is_none() {
            // No watch backend on this platform; nothing to verify
            return;
        }
        assert!(fx.env.is_listening());

        let asset = fx.env.find_required("app.js").unwrap();
        assert_eq!(asset.process(&fx.env).unwrap().source_str(), Some("1"));

        // Give the backend a moment to settle before the write
        std::thread::sleep(Duration::from_millis(100));
        fx.write("app.js", "2");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut latest = String::new();
        while Instant::now() < deadline {
            let asset = fx.env.find_required("app.js").unwrap();
            latest = asset
                .process(&fx.env)
                .unwrap()
                .source_str()
                .unwrap_or_default()
                .to_owned();
            if latest == "2" {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        assert_eq!(latest, "2");

        fx.env.stop_listening();
        assert!(!fx.env.is_listening());
    }
}
