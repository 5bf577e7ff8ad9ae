//! Environment configuration from `assetry.toml`.
//!
//! # Sections
//!
//! | Section     | Purpose                                          |
//! |-------------|--------------------------------------------------|
//! | (top level) | Root search paths and digest algorithm          |
//! | `[cache]`   | Content cache store (memory, file, null)         |
//! | `[watch]`   | Live invalidation backend and timings            |
//! | `[output]`  | Compile output directory, gzip, manifest name    |
//!
//! # Example
//!
//! ```toml
//! paths = ["app/assets", "vendor/assets"]
//! digest = "sha256"
//!
//! [cache]
//! kind = "file"              # memory | file | null
//! dir = ".assetry/cache"
//!
//! [watch]
//! enabled = true
//! backend = "auto"           # auto | native | poll
//!
//! [output]
//! dir = "public/assets"
//! gzip = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CacheStore, DEFAULT_CAPACITY, FileStore, MemoryStore, NullStore};
use crate::digest::DigestAlgorithm;
use crate::error::{Error, Result};
use crate::watch::{WatchBackend, WatchOptions};

/// Default config file name.
pub const CONFIG_FILE: &str = "assetry.toml";

/// Default manifest file name inside the output directory.
pub const MANIFEST_FILE: &str = ".manifest.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Directory the config was loaded from; relative paths resolve against it.
    #[serde(skip)]
    root: PathBuf,

    /// Root search paths, in priority order.
    pub paths: Vec<PathBuf>,

    /// Algorithm for published digests.
    pub digest: DigestAlgorithm,

    pub cache: CacheConfig,
    pub watch: WatchConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    File,
    Null,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// Store directory for `kind = "file"`.
    pub dir: PathBuf,
    /// Entry limit for `kind = "memory"`.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            dir: PathBuf::from(".assetry/cache"),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Build the configured store; `root` anchors a relative `dir`.
    pub fn build(&self, root: &Path) -> Cache {
        let store: Arc<dyn CacheStore> = match self.kind {
            CacheKind::Memory => Arc::new(MemoryStore::new(self.capacity)),
            CacheKind::File => Arc::new(FileStore::new(root.join(&self.dir))),
            CacheKind::Null => Arc::new(NullStore),
        };
        Cache::from_store(store)
    }
}

/// `[watch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub enabled: bool,
    pub backend: WatchBackend,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        let options = WatchOptions::default();
        Self {
            enabled: false,
            backend: options.backend,
            poll_interval_ms: options.poll_interval.as_millis() as u64,
            debounce_ms: options.debounce.as_millis() as u64,
        }
    }
}

impl WatchConfig {
    pub fn options(&self) -> WatchOptions {
        WatchOptions {
            backend: self.backend,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub gzip: bool,
    pub manifest: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("public/assets"),
            gzip: false,
            manifest: MANIFEST_FILE.to_owned(),
        }
    }
}

impl EnvironmentConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut config = Self::from_toml_str(&content)?;
        config.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = root.into();
    }

    /// Search paths joined onto the config directory.
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        self.paths.iter().map(|p| self.root.join(p)).collect()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.output.dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::Config("`paths` must list at least one directory".into()));
        }
        for path in self.resolved_paths() {
            if !path.is_dir() {
                return Err(Error::Config(format!(
                    "path `{}` is not a directory",
                    path.display()
                )));
            }
        }
        if self.cache.kind == CacheKind::Memory && self.cache.capacity == 0 {
            return Err(Error::Config("`cache.capacity` must be positive".into()));
        }
        if self.watch.backend == WatchBackend::Poll && self.watch.poll_interval_ms == 0 {
            return Err(Error::Config("`watch.poll_interval_ms` must be positive".into()));
        }
        let manifest = Path::new(&self.output.manifest);
        if self.output.manifest.is_empty() || manifest.components().count() != 1 {
            return Err(Error::Config(
                "`output.manifest` must be a plain file name".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EnvironmentConfig::from_toml_str("").unwrap();
        assert!(config.paths.is_empty());
        assert_eq!(config.digest, DigestAlgorithm::Sha256);
        assert_eq!(config.cache.kind, CacheKind::Memory);
        assert!(!config.watch.enabled);
        assert_eq!(config.watch.backend, WatchBackend::Auto);
        assert_eq!(config.output.manifest, MANIFEST_FILE);
    }

    #[test]
    fn test_full_config() {
        let config = EnvironmentConfig::from_toml_str(
            r#"
            paths = ["app/assets"]
            digest = "blake3"

            [cache]
            kind = "file"
            dir = "tmp/cache"

            [watch]
            enabled = true
            backend = "poll"
            poll_interval_ms = 100

            [output]
            dir = "out"
            gzip = true
            "#,
        )
        .unwrap();

        assert_eq!(config.paths, [PathBuf::from("app/assets")]);
        assert_eq!(config.digest, DigestAlgorithm::Blake3);
        assert_eq!(config.cache.kind, CacheKind::File);
        assert_eq!(config.watch.options().poll_interval, Duration::from_millis(100));
        assert!(config.output.gzip);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = EnvironmentConfig::from_toml_str("[cache]\nsize = 3").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_load_resolves_relative_to_config() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        let file = dir.path().join(CONFIG_FILE);
        fs::write(&file, "paths = [\"assets\"]\n[output]\ndir = \"build\"").unwrap();

        let config = EnvironmentConfig::load(&file).unwrap();
        assert_eq!(config.resolved_paths(), [dir.path().join("assets")]);
        assert_eq!(config.output_dir(), dir.path().join("build"));
    }

    #[test]
    fn test_validate_errors() {
        let dir = TempDir::new().unwrap();
        let mut config = EnvironmentConfig::default();
        config.set_root(dir.path());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.paths = vec![PathBuf::from("missing")];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        fs::create_dir(dir.path().join("missing")).unwrap();
        assert!(config.validate().is_ok());

        config.output.manifest = "../escape.json".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_config_builds_environment() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/app.js"), "x").unwrap();

        let mut config = EnvironmentConfig::from_toml_str(
            "paths = [\"assets\"]\ndigest = \"sha512\"\n[cache]\nkind = \"null\"\n[output]\ngzip = true",
        )
        .unwrap();
        config.set_root(dir.path());

        let env = crate::Environment::from_config(&config).unwrap();
        assert_eq!(env.paths().len(), 1);
        assert_eq!(env.digest_algorithm(), DigestAlgorithm::Sha512);
        assert_eq!(env.pipeline().writers_for("text/css").len(), 2);
        assert!(!env.is_listening());

        let export = env.find_export("app.js").unwrap().unwrap();
        assert_eq!(export.digest.len(), 64);
    }
}
