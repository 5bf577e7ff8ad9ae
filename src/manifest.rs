//! Compiled-asset manifest.
//!
//! Maps logical filenames to their fingerprinted output paths, persisted as
//! JSON in the output directory:
//!
//! ```json
//! {
//!   "app.js": {
//!     "path": "app-5f1c...e2.js",
//!     "digest": "5f1c...e2",
//!     "size": 1024,
//!     "integrity": "sha256-Xxw..."
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::asset::{Asset, Export};
use crate::config::MANIFEST_FILE;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::resolve::ResolveOptions;
use crate::writer::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Fingerprinted path relative to the output directory.
    pub path: String,
    /// Hex digest of the exported content.
    pub digest: String,
    pub size: usize,
    pub integrity: String,
}

impl ManifestEntry {
    fn from_export(export: &Export) -> Self {
        Self {
            path: export.path(),
            digest: export.hexdigest(),
            size: export.size(),
            integrity: export.integrity(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct ManifestData {
    assets: BTreeMap<String, ManifestEntry>,
}

pub struct Manifest<'a> {
    env: Option<&'a Environment>,
    dir: PathBuf,
    filename: String,
    data: ManifestData,
}

impl Manifest<'static> {
    /// Read-only manifest: lookups work, `compile` does not.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Manifest<'static>> {
        Manifest::load_named(dir, MANIFEST_FILE)
    }

    /// Like [`load`](Manifest::load) with a custom file name.
    pub fn load_named(dir: impl Into<PathBuf>, filename: &str) -> Result<Manifest<'static>> {
        let dir = dir.into();
        let path = dir.join(filename);
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ManifestData::default(),
            Err(e) => return Err(Error::io(&path, e)),
        };
        Ok(Manifest {
            env: None,
            dir,
            filename: filename.to_owned(),
            data,
        })
    }
}

impl<'a> Manifest<'a> {
    /// A manifest that can compile, seeded from any manifest already in `dir`.
    pub fn new(env: &'a Environment, dir: impl Into<PathBuf>) -> Result<Self> {
        let loaded = Manifest::load(dir)?;
        Ok(Self {
            env: Some(env),
            dir: loaded.dir,
            filename: loaded.filename,
            data: loaded.data,
        })
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.data.assets.get(name)
    }

    pub fn assets(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.data.assets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.data.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.assets.is_empty()
    }

    /// Export and write every asset matching `names`, plus everything they
    /// link to, and record them.
    ///
    /// Each name may be a logical path or a glob. Returns the written files
    /// relative to the output directory.
    pub fn compile<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Vec<String>> {
        let env = self.env.ok_or_else(|| {
            Error::Config("manifest was loaded without an environment and cannot compile".into())
        })?;

        let mut seen = FxHashSet::default();
        let mut wave: Vec<Asset> = Vec::new();
        for name in names {
            for asset in env.resolve_required(name.as_ref(), &ResolveOptions::default())? {
                if seen.insert(asset.filename().to_owned()) {
                    wave.push(asset);
                }
            }
        }

        let mut written = Vec::new();
        while !wave.is_empty() {
            crate::debug!("manifest"; "compiling {} asset(s)", wave.len());
            let results = wave
                .par_iter()
                .map(|asset| {
                    let files = asset.write(env, &self.dir)?;
                    Ok((asset.export(env)?, files))
                })
                .collect::<Result<Vec<(Arc<Export>, Vec<String>)>>>()?;

            let mut next = Vec::new();
            for (export, files) in results {
                for linked in &export.linked_assets {
                    if seen.insert(linked.clone()) {
                        next.push(env.find_required(linked)?);
                    }
                }
                crate::debug!("manifest"; "{} -> {}", export.filename, export.path());
                self.data
                    .assets
                    .insert(export.filename.clone(), ManifestEntry::from_export(&export));
                written.extend(files);
            }
            wave = next;
        }

        written.sort();
        Ok(written)
    }

    /// Persist to `<dir>/<filename>` atomically.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.data)?;
        write_atomic(&self.path(), &json)
    }

    /// Drop an entry and delete its output file.
    pub fn remove(&mut self, name: &str) -> Result<Option<ManifestEntry>> {
        let Some(entry) = self.data.assets.remove(name) else {
            return Ok(None);
        };
        let file = self.dir.join(&entry.path);
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&file, e)),
        }
        Ok(Some(entry))
    }

    /// Delete the whole output directory and forget every entry.
    pub fn clobber(&mut self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        }
        self.data.assets.clear();
        crate::log!("manifest"; "removed {}", self.dir.display());
        Ok(())
    }
}

impl std::fmt::Debug for Manifest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("dir", &self.dir)
            .field("filename", &self.filename)
            .field("assets", &self.data.assets.len())
            .field("compiles", &self.env.is_some())
            .finish()
    }
}
