//! Output writers.
//!
//! Every write lands in a temp file beside its target and is renamed over it,
//! so readers never observe a partial file.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::asset::Export;
use crate::error::{Error, Result};
use crate::mime::types;
use crate::pipeline::Writer;

/// Writes the export under its fingerprinted path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileWriter;

impl Writer for FileWriter {
    fn name(&self) -> &str {
        "file"
    }

    fn mime_types(&self) -> Vec<String> {
        vec![types::ANY.to_owned()]
    }

    fn call(&self, output_dir: &Path, export: &Export) -> Result<Vec<String>> {
        let relative = export.path();
        write_atomic(&output_dir.join(&relative), &export.source)?;
        Ok(vec![relative])
    }
}

/// Writes a gzip-compressed sibling (`<path>.gz`) for text-like exports.
#[derive(Debug, Clone, Copy)]
pub struct GzipWriter {
    level: Compression,
}

impl GzipWriter {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipWriter {
    fn default() -> Self {
        Self {
            level: Compression::best(),
        }
    }
}

impl Writer for GzipWriter {
    fn name(&self) -> &str {
        "gzip"
    }

    fn mime_types(&self) -> Vec<String> {
        ["text/*", types::JAVASCRIPT, types::JSON, types::SVG]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn call(&self, output_dir: &Path, export: &Export) -> Result<Vec<String>> {
        let relative = format!("{}.gz", export.path());
        let target = output_dir.join(&relative);

        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(&export.source)
            .map_err(|e| Error::io(&target, e))?;
        let compressed = encoder.finish().map_err(|e| Error::io(&target, e))?;
        write_atomic(&target, &compressed)?;

        Ok(vec![relative])
    }
}

/// Write `bytes` to `path` through a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| Error::io(path, e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}
