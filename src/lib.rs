//! Assetry - resolve logical asset names, run them through per-type engine
//! chains, and emit fingerprinted, cacheable artifacts.
//!
//! ```ignore
//! use assetry::{Environment, Manifest};
//!
//! let env = Environment::with_paths(["app/assets"])?;
//! let asset = env.find_required("application.js")?;
//! println!("{}", asset.export(&env)?.path());
//!
//! let mut manifest = Manifest::new(&env, "public/assets")?;
//! manifest.compile(&["application.js", "*.css"])?;
//! manifest.save()?;
//! ```

pub mod logger;

pub mod asset;
pub mod cache;
pub mod config;
pub mod context;
pub mod digest;
pub mod engines;
pub mod environment;
pub mod error;
pub mod manifest;
pub mod mime;
pub mod path;
pub mod pipeline;
pub mod resolve;
pub mod watch;
pub mod writer;

#[cfg(test)]
mod testing;

pub use asset::{Asset, Export, Processed};
pub use cache::{BuildCache, Cache, CacheStore, FileStore, MemoryStore, NullStore};
pub use config::EnvironmentConfig;
pub use context::{Context, ProcessData};
pub use digest::DigestAlgorithm;
pub use environment::Environment;
pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestEntry};
pub use mime::Charset;
pub use pipeline::{PipelineConfig, Processor, Transformer, Writer, processor_fn};
pub use resolve::ResolveOptions;
pub use watch::{ChangeListener, ChangeSet, WatchBackend, WatchOptions};
pub use writer::{FileWriter, GzipWriter};
