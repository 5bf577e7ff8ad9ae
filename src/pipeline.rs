//! Pipeline registry.
//!
//! Per-mime-type configuration of the engines an asset passes through:
//!
//! ```text
//! template* -> charset -> preprocessors -> transformer* -> postprocessors   (process)
//! exporter -> minifier                                                      (export)
//! writers                                                                   (write)
//! ```
//!
//! The defaults live in an immutable [`LazyLock`] value that each
//! environment clones, so registrations are instance-local.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use rustc_hash::FxHashMap;

use crate::asset::Export;
use crate::context::{Context, ProcessData};
use crate::error::Result;
use crate::mime::{Charset, MimeRegistry};
use crate::resolve::match_mime_type;
use crate::writer::FileWriter;

/// An engine invoked on a data record: template, preprocessor, transformer,
/// postprocessor, minifier or exporter.
///
/// Engines mutate `data` in place and record dependencies through `ctx`.
pub trait Processor: Send + Sync {
    /// Identity used by `unregister_*`.
    fn name(&self) -> &str;

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()>;
}

/// Writes an exported asset under an output directory.
pub trait Writer: Send + Sync {
    fn name(&self) -> &str;

    /// Mime patterns (`*/*`, `text/*`, exact) this writer applies to.
    fn mime_types(&self) -> Vec<String>;

    /// Returns the relative filenames produced.
    fn call(&self, output_dir: &Path, export: &Export) -> Result<Vec<String>>;
}

/// Wrap a closure as a [`Processor`].
pub fn processor_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Processor>
where
    F: Fn(&Context<'_>, &mut ProcessData) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor {
        name: name.into(),
        f,
    })
}

struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Context<'_>, &mut ProcessData) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()> {
        (self.f)(ctx, data)
    }
}

/// A transformer and the mime type it produces.
#[derive(Clone)]
pub struct Transformer {
    pub target: String,
    pub engine: Arc<dyn Processor>,
}

#[derive(Clone)]
struct WriterEntry {
    mime_type: String,
    writer: Arc<dyn Writer>,
    /// Every mime type the writer declared when it was registered.
    registered_with: Vec<String>,
}

type Engines = FxHashMap<String, Arc<dyn Processor>>;
type EngineLists = FxHashMap<String, Vec<Arc<dyn Processor>>>;

#[derive(Clone)]
pub struct PipelineConfig {
    mime_types: MimeRegistry,
    templates: Engines,
    preprocessors: EngineLists,
    transformers: FxHashMap<String, Transformer>,
    postprocessors: EngineLists,
    minifiers: Engines,
    exporters: Engines,
    writers: Vec<WriterEntry>,
}

static DEFAULT_PIPELINE: LazyLock<PipelineConfig> = LazyLock::new(|| {
    let mut pipeline = PipelineConfig::empty(MimeRegistry::builtin());
    pipeline.register_writer(Arc::new(FileWriter));
    pipeline
});

impl Default for PipelineConfig {
    fn default() -> Self {
        DEFAULT_PIPELINE.clone()
    }
}

impl PipelineConfig {
    fn empty(mime_types: MimeRegistry) -> Self {
        Self {
            mime_types,
            templates: FxHashMap::default(),
            preprocessors: FxHashMap::default(),
            transformers: FxHashMap::default(),
            postprocessors: FxHashMap::default(),
            minifiers: FxHashMap::default(),
            exporters: FxHashMap::default(),
            writers: Vec::new(),
        }
    }

    /// Drop every engine registration, keeping mime types and extensions.
    pub fn clear(&mut self) {
        let mime_types = std::mem::take(&mut self.mime_types);
        *self = Self::empty(mime_types);
    }

    pub fn mime_types(&self) -> &MimeRegistry {
        &self.mime_types
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    pub fn register_mime_type(&mut self, name: &str, extensions: &[&str], charset: Charset) {
        self.mime_types.register(name, extensions, charset);
    }

    pub fn register_template(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.templates.insert(mime_type.to_owned(), engine);
    }

    pub fn unregister_template(&mut self, mime_type: &str) {
        self.templates.remove(mime_type);
    }

    pub fn register_preprocessor(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.preprocessors
            .entry(mime_type.to_owned())
            .or_default()
            .push(engine);
    }

    /// Remove preprocessors for `mime_type`: one engine by name, or all of them.
    pub fn unregister_preprocessor(&mut self, mime_type: &str, name: Option<&str>) {
        remove_from_list(&mut self.preprocessors, mime_type, name);
    }

    /// At most one transformer per source type; the last registration wins.
    pub fn register_transformer(&mut self, from: &str, to: &str, engine: Arc<dyn Processor>) {
        self.transformers.insert(
            from.to_owned(),
            Transformer {
                target: to.to_owned(),
                engine,
            },
        );
    }

    pub fn unregister_transformer(&mut self, from: &str) {
        self.transformers.remove(from);
    }

    pub fn register_postprocessor(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.postprocessors
            .entry(mime_type.to_owned())
            .or_default()
            .push(engine);
    }

    pub fn unregister_postprocessor(&mut self, mime_type: &str, name: Option<&str>) {
        remove_from_list(&mut self.postprocessors, mime_type, name);
    }

    pub fn register_minifier(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.minifiers.insert(mime_type.to_owned(), engine);
    }

    pub fn unregister_minifier(&mut self, mime_type: &str) {
        self.minifiers.remove(mime_type);
    }

    pub fn register_exporter(&mut self, mime_type: &str, engine: Arc<dyn Processor>) {
        self.exporters.insert(mime_type.to_owned(), engine);
    }

    pub fn unregister_exporter(&mut self, mime_type: &str) {
        self.exporters.remove(mime_type);
    }

    /// Register a writer under every mime type it declares.
    pub fn register_writer(&mut self, writer: Arc<dyn Writer>) {
        let declared = writer.mime_types();
        for mime_type in &declared {
            self.writers.push(WriterEntry {
                mime_type: mime_type.clone(),
                writer: Arc::clone(&writer),
                registered_with: declared.clone(),
            });
        }
    }

    /// Remove writers named `name`.
    ///
    /// `mime_type` limits removal to one registered pattern;
    /// `registered_with` limits it to registrations made with exactly that
    /// set of declared mime types.
    pub fn unregister_writer(
        &mut self,
        name: &str,
        mime_type: Option<&str>,
        registered_with: Option<&[&str]>,
    ) {
        self.writers.retain(|entry| {
            let matches = entry.writer.name() == name
                && mime_type.is_none_or(|m| entry.mime_type == m)
                && registered_with.is_none_or(|set| same_set(&entry.registered_with, set));
            !matches
        });
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub fn template(&self, mime_type: &str) -> Option<&Arc<dyn Processor>> {
        self.templates.get(mime_type)
    }

    pub fn preprocessors(&self, mime_type: &str) -> &[Arc<dyn Processor>] {
        self.preprocessors.get(mime_type).map_or(&[], Vec::as_slice)
    }

    pub fn transformer(&self, mime_type: &str) -> Option<&Transformer> {
        self.transformers.get(mime_type)
    }

    pub fn postprocessors(&self, mime_type: &str) -> &[Arc<dyn Processor>] {
        self.postprocessors.get(mime_type).map_or(&[], Vec::as_slice)
    }

    pub fn minifier(&self, mime_type: &str) -> Option<&Arc<dyn Processor>> {
        self.minifiers.get(mime_type)
    }

    pub fn exporter(&self, mime_type: &str) -> Option<&Arc<dyn Processor>> {
        self.exporters.get(mime_type)
    }

    pub fn has_template(&self, mime_type: &str) -> bool {
        self.templates.contains_key(mime_type)
    }

    /// Writers whose pattern matches `mime_type`, registration order, each once.
    pub fn writers_for(&self, mime_type: &str) -> Vec<Arc<dyn Writer>> {
        let mut found: Vec<Arc<dyn Writer>> = Vec::new();
        for entry in &self.writers {
            if match_mime_type(mime_type, &entry.mime_type)
                && !found.iter().any(|w| Arc::ptr_eq(w, &entry.writer))
            {
                found.push(Arc::clone(&entry.writer));
            }
        }
        found
    }

    /// Source types that have a transformer, with their targets.
    pub(crate) fn transformer_targets(&self) -> impl Iterator<Item = (&str, &str)> {
        self.transformers
            .iter()
            .map(|(from, t)| (from.as_str(), t.target.as_str()))
    }

    pub(crate) fn template_types(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

fn remove_from_list(lists: &mut EngineLists, mime_type: &str, name: Option<&str>) {
    match name {
        None => {
            lists.remove(mime_type);
        }
        Some(name) => {
            if let Some(list) = lists.get_mut(mime_type) {
                list.retain(|engine| engine.name() != name);
                if list.is_empty() {
                    lists.remove(mime_type);
                }
            }
        }
    }
}

fn same_set(registered: &[String], wanted: &[&str]) -> bool {
    registered.len() == wanted.len() && wanted.iter().all(|w| registered.iter().any(|r| r == w))
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn names(map: &Engines) -> Vec<(&str, &str)> {
            let mut v: Vec<_> = map.iter().map(|(k, e)| (k.as_str(), e.name())).collect();
            v.sort_unstable();
            v
        }
        f.debug_struct("PipelineConfig")
            .field("mime_types", &self.mime_types.iter().count())
            .field("templates", &names(&self.templates))
            .field("transformers", &self.transformer_targets().collect::<Vec<_>>())
            .field("minifiers", &names(&self.minifiers))
            .field("exporters", &names(&self.exporters))
            .field(
                "writers",
                &self
                    .writers
                    .iter()
                    .map(|w| (w.mime_type.as_str(), w.writer.name()))
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::types;
    use crate::testing::noop;

    struct NamedWriter(&'static str, Vec<&'static str>);

    impl Writer for NamedWriter {
        fn name(&self) -> &str {
            self.0
        }

        fn mime_types(&self) -> Vec<String> {
            self.1.iter().map(|s| (*s).to_owned()).collect()
        }

        fn call(&self, _: &Path, _: &Export) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_defaults_have_file_writer_only() {
        let pipeline = PipelineConfig::default();
        let writers = pipeline.writers_for(types::JAVASCRIPT);
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].name(), "file");
        assert!(pipeline.template(types::ERB).is_none());
    }

    #[test]
    fn test_instances_do_not_share_registrations() {
        let mut a = PipelineConfig::default();
        let b = PipelineConfig::default();
        a.register_template(types::ERB, noop("erb"));
        assert!(a.template(types::ERB).is_some());
        assert!(b.template(types::ERB).is_none());
        assert!(PipelineConfig::default().template(types::ERB).is_none());
    }

    #[test]
    fn test_preprocessors_keep_order_and_unregister_by_name() {
        let mut pipeline = PipelineConfig::default();
        pipeline.register_preprocessor(types::CSS, noop("a"));
        pipeline.register_preprocessor(types::CSS, noop("b"));
        pipeline.register_preprocessor(types::CSS, noop("c"));

        let names: Vec<_> = pipeline.preprocessors(types::CSS).iter().map(|p| p.name().to_owned()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        pipeline.unregister_preprocessor(types::CSS, Some("b"));
        let names: Vec<_> = pipeline.preprocessors(types::CSS).iter().map(|p| p.name().to_owned()).collect();
        assert_eq!(names, ["a", "c"]);

        pipeline.unregister_preprocessor(types::CSS, None);
        assert!(pipeline.preprocessors(types::CSS).is_empty());
    }

    #[test]
    fn test_last_transformer_wins() {
        let mut pipeline = PipelineConfig::default();
        pipeline.register_transformer(types::SCSS, types::CSS, noop("sass"));
        pipeline.register_transformer(types::SCSS, types::PLAIN, noop("other"));
        let t = pipeline.transformer(types::SCSS).unwrap();
        assert_eq!(t.target, types::PLAIN);
        assert_eq!(t.engine.name(), "other");
    }

    #[test]
    fn test_writer_fans_out_and_unregisters_selectively() {
        let mut pipeline = PipelineConfig::default();
        pipeline.register_writer(Arc::new(NamedWriter("gz", vec!["text/*", types::JAVASCRIPT])));
        pipeline.register_writer(Arc::new(NamedWriter("gz", vec![types::SVG])));

        assert_eq!(pipeline.writers_for(types::CSS).len(), 2);
        assert_eq!(pipeline.writers_for(types::SVG).len(), 2);
        assert_eq!(pipeline.writers_for(types::PNG).len(), 1);

        pipeline.unregister_writer("gz", Some("text/*"), None);
        assert_eq!(pipeline.writers_for(types::CSS).len(), 1);
        assert_eq!(pipeline.writers_for(types::JAVASCRIPT).len(), 2);

        pipeline.unregister_writer("gz", None, Some(&[types::SVG]));
        assert_eq!(pipeline.writers_for(types::SVG).len(), 1);
        assert_eq!(pipeline.writers_for(types::JAVASCRIPT).len(), 2);

        pipeline.unregister_writer("gz", None, None);
        assert_eq!(pipeline.writers_for(types::JAVASCRIPT).len(), 1);
    }

    #[test]
    fn test_clear_keeps_mime_types() {
        let mut pipeline = PipelineConfig::default();
        pipeline.register_mime_type("text/x-foo", &[".foo"], Charset::Unicode);
        pipeline.register_template(types::ERB, noop("erb"));
        pipeline.clear();

        assert!(pipeline.template(types::ERB).is_none());
        assert!(pipeline.writers_for(types::CSS).is_empty());
        assert_eq!(pipeline.mime_types().for_extension(".foo"), Some("text/x-foo"));
    }
}
