//! Build cache: resolve memoization plus inverted dependency indices.
//!
//! ```text
//! map_cache       query key -> resolved candidates
//! lookup_cache    query key -> found (processed) assets
//! process_deps    token     -> assets whose process result used it
//! export_deps     token     -> assets whose export result used it
//! ```
//!
//! All four maps sit behind one lock shared with the watch thread. Every
//! change batch bumps a generation counter; a result computed across a bump
//! is returned to its caller but not memoized.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::asset::Asset;
use crate::context::GLOB_TOKEN;
use crate::error::Result;
use crate::path::relative_logical;
use crate::watch::{ChangeListener, ChangeSet};

type Index = FxHashMap<String, Vec<Asset>>;

#[derive(Default)]
pub struct BuildCache {
    roots: RwLock<Vec<PathBuf>>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    generation: u64,
    map_cache: FxHashMap<String, Vec<Asset>>,
    lookup_cache: FxHashMap<String, Vec<Asset>>,
    process_dependencies: Index,
    export_dependencies: Index,
}

/// Dependency tokens of one asset, read before the cache lock is taken.
struct Tracked {
    asset: Asset,
    process: BTreeSet<String>,
    export: BTreeSet<String>,
}

impl Tracked {
    fn new(asset: &Asset) -> Self {
        Self {
            asset: asset.clone(),
            process: asset.process_dependencies(),
            export: asset.export_dependencies(),
        }
    }
}

impl BuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root paths used to turn added files into coarse query keys.
    pub(crate) fn set_roots(&self, roots: Vec<PathBuf>) {
        *self.roots.write() = roots;
    }

    /// Memoize a resolution under `key`.
    ///
    /// The computation runs without the lock held; errors are not memoized.
    pub fn map<F>(&self, key: &str, compute: F) -> Result<Vec<Asset>>
    where
        F: FnOnce() -> Result<Vec<Asset>>,
    {
        let generation = {
            let state = self.state.lock();
            if let Some(assets) = state.map_cache.get(key) {
                return Ok(assets.clone());
            }
            state.generation
        };

        let assets = compute()?;

        let mut state = self.state.lock();
        if state.generation == generation {
            state.map_cache.insert(key.to_owned(), assets.clone());
        } else {
            crate::debug!("cache"; "files changed while resolving {}, not memoizing", key);
        }
        Ok(assets)
    }

    pub fn get(&self, key: &str) -> Option<Vec<Asset>> {
        self.state.lock().lookup_cache.get(key).cloned()
    }

    /// Register a lookup result and index every dependency of its assets.
    pub fn insert(&self, key: &str, assets: Vec<Asset>) {
        let tracked: Vec<Tracked> = assets.iter().map(Tracked::new).collect();
        let mut state = self.state.lock();
        state.lookup_cache.insert(key.to_owned(), assets);
        for entry in tracked {
            state.track(entry);
        }
    }

    /// Read-through lookup.
    pub fn fetch<F>(&self, key: &str, compute: F) -> Result<Vec<Asset>>
    where
        F: FnOnce() -> Result<Vec<Asset>>,
    {
        let generation = {
            let state = self.state.lock();
            if let Some(assets) = state.lookup_cache.get(key) {
                return Ok(assets.clone());
            }
            state.generation
        };

        let assets = compute()?;

        let tracked: Vec<Tracked> = assets.iter().map(Tracked::new).collect();
        let mut state = self.state.lock();
        if state.generation == generation {
            state.lookup_cache.insert(key.to_owned(), assets.clone());
            for entry in tracked {
                state.track(entry);
            }
        } else {
            crate::debug!("cache"; "files changed while looking up {}, not memoizing", key);
        }
        Ok(assets)
    }

    /// Index the asset under every process and export dependency it has,
    /// replacing whatever was indexed for it before.
    pub fn track(&self, asset: &Asset) {
        let tracked = Tracked::new(asset);
        self.state.lock().track(tracked);
    }

    /// Assets whose process result depends on `token`.
    pub fn dependents(&self, token: &str) -> Vec<Asset> {
        let state = self.state.lock();
        state
            .process_dependencies
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_cached(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.map_cache.contains_key(key) || state.lookup_cache.contains_key(key)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        *state = State {
            generation,
            ..State::default()
        };
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    pub fn apply_changes(&self, changes: &ChangeSet) {
        let roots = self.roots.read().clone();
        let mut state = self.state.lock();
        state.generation += 1;

        for path in &changes.removed {
            state.mark_dirty(&path_token(path));
            state.mark_glob_dependents(path);
            state.purge(path);
        }

        for path in &changes.added {
            state.mark_dirty(&path_token(path));
            state.mark_glob_dependents(path);

            let coarse = coarse_keys(path, &roots);
            crate::debug!("cache"; "added {}, evicting {:?}", path.display(), coarse);
            state.evict(|key| {
                key.contains("**") || coarse.iter().any(|prefix| key.starts_with(prefix.as_str()))
            });
        }

        for path in &changes.modified {
            state.mark_dirty(&path_token(path));
        }

        crate::debug_do! {
            let indexed: usize = state.process_dependencies.values().map(Vec::len).sum();
            crate::debug!(
                "cache";
                "after {} change(s): {} queries, {} lookups, {} indexed dependents",
                changes.len(),
                state.map_cache.len(),
                state.lookup_cache.len(),
                indexed
            );
        }
    }
}

impl State {
    /// Whether a cached query result still holds this very handle.
    fn is_live(&self, asset: &Asset) -> bool {
        self.map_cache
            .values()
            .chain(self.lookup_cache.values())
            .flatten()
            .any(|cached| cached.same(asset))
    }

    /// Re-index `entry`. Its previous tokens are dropped, as are orphaned
    /// handles of the same logical asset that no cached result refers to.
    fn track(&mut self, entry: Tracked) {
        let Tracked {
            asset,
            process,
            export,
        } = entry;

        let live: Vec<Asset> = self
            .map_cache
            .values()
            .chain(self.lookup_cache.values())
            .flatten()
            .filter(|cached| **cached == asset && !cached.same(&asset))
            .cloned()
            .collect();
        self.forget(|indexed| {
            indexed.same(&asset)
                || (*indexed == asset && !live.iter().any(|l| l.same(indexed)))
        });

        for token in process {
            add_dependent(&mut self.process_dependencies, token, &asset);
        }
        for token in export {
            add_dependent(&mut self.export_dependencies, token, &asset);
        }
    }

    /// Drop matching handles from both dependency indices.
    fn forget(&mut self, drop: impl Fn(&Asset) -> bool) {
        for index in [&mut self.process_dependencies, &mut self.export_dependencies] {
            index.retain(|_, assets| {
                assets.retain(|a| !drop(a));
                !assets.is_empty()
            });
        }
    }

    /// Remove every query result whose key is `stale`, then unindex the
    /// assets only those results held.
    fn evict(&mut self, stale: impl Fn(&str) -> bool) {
        let mut evicted: Vec<Asset> = Vec::new();
        for cache in [&mut self.map_cache, &mut self.lookup_cache] {
            cache.retain(|key, assets| {
                if stale(key.as_str()) {
                    evicted.append(assets);
                    false
                } else {
                    true
                }
            });
        }
        if evicted.is_empty() {
            return;
        }
        evicted.retain(|asset| !self.is_live(asset));
        self.forget(|indexed| evicted.iter().any(|e| e.same(indexed)));
    }
    /// Flag dependents of `token` so their next process/export recomputes.
    fn mark_dirty(&self, token: &str) {
        if let Some(assets) = self.process_dependencies.get(token) {
            for asset in assets {
                crate::debug!("cache"; "reprocess {} ({})", asset.filename(), token);
                asset.needs_reprocessing();
            }
        }
        if let Some(assets) = self.export_dependencies.get(token) {
            for asset in assets {
                asset.needs_reexporting();
            }
        }
    }

    /// Flag dependents of every `glob:` token whose pattern matches `path`.
    fn mark_glob_dependents(&self, path: &Path) {
        let matching: Vec<&String> = self
            .process_dependencies
            .keys()
            .chain(self.export_dependencies.keys())
            .filter(|token| {
                token
                    .strip_prefix(GLOB_TOKEN)
                    .and_then(|pattern| glob::Pattern::new(pattern).ok())
                    .is_some_and(|pattern| pattern.matches_path(path))
            })
            .collect();
        for token in matching {
            self.mark_dirty(token);
        }
    }

    /// Drop every cached result sourced from `path` and its index entries.
    fn purge(&mut self, path: &Path) {
        let from_path = |assets: &Vec<Asset>| assets.iter().any(|a| a.source_file() == path);
        self.map_cache.retain(|_, assets| !from_path(assets));
        self.lookup_cache.retain(|_, assets| !from_path(assets));

        let token = path_token(path);
        for index in [&mut self.process_dependencies, &mut self.export_dependencies] {
            index.remove(&token);
            index.retain(|_, assets| {
                assets.retain(|a| a.source_file() != path);
                !assets.is_empty()
            });
        }
    }
}

fn add_dependent(index: &mut Index, token: String, asset: &Asset) {
    let dependents = index.entry(token).or_default();
    if !dependents.iter().any(|a| a.same(asset)) {
        dependents.push(asset.clone());
    }
}

fn path_token(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Query-key prefixes a new file can affect: its path up to the first
/// extension, and its directory glob. Computed relative to every root
/// containing the file, and for the absolute path.
fn coarse_keys(path: &Path, roots: &[PathBuf]) -> Vec<String> {
    let mut logical: Vec<String> = roots
        .iter()
        .filter_map(|root| relative_logical(path, root))
        .collect();
    logical.push(path_token(path));

    let mut keys = Vec::new();
    for name in logical {
        let (dir, file) = match name.rsplit_once('/') {
            Some((dir, file)) => (Some(dir), file),
            None => (None, name.as_str()),
        };
        let stem = match file.find('.') {
            Some(dot) if dot > 0 => &file[..dot],
            _ => file,
        };
        let prefix = |s: &str| match dir {
            Some(dir) => format!("{dir}/{s}"),
            None => s.to_owned(),
        };
        keys.push(prefix(stem));
        keys.push(prefix("*"));
    }
    keys
}

impl ChangeListener for BuildCache {
    fn on_change(&self, changes: &ChangeSet) {
        self.apply_changes(changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::types;
    use crate::testing::Fixture;

    fn asset(root: &Path, name: &str) -> Asset {
        Asset::new(
            name.to_owned(),
            vec![types::JAVASCRIPT.to_owned()],
            root.join(name),
            root.to_path_buf(),
        )
    }

    #[test]
    fn test_coarse_keys() {
        let roots = vec![PathBuf::from("/srv/assets")];
        let keys = coarse_keys(Path::new("/srv/assets/models/c.js.erb"), &roots);
        assert!(keys.contains(&"models/c".to_owned()));
        assert!(keys.contains(&"models/*".to_owned()));
        assert!(keys.contains(&"/srv/assets/models/c".to_owned()));

        let keys = coarse_keys(Path::new("/srv/assets/app.js"), &roots);
        assert_eq!(&keys[..2], ["app", "*"]);
    }

    #[test]
    fn test_map_memoizes() {
        let cache = BuildCache::new();
        let root = Path::new("/srv");
        let mut calls = 0;
        for _ in 0..2 {
            let found = cache
                .map("app@js", || {
                    calls += 1;
                    Ok(vec![asset(root, "app.js")])
                })
                .unwrap();
            assert_eq!(found.len(), 1);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_added_file_evicts_matching_queries() {
        let cache = BuildCache::new();
        let root = PathBuf::from("/srv");
        cache.set_roots(vec![root.clone()]);
        cache.map("models/*@application/javascript", || Ok(Vec::new())).unwrap();
        cache.map("models/a@application/javascript", || Ok(Vec::new())).unwrap();
        cache.map("other/*@application/javascript", || Ok(Vec::new())).unwrap();
        cache.map("**/*@*/*", || Ok(Vec::new())).unwrap();

        cache.apply_changes(&ChangeSet {
            added: vec![root.join("models/c.js")],
            ..ChangeSet::default()
        });

        assert!(!cache.is_cached("models/*@application/javascript"));
        assert!(!cache.is_cached("**/*@*/*"));
        assert!(cache.is_cached("models/a@application/javascript"));
        assert!(cache.is_cached("other/*@application/javascript"));
    }

    #[test]
    fn test_removed_file_is_purged() {
        let fx = Fixture::new();
        fx.write("a.js", "a");
        fx.write("b.js", "b");
        let a = fx.env.find_required("a.js").unwrap();
        fx.env.find_required("b.js").unwrap();

        let token = path_token(a.source_file());
        assert_eq!(fx.env.build_cache().dependents(&token).len(), 1);

        std::fs::remove_file(a.source_file()).unwrap();
        fx.env.build_cache().apply_changes(&ChangeSet {
            removed: vec![a.source_file().to_path_buf()],
            ..ChangeSet::default()
        });

        assert!(fx.env.build_cache().dependents(&token).is_empty());
        assert!(!a.is_processed());
        assert!(fx.env.find("a.js").unwrap().is_none());
        assert!(fx.env.find("b.js").unwrap().is_some());
    }

    #[test]
    fn test_modified_file_marks_dependents_dirty() {
        let fx = Fixture::new();
        fx.write("a.js", "a");
        let a = fx.env.find_required("a.js").unwrap();
        assert!(a.is_processed());

        fx.write("a.js", "changed");
        fx.env.build_cache().apply_changes(&ChangeSet {
            modified: vec![a.source_file().to_path_buf()],
            ..ChangeSet::default()
        });

        assert!(!a.is_processed());
        let again = fx.env.find_required("a.js").unwrap();
        assert!(again.same(&a));
        assert_eq!(again.process(&fx.env).unwrap().source_str(), Some("changed"));
    }

    #[test]
    fn test_track_dedups_handles() {
        let fx = Fixture::new();
        fx.write("a.js", "a");
        let a = fx.env.find_required("a.js").unwrap();
        fx.env.build_cache().track(&a);
        fx.env.build_cache().track(&a);
        let token = path_token(a.source_file());
        assert_eq!(fx.env.build_cache().dependents(&token).len(), 1);
    }

    #[test]
    fn test_change_during_map_is_not_memoized() {
        let cache = BuildCache::new();
        let root = PathBuf::from("/srv");
        cache.set_roots(vec![root.clone()]);
        let added = ChangeSet {
            added: vec![root.join("models/c.js")],
            ..ChangeSet::default()
        };

        let found = cache
            .map("models/*@application/javascript", || {
                cache.apply_changes(&added);
                Ok(Vec::new())
            })
            .unwrap();
        assert!(found.is_empty());
        assert!(!cache.is_cached("models/*@application/javascript"));

        cache.map("models/*@application/javascript", || Ok(Vec::new())).unwrap();
        assert!(cache.is_cached("models/*@application/javascript"));
    }

    #[test]
    fn test_change_during_fetch_is_not_memoized() {
        let cache = BuildCache::new();
        let root = Path::new("/srv");
        let a = asset(root, "a.js");

        let found = cache
            .fetch("a@application/javascript", || {
                cache.apply_changes(&ChangeSet {
                    modified: vec![root.join("a.js")],
                    ..ChangeSet::default()
                });
                Ok(vec![a.clone()])
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(cache.get("a@application/javascript").is_none());
    }

    #[test]
    fn test_evicted_handles_leave_the_index() {
        let fx = Fixture::new();
        fx.write("a.js", "a");
        let token = path_token(&fx.root.join("a.js"));

        for _ in 0..5 {
            fx.env.find_required("a.js").unwrap();
            let added = fx.write("a.txt", "x");
            fx.env.build_cache().apply_changes(&ChangeSet {
                added: vec![added],
                ..ChangeSet::default()
            });
        }
        assert!(fx.env.build_cache().dependents(&token).is_empty());

        let a = fx.env.find_required("a.js").unwrap();
        let dependents = fx.env.build_cache().dependents(&token);
        assert_eq!(dependents.len(), 1);
        assert!(dependents[0].same(&a));
    }

    #[test]
    fn test_track_replaces_previous_tokens() {
        let mut fx = Fixture::new();
        fx.write("a.js", "uses-b");
        let b = fx.write("b.js", "b");
        fx.env.register_preprocessor(
            types::JAVASCRIPT,
            crate::pipeline::processor_fn("deps", |ctx, data| {
                if data.source_str()?.contains("uses-b") {
                    ctx.depends_on(data, "b.js")?;
                }
                Ok(())
            }),
        );

        let a = fx.env.find_required("a.js").unwrap();
        let b_token = path_token(&b);
        assert!(fx.env.build_cache().dependents(&b_token).iter().any(|d| d.same(&a)));

        fx.write("a.js", "plain");
        fx.env.build_cache().apply_changes(&ChangeSet {
            modified: vec![a.source_file().to_path_buf()],
            ..ChangeSet::default()
        });
        a.process(&fx.env).unwrap();

        assert!(fx.env.build_cache().dependents(&b_token).is_empty());
        let own = fx.env.build_cache().dependents(&path_token(a.source_file()));
        assert_eq!(own.len(), 1);
    }
}
