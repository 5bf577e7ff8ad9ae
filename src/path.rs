//! Path decomposition and normalization.
//!
//! Pure functions for splitting logical and filesystem paths into their
//! directory, basename, extension chain and mime-type stack.

use std::path::{Path, PathBuf};

use crate::mime::MimeRegistry;

/// A path split into its directory, basename and extension chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposed {
    /// Directory part, present only when the path contains a separator.
    pub dirname: Option<String>,
    /// File name with all registered extensions removed.
    pub basename: String,
    /// Registered extensions in filename order; `None` for a bare `*`.
    pub extensions: Option<Vec<String>>,
    /// Mime types matching `extensions`, same order.
    pub mime_types: Vec<String>,
}

impl Decomposed {
    /// Whether the basename is the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.basename == "*"
    }
}

/// Split `path` into `(dirname, basename, extensions, mime_types)`.
///
/// `base` re-roots relative (`./`, `../`) paths under a logical directory.
///
/// ```ignore
/// let d = decompose("dir/test.css.scss", None, &registry);
/// assert_eq!(d.extensions, Some(vec![".css".into(), ".scss".into()]));
/// ```
pub fn decompose(path: &str, base: Option<&str>, registry: &MimeRegistry) -> Decomposed {
    let (dirname, segment) = match path.rfind('/') {
        Some(idx) => {
            let dir = if idx == 0 { "/" } else { &path[..idx] };
            (Some(dir.to_owned()), &path[idx + 1..])
        }
        None => (None, path),
    };

    let dirname = match (dirname, base) {
        (Some(dir), Some(base)) if dir == "." || dir == ".." || dir.starts_with("./") || dir.starts_with("../") => {
            Some(clean(&format!("{base}/{dir}")))
        }
        (dir, _) => dir,
    };

    if segment == "*" {
        return Decomposed {
            dirname,
            basename: segment.to_owned(),
            extensions: None,
            mime_types: Vec::new(),
        };
    }

    let mut basename = segment;
    let mut extensions = Vec::new();
    let mut mime_types = Vec::new();

    while let Some((idx, mime)) = longest_extension(basename, registry) {
        extensions.push(basename[idx..].to_owned());
        mime_types.push(mime.to_owned());
        basename = &basename[..idx];
    }

    extensions.reverse();
    mime_types.reverse();

    Decomposed {
        dirname,
        basename: basename.to_owned(),
        extensions: Some(extensions),
        mime_types,
    }
}

/// Find the longest registered extension suffix of `name`.
fn longest_extension<'r>(name: &str, registry: &'r MimeRegistry) -> Option<(usize, &'r str)> {
    name.char_indices()
        .filter(|&(idx, c)| c == '.' && idx > 0)
        .find_map(|(idx, _)| registry.for_extension(&name[idx..]).map(|mime| (idx, mime)))
}

/// Resolve `.` and `..` segments of a `/`-separated logical path.
///
/// Leading `..` segments that would climb above the root are dropped.
pub fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Join a logical directory and file name.
pub fn join(dirname: Option<&str>, name: &str) -> String {
    match dirname {
        Some(dir) if !dir.is_empty() && dir != "." => format!("{}/{name}", dir.trim_end_matches('/')),
        _ => name.to_owned(),
    }
}

/// Strip the final extension of a logical filename (`a/b.min.js` -> `a/b.min`).
pub fn strip_last_extension(filename: &str) -> &str {
    let start = filename.rfind('/').map_or(0, |i| i + 1);
    match filename[start..].rfind('.') {
        Some(dot) if dot > 0 => &filename[..start + dot],
        _ => filename,
    }
}

/// Path of `file` relative to `root`, `/`-separated.
pub fn relative_logical(file: &Path, root: &Path) -> Option<String> {
    let rel = file.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Normalize a file system path to absolute form.
///
/// Tries `canonicalize()` first (resolves symlinks, `.`, `..`).
/// Falls back to:
/// - Return as-is if already absolute
/// - Join with current directory if relative
#[inline]
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
        }
    })
}
