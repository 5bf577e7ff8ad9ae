//! Mime type registry.
//!
//! Maps mime types to their file extensions and charset handling. Every
//! extension is owned by exactly one mime type.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Common mime type names.
pub mod types {
    // Text
    pub const PLAIN: &str = "text/plain";
    pub const HTML: &str = "text/html";
    pub const CSS: &str = "text/css";
    pub const SCSS: &str = "text/scss";
    pub const SASS: &str = "text/sass";
    pub const MARKDOWN: &str = "text/markdown";
    pub const JAVASCRIPT: &str = "application/javascript";
    pub const TYPESCRIPT: &str = "application/typescript";
    pub const JSON: &str = "application/json";
    pub const XML: &str = "application/xml";

    // Templates
    pub const ERB: &str = "application/erb";
    pub const EJS: &str = "application/ejs";

    // Images
    pub const SVG: &str = "image/svg+xml";
    pub const PNG: &str = "image/png";
    pub const JPEG: &str = "image/jpeg";
    pub const GIF: &str = "image/gif";
    pub const WEBP: &str = "image/webp";
    pub const AVIF: &str = "image/avif";
    pub const ICO: &str = "image/x-icon";

    // Fonts
    pub const WOFF: &str = "font/woff";
    pub const WOFF2: &str = "font/woff2";
    pub const TTF: &str = "font/ttf";
    pub const OTF: &str = "font/otf";

    // Binary
    pub const WASM: &str = "application/wasm";
    pub const PDF: &str = "application/pdf";
    pub const OCTET_STREAM: &str = "application/octet-stream";

    /// Matches every mime type.
    pub const ANY: &str = "*/*";
}

/// How source bytes are normalized once templates have run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    /// Binary passthrough (a leading UTF-8 BOM is still dropped).
    #[default]
    Default,
    /// Decode any unicode BOM encoding to UTF-8.
    Unicode,
    /// Unicode plus removal of a leading `@charset` rule.
    Css,
    /// Unicode handling for markup.
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    pub name: String,
    pub extensions: Vec<String>,
    pub charset: Charset,
}

#[derive(Debug, Clone, Default)]
pub struct MimeRegistry {
    types: BTreeMap<String, MimeType>,
    extensions: FxHashMap<String, String>,
}

impl MimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a mime type.
    ///
    /// Extensions are normalized to a leading dot. An extension already owned
    /// by another mime type moves to this one.
    pub fn register(&mut self, name: &str, extensions: &[&str], charset: Charset) {
        let extensions: Vec<String> = extensions.iter().map(|e| normalize_extension(e)).collect();

        for ext in &extensions {
            if let Some(previous) = self.extensions.insert(ext.clone(), name.to_owned())
                && previous != name
                && let Some(owner) = self.types.get_mut(&previous)
            {
                owner.extensions.retain(|e| e != ext);
            }
        }

        if let Some(old) = self.types.get(name) {
            for ext in &old.extensions {
                if !extensions.contains(ext) {
                    self.extensions.remove(ext);
                }
            }
        }

        self.types.insert(
            name.to_owned(),
            MimeType {
                name: name.to_owned(),
                extensions,
                charset,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&MimeType> {
        self.types.get(name)
    }

    /// Mime type owning an extension (`".js"` or `"js"`).
    pub fn for_extension(&self, ext: &str) -> Option<&str> {
        self.extensions
            .get(&normalize_extension(ext))
            .map(String::as_str)
    }

    /// The first registered extension of a mime type.
    pub fn primary_extension(&self, name: &str) -> Option<&str> {
        self.types
            .get(name)
            .and_then(|t| t.extensions.first())
            .map(String::as_str)
    }

    pub fn charset(&self, name: &str) -> Charset {
        self.types.get(name).map(|t| t.charset).unwrap_or_default()
    }

    /// All mime types in name order.
    pub fn iter(&self) -> impl Iterator<Item = &MimeType> {
        self.types.values()
    }

    /// Guess the mime type of a path from its last extension.
    pub fn from_path(&self, path: &std::path::Path) -> &str {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.for_extension(e))
            .unwrap_or(types::OCTET_STREAM)
    }
}

fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_ascii_lowercase()
    } else {
        format!(".{}", ext.to_ascii_lowercase())
    }
}

/// Whether a mime type carries text rather than binary data.
pub fn is_text(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            types::JAVASCRIPT | types::TYPESCRIPT | types::JSON | types::XML | types::SVG
        )
}

impl MimeRegistry {
    /// The registry every environment starts from.
    pub fn builtin() -> Self {
        use Charset::{Css, Default, Html, Unicode};

        let mut registry = Self::new();
        let table: &[(&str, &[&str], Charset)] = &[
            // Web / Text
            (types::PLAIN, &[".txt", ".text"], Unicode),
            (types::HTML, &[".html", ".htm"], Html),
            (types::CSS, &[".css"], Css),
            (types::SCSS, &[".scss"], Css),
            (types::SASS, &[".sass"], Css),
            (types::MARKDOWN, &[".md"], Unicode),
            (types::JAVASCRIPT, &[".js", ".mjs"], Unicode),
            (types::TYPESCRIPT, &[".ts"], Unicode),
            (types::JSON, &[".json"], Unicode),
            (types::XML, &[".xml"], Unicode),
            // Templates
            (types::ERB, &[".erb"], Unicode),
            (types::EJS, &[".ejs"], Unicode),
            // Images
            (types::SVG, &[".svg"], Unicode),
            (types::PNG, &[".png"], Default),
            (types::JPEG, &[".jpg", ".jpeg"], Default),
            (types::GIF, &[".gif"], Default),
            (types::WEBP, &[".webp"], Default),
            (types::AVIF, &[".avif"], Default),
            (types::ICO, &[".ico"], Default),
            // Fonts
            (types::WOFF, &[".woff"], Default),
            (types::WOFF2, &[".woff2"], Default),
            (types::TTF, &[".ttf"], Default),
            (types::OTF, &[".otf"], Default),
            // Binary
            (types::WASM, &[".wasm"], Default),
            (types::PDF, &[".pdf"], Default),
        ];
        for (name, extensions, charset) in table {
            registry.register(name, extensions, *charset);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_for_extension() {
        let registry = MimeRegistry::builtin();
        assert_eq!(registry.for_extension(".js"), Some(types::JAVASCRIPT));
        assert_eq!(registry.for_extension("css"), Some(types::CSS));
        assert_eq!(registry.for_extension(".text"), Some(types::PLAIN));
        assert_eq!(registry.for_extension(".JPEG"), Some(types::JPEG));
        assert_eq!(registry.for_extension(".xyz"), None);
    }

    #[test]
    fn test_from_path() {
        let registry = MimeRegistry::builtin();
        assert_eq!(registry.from_path(&PathBuf::from("app.js")), types::JAVASCRIPT);
        assert_eq!(registry.from_path(&PathBuf::from("logo.png")), types::PNG);
        assert_eq!(
            registry.from_path(&PathBuf::from("unknown.xyz")),
            types::OCTET_STREAM
        );
    }

    #[test]
    fn test_extension_moves_to_new_owner() {
        let mut registry = MimeRegistry::builtin();
        registry.register("text/x-template", &["txt"], Charset::Unicode);

        assert_eq!(registry.for_extension(".txt"), Some("text/x-template"));
        let plain = registry.get(types::PLAIN).unwrap();
        assert_eq!(plain.extensions, vec![".text".to_string()]);
    }

    #[test]
    fn test_reregister_drops_stale_extensions() {
        let mut registry = MimeRegistry::new();
        registry.register("text/x-a", &[".a", ".aa"], Charset::Default);
        registry.register("text/x-a", &[".a"], Charset::Default);
        assert_eq!(registry.for_extension(".aa"), None);
        assert_eq!(registry.for_extension(".a"), Some("text/x-a"));
    }

    #[test]
    fn test_charset_and_primary_extension() {
        let registry = MimeRegistry::builtin();
        assert_eq!(registry.charset(types::CSS), Charset::Css);
        assert_eq!(registry.charset(types::PNG), Charset::Default);
        assert_eq!(registry.charset("nope/nope"), Charset::Default);
        assert_eq!(registry.primary_extension(types::JPEG), Some(".jpg"));
    }

    #[test]
    fn test_is_text() {
        assert!(is_text(types::HTML));
        assert!(is_text(types::JAVASCRIPT));
        assert!(is_text(types::SVG));
        assert!(!is_text(types::PNG));
        assert!(!is_text(types::WOFF2));
    }
}
