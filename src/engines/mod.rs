//! Built-in engines.
//!
//! Nothing here is registered by default; pick what a pipeline needs:
//!
//! ```ignore
//! env.register_minifier("application/javascript", Arc::new(JsMinifier));
//! env.register_minifier("text/css", Arc::new(CssMinifier));
//! env.register_preprocessor("application/javascript", Arc::new(JsImportLinker));
//! ```

mod exec;
mod js_imports;
mod minify;

pub use exec::CommandProcessor;
pub use js_imports::{ImportKind, ImportSpecifier, JsImportLinker, JsImportScanner};
pub use minify::{CssMinifier, JsMinifier};
