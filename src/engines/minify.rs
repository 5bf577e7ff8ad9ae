//! Minifiers for the export stage.
//!
//! Uses oxc for JavaScript and lightningcss for CSS. Input that fails to
//! parse is an [`Error::Syntax`] with the position of the first error.

use lightningcss::stylesheet::{ParserOptions, PrinterOptions, StyleSheet};
use oxc::allocator::Allocator;
use oxc::codegen::{Codegen, CodegenOptions, CommentOptions};
use oxc::mangler::MangleOptions;
use oxc::minifier::{CompressOptions, Minifier, MinifierOptions};
use oxc::parser::Parser;
use oxc::span::SourceType;

use crate::context::{Context, ProcessData};
use crate::error::Error;
use crate::pipeline::Processor;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsMinifier;

impl JsMinifier {
    pub fn minify(filename: &str, source: &str) -> crate::Result<String> {
        let allocator = Allocator::default();
        let source_type = SourceType::mjs();
        let ret = Parser::new(&allocator, source, source_type).parse();
        if let Some(error) = ret.errors.first() {
            let err = Error::syntax(filename, error.message.to_string());
            let offset = error
                .labels
                .as_ref()
                .and_then(|labels| labels.first())
                .map(|label| label.offset());
            return Err(match offset {
                Some(offset) => {
                    let (line, column) = line_column(source, offset);
                    err.at(line, column)
                }
                None => err,
            });
        }

        let mut program = ret.program;
        let options = MinifierOptions {
            mangle: Some(MangleOptions::default()),
            compress: Some(CompressOptions::smallest()),
        };
        let ret = Minifier::new(options).minify(&allocator, &mut program);
        let code = Codegen::new()
            .with_options(CodegenOptions {
                minify: true,
                comments: CommentOptions::disabled(),
                ..CodegenOptions::default()
            })
            .with_scoping(ret.scoping)
            .build(&program)
            .code;
        Ok(code)
    }
}

impl Processor for JsMinifier {
    fn name(&self) -> &str {
        "oxc"
    }

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()> {
        let code = Self::minify(ctx.filename(), data.source_str()?)?;
        data.set_source(code);
        data.map = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CssMinifier;

impl CssMinifier {
    pub fn minify(filename: &str, source: &str) -> crate::Result<String> {
        let options = ParserOptions {
            filename: filename.to_owned(),
            ..ParserOptions::default()
        };
        let stylesheet = StyleSheet::parse(source, options).map_err(|e| {
            let err = Error::syntax(filename, e.kind.to_string());
            match &e.loc {
                // lightningcss lines are zero-based
                Some(loc) => err.at(loc.line as usize + 1, loc.column as usize),
                None => err,
            }
        })?;

        let result = stylesheet
            .to_css(PrinterOptions {
                minify: true,
                ..PrinterOptions::default()
            })
            .map_err(|e| Error::syntax(filename, e.kind.to_string()))?;
        Ok(result.code)
    }
}

impl Processor for CssMinifier {
    fn name(&self) -> &str {
        "lightningcss"
    }

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()> {
        let code = Self::minify(ctx.filename(), data.source_str()?)?;
        data.set_source(code);
        data.map = None;
        Ok(())
    }
}

/// One-based line and column of a byte offset.
fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let before = &source.as_bytes()[..offset.min(source.len())];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let column = before.iter().rev().take_while(|&&b| b != b'\n').count() + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::types;
    use crate::testing::Fixture;
    use std::sync::Arc;

    #[test]
    fn test_minify_js() {
        let out = JsMinifier::minify("a.js", "const x = 1;\n// note\nconsole.log(x);").unwrap();
        assert!(!out.contains("note"));
        assert!(out.len() < 30);
        assert!(out.contains("console.log"));
    }

    #[test]
    fn test_minify_css() {
        let out = CssMinifier::minify("a.css", "a {\n  color: red;\n}\n").unwrap();
        assert_eq!(out, "a{color:red}");
    }

    #[test]
    fn test_js_syntax_error_has_location() {
        let err = JsMinifier::minify("bad.js", "let a = 1;\nlet = ;").unwrap_err();
        match err {
            Error::Syntax {
                filename, line, ..
            } => {
                assert_eq!(filename, "bad.js");
                assert_eq!(line, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_css_syntax_error() {
        let err = CssMinifier::minify("bad.css", "a{color:red}\n!!! { color: blue }").unwrap_err();
        assert!(matches!(err, Error::Syntax { ref filename, .. } if filename == "bad.css"));
    }

    #[test]
    fn test_line_column() {
        assert_eq!(line_column("ab\ncd", 0), (1, 1));
        assert_eq!(line_column("ab\ncd", 4), (2, 2));
        assert_eq!(line_column("ab", 10), (1, 3));
    }

    #[test]
    fn test_minifiers_in_export() {
        let mut fx = Fixture::new();
        fx.write("site.css", "body {\n  margin: 0;\n}\n");
        fx.env.register_minifier(types::CSS, Arc::new(CssMinifier));

        let asset = fx.env.find_required("site.css").unwrap();
        assert_eq!(asset.process(&fx.env).unwrap().source_str(), Some("body {\n  margin: 0;\n}\n"));
        assert_eq!(asset.export(&fx.env).unwrap().source_str(), Some("body{margin:0}"));
    }

    #[test]
    fn test_minifier_failure_is_not_cached() {
        let mut fx = Fixture::new();
        fx.write("app.js", "function (");
        fx.env.register_minifier(types::JAVASCRIPT, Arc::new(JsMinifier));

        let asset = fx.env.find_required("app.js").unwrap();
        assert!(matches!(asset.export(&fx.env), Err(Error::Syntax { .. })));
        assert!(!asset.is_exported());
    }
}
