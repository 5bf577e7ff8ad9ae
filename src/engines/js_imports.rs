//! JavaScript import scanning.
//!
//! A small lexer that finds module specifiers without parsing the program:
//!
//! ```text
//! import x from "./a.js"        static
//! import "./side-effect.js"     static
//! export { y } from "./b.js"    export
//! import("./lazy.js")           dynamic
//! ```
//!
//! Strings, comments, template literals (with nested `${}`), and regex
//! literals are skipped as opaque, so quoted text that merely looks like an
//! import is never reported.

use std::ops::Range;

use crate::context::{Context, ProcessData};
use crate::pipeline::Processor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Static,
    Export,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpecifier {
    pub specifier: String,
    /// Byte range of the specifier text, quotes excluded.
    pub span: Range<usize>,
    pub kind: ImportKind,
}

impl ImportSpecifier {
    /// `./x` or `../x`.
    pub fn is_relative(&self) -> bool {
        self.specifier.starts_with("./") || self.specifier.starts_with("../")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Str(u8),
    Template,
    Regex { in_class: bool },
}

/// Lexical context that `}` returns to.
#[derive(Debug, Clone, Copy)]
enum Frame {
    Brace,
    Interpolation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String, Range<usize>),
    Punct(u8),
}

/// What the previous tokens have set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    /// Saw `import`, next token decides static vs dynamic.
    Import,
    /// Inside `import ... from` / `export ... from`.
    Clause(ImportKind),
    /// Saw `from` in a clause, a string completes it.
    From(ImportKind),
    /// Saw `import(`.
    DynamicOpen,
}

/// Scans a source for import specifiers, in source order.
pub struct JsImportScanner<'a> {
    src: &'a [u8],
    pos: usize,
    state: State,
    frames: Vec<Frame>,
    /// Start offset of the string being lexed.
    string_start: usize,
    prev: Option<Token>,
    pending: Pending,
    found: Vec<ImportSpecifier>,
}

impl<'a> JsImportScanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            state: State::Code,
            frames: Vec::new(),
            string_start: 0,
            prev: None,
            pending: Pending::None,
            found: Vec::new(),
        }
    }

    pub fn scan(mut self) -> Vec<ImportSpecifier> {
        while self.pos < self.src.len() {
            let byte = self.src[self.pos];
            match self.state {
                State::Code => self.code(byte),
                State::LineComment => {
                    if byte == b'\n' {
                        self.state = State::Code;
                    }
                    self.pos += 1;
                }
                State::BlockComment => {
                    if byte == b'*' && self.peek(1) == Some(b'/') {
                        self.state = State::Code;
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                }
                State::Str(quote) => match byte {
                    b'\\' => self.pos += 2,
                    b'\n' => {
                        // Unterminated; resync on the next line
                        self.state = State::Code;
                        self.pos += 1;
                    }
                    _ if byte == quote => {
                        let span = self.string_start..self.pos;
                        self.pos += 1;
                        self.state = State::Code;
                        let value = unescape(&self.src[span.clone()]);
                        self.token(Token::Str(value, span));
                    }
                    _ => self.pos += 1,
                },
                State::Template => match byte {
                    b'\\' => self.pos += 2,
                    b'`' => {
                        self.pos += 1;
                        self.state = State::Code;
                        self.prev = Some(Token::Punct(b'`'));
                    }
                    b'$' if self.peek(1) == Some(b'{') => {
                        self.pos += 2;
                        self.frames.push(Frame::Interpolation);
                        self.state = State::Code;
                        self.prev = Some(Token::Punct(b'{'));
                    }
                    _ => self.pos += 1,
                },
                State::Regex { in_class } => {
                    match byte {
                        b'\\' => self.pos += 1,
                        b'[' => self.state = State::Regex { in_class: true },
                        b']' => self.state = State::Regex { in_class: false },
                        b'/' if !in_class => {
                            self.state = State::Code;
                            self.prev = Some(Token::Punct(b'/'));
                        }
                        b'\n' => self.state = State::Code,
                        _ => {}
                    }
                    self.pos += 1;
                }
            }
        }
        self.found
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn code(&mut self, byte: u8) {
        match byte {
            b'/' if self.peek(1) == Some(b'/') => {
                self.state = State::LineComment;
                self.pos += 2;
            }
            b'/' if self.peek(1) == Some(b'*') => {
                self.state = State::BlockComment;
                self.pos += 2;
            }
            b'/' if self.regex_allowed() => {
                self.state = State::Regex { in_class: false };
                self.pos += 1;
            }
            b'\'' | b'"' => {
                self.state = State::Str(byte);
                self.pos += 1;
                self.string_start = self.pos;
            }
            b'`' => {
                self.state = State::Template;
                self.pos += 1;
                self.pending = Pending::None;
            }
            b'{' => {
                self.frames.push(Frame::Brace);
                self.pos += 1;
                self.token(Token::Punct(b'{'));
            }
            b'}' => {
                self.pos += 1;
                match self.frames.pop() {
                    Some(Frame::Interpolation) => self.state = State::Template,
                    Some(Frame::Brace) | None => self.token(Token::Punct(b'}')),
                }
            }
            _ if is_ident_start(byte) => {
                let start = self.pos;
                while self.pos < self.src.len() && is_ident_part(self.src[self.pos]) {
                    self.pos += 1;
                }
                let word = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.token(Token::Ident(word));
            }
            _ if byte.is_ascii_digit() => {
                while self.pos < self.src.len() && is_ident_part(self.src[self.pos]) {
                    self.pos += 1;
                }
                self.token(Token::Ident(String::new()));
            }
            _ if byte.is_ascii_whitespace() => self.pos += 1,
            _ => {
                self.pos += 1;
                self.token(Token::Punct(byte));
            }
        }
    }

    /// A `/` starts a regex unless it follows something that ends an operand.
    fn regex_allowed(&self) -> bool {
        match &self.prev {
            None => true,
            Some(Token::Punct(b')' | b']' | b'}' | b'`' | b'/')) => false,
            Some(Token::Punct(_)) => true,
            Some(Token::Str(..)) => false,
            Some(Token::Ident(word)) => matches!(
                word.as_str(),
                "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void"
                    | "throw" | "case" | "do" | "else" | "yield" | "await"
            ),
        }
    }

    fn token(&mut self, token: Token) {
        let member = matches!(self.prev, Some(Token::Punct(b'.')));
        self.pending = match (self.pending, &token) {
            (_, Token::Ident(word)) if word == "import" && !member => Pending::Import,
            (_, Token::Ident(word)) if word == "export" && !member => {
                Pending::Clause(ImportKind::Export)
            }

            (Pending::Import, Token::Punct(b'(')) => Pending::DynamicOpen,
            (Pending::Import, Token::Punct(b'.')) => Pending::None,
            (Pending::Import, Token::Str(value, span)) => {
                self.record(value, span, ImportKind::Static);
                Pending::None
            }
            (Pending::Import, _) => Pending::Clause(ImportKind::Static),

            (Pending::DynamicOpen, Token::Str(value, span)) => {
                self.record(value, span, ImportKind::Dynamic);
                Pending::None
            }

            (Pending::Clause(kind), Token::Ident(word)) if word == "from" => Pending::From(kind),
            (Pending::Clause(_), Token::Ident(word)) if ends_export_clause(word) => Pending::None,
            (Pending::Clause(_), Token::Punct(b';' | b'(' | b'=')) => Pending::None,
            (Pending::Clause(kind), _) => Pending::Clause(kind),

            (Pending::From(kind), Token::Str(value, span)) => {
                self.record(value, span, kind);
                Pending::None
            }

            _ => Pending::None,
        };
        self.prev = Some(token);
    }

    fn record(&mut self, value: &str, span: &Range<usize>, kind: ImportKind) {
        self.found.push(ImportSpecifier {
            specifier: value.to_owned(),
            span: span.clone(),
            kind,
        });
    }
}

/// Declarations that make an `export` local, not a re-export.
fn ends_export_clause(word: &str) -> bool {
    matches!(
        word,
        "const" | "let" | "var" | "function" | "class" | "default" | "async" | "enum"
            | "interface" | "type"
    )
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte == b'$' || byte >= 0x80
}

fn is_ident_part(byte: u8) -> bool {
    is_ident_start(byte) || byte.is_ascii_digit()
}

fn unescape(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b == b'\\' {
            if let Some(&next) = bytes.next() {
                out.push(next);
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Preprocessor that links every relative import as an asset.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsImportLinker;

impl Processor for JsImportLinker {
    fn name(&self) -> &str {
        "js-imports"
    }

    fn call(&self, ctx: &Context<'_>, data: &mut ProcessData) -> anyhow::Result<()> {
        let imports = JsImportScanner::new(data.source_str()?).scan();
        for import in imports.iter().filter(|i| i.is_relative()) {
            ctx.link_asset(data, &import.specifier)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mime::types;
    use crate::testing::Fixture;
    use std::sync::Arc;

    fn specifiers(source: &str) -> Vec<(String, ImportKind)> {
        JsImportScanner::new(source)
            .scan()
            .into_iter()
            .map(|i| (i.specifier, i.kind))
            .collect()
    }

    fn s(value: &str, kind: ImportKind) -> (String, ImportKind) {
        (value.to_owned(), kind)
    }

    #[test]
    fn test_static_forms() {
        let src = r#"
import a from "./a.js";
import { b, c as d } from './b.js'
import * as e from "./e.js";
import "./side.js";
import f, { g } from "pkg";
"#;
        assert_eq!(
            specifiers(src),
            [
                s("./a.js", ImportKind::Static),
                s("./b.js", ImportKind::Static),
                s("./e.js", ImportKind::Static),
                s("./side.js", ImportKind::Static),
                s("pkg", ImportKind::Static),
            ]
        );
    }

    #[test]
    fn test_export_forms() {
        let src = r#"
export { x } from "./x.js";
export * from './all.js';
export const from = "not-an-import";
export function load() { return from("nope"); }
export default "also-not";
"#;
        assert_eq!(
            specifiers(src),
            [s("./x.js", ImportKind::Export), s("./all.js", ImportKind::Export)]
        );
    }

    #[test]
    fn test_dynamic_import() {
        let src = r#"const m = await import("./lazy.js"); obj.import("./no.js"); import.meta.url;"#;
        assert_eq!(specifiers(src), [s("./lazy.js", ImportKind::Dynamic)]);
    }

    #[test]
    fn test_escaped_quotes_stay_inside_string() {
        let src = r#"const q = "say \"import './fake.js'\" now"; const r = 'it\'s import "x"'; import './real.js';"#;
        assert_eq!(specifiers(src), [s("./real.js", ImportKind::Static)]);
    }

    #[test]
    fn test_comments_are_skipped() {
        let src = "// import './one.js'\n/* import './two.js'\n */ import './three.js';";
        assert_eq!(specifiers(src), [s("./three.js", ImportKind::Static)]);
    }

    #[test]
    fn test_nested_template_interpolation() {
        let src = "const t = `a ${ `b ${ import('./inner.js') } import './fake.js'` } ${ {k: 1}.k }`;\nimport './after.js';";
        assert_eq!(
            specifiers(src),
            [s("./inner.js", ImportKind::Dynamic), s("./after.js", ImportKind::Static)]
        );
    }

    #[test]
    fn test_regex_literal_with_quote() {
        let src = r#"const re = /["'`]/g; const d = a / b; import "./ok.js";"#;
        assert_eq!(specifiers(src), [s("./ok.js", ImportKind::Static)]);
    }

    #[test]
    fn test_span_points_at_specifier() {
        let src = "import x from \"./a.js\";";
        let found = JsImportScanner::new(src).scan();
        assert_eq!(found.len(), 1);
        assert_eq!(&src[found[0].span.clone()], "./a.js");
    }

    #[test]
    fn test_linker_records_relative_imports() {
        let mut fx = Fixture::new();
        fx.write("js/app.js", "import { u } from './util.js';\nimport 'react';\n");
        fx.write("js/util.js", "export const u = 1;");
        fx.env
            .register_preprocessor(types::JAVASCRIPT, Arc::new(JsImportLinker));

        let asset = fx.env.find_required("js/app.js").unwrap();
        let processed = asset.process(&fx.env).unwrap();
        assert_eq!(
            processed.linked_assets.iter().collect::<Vec<_>>(),
            ["js/util.js"]
        );
    }

    #[test]
    fn test_linker_missing_import() {
        let mut fx = Fixture::new();
        fx.write("app.js", "import './gone.js';");
        fx.env
            .register_preprocessor(types::JAVASCRIPT, Arc::new(JsImportLinker));

        let err = fx.env.find_required("app.js").unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
