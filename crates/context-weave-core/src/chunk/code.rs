//! AST-aware chunking with tree-sitter.
//!
//! Top-level syntactic units (functions, classes, structs, traits, impl
//! blocks, modules, type declarations) become one chunk each, carrying
//! their symbol name, signature, and enclosing scope. Comments and
//! attributes immediately preceding a unit are kept with it. Anything
//! between units (imports, constants, statements) is collected into gap
//! chunks.
//!
//! Size handling:
//!
//! - A container (class, impl, trait, module) that fits in `max_chars` is
//!   a single chunk. A larger one emits a header chunk and is descended
//!   into, with its members scoped to the container (`impl Foo`).
//! - Any other unit larger than `max_chars` is split at statement
//!   boundaries, each part starting with up to `overlap_chars` of the
//!   previous part's trailing statements. All parts keep the unit's
//!   metadata and get a `part` index.
//!
//! A file with syntax errors returns `Err`, and the caller falls back to
//! the sliding-window chunker.

use tree_sitter::{Node, Parser};

use super::{pack, window, ChunkerConfig, Language, Span};

const MAX_SIGNATURE_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Leaf,
    Container,
}

/// A recognized syntactic unit.
struct Unit<'t> {
    /// Node whose range is the unit (an `export` or decorator wrapper, if any).
    outer: Node<'t>,
    symbol: String,
    /// Scope label given to members when a container is descended into.
    label: Option<String>,
    /// Scope override for units whose scope is not lexical (Go methods).
    scope: Option<String>,
    body: Option<Node<'t>>,
    shape: Shape,
}

struct Ctx<'a> {
    lang: Language,
    src: &'a str,
    max: usize,
    overlap: usize,
    config: &'a ChunkerConfig,
}

/// Split `content` into spans along syntactic unit boundaries.
pub fn split(lang: Language, content: &str, config: &ChunkerConfig) -> Result<Vec<Span>, String> {
    let mut parser = Parser::new();
    parser
        .set_language(&lang.grammar())
        .map_err(|e| format!("grammar: {}", e))?;
    let tree = parser
        .parse(content, None)
        .ok_or_else(|| "parser returned no tree".to_string())?;
    let root = tree.root_node();
    if root.has_error() {
        return Err("syntax error".to_string());
    }

    let ctx = Ctx {
        lang,
        src: content,
        max: config.max_chars(),
        overlap: config.overlap_chars(),
        config,
    };
    let mut out = Vec::new();
    walk_members(&ctx, root, None, &mut out);
    Ok(out)
}

fn is_leading_trivia(kind: &str) -> bool {
    matches!(
        kind,
        "comment" | "line_comment" | "block_comment" | "attribute_item" | "decorator"
    )
}

/// Walk the named children of `parent`, emitting units and gap spans.
fn walk_members(ctx: &Ctx, parent: Node, scope: Option<&str>, out: &mut Vec<Span>) {
    let mut cursor = parent.walk();
    let children: Vec<Node> = parent.named_children(&mut cursor).collect();

    let mut gap: Option<(usize, usize)> = None;
    let mut lead: Option<(usize, usize)> = None;

    for child in children {
        if is_leading_trivia(child.kind()) {
            lead = Some(match lead {
                Some((s, _)) => (s, child.end_byte()),
                None => (child.start_byte(), child.end_byte()),
            });
            continue;
        }
        match classify(child, ctx.lang, ctx.src) {
            Some(unit) => {
                if let Some((s, e)) = gap.take() {
                    emit_gap(ctx, s, e, scope, out);
                }
                let start = lead.take().map(|(s, _)| s).unwrap_or(unit.outer.start_byte());
                emit_unit(ctx, &unit, start, scope, out);
            }
            None => {
                let start = lead.take().map(|(s, _)| s).unwrap_or(child.start_byte());
                gap = Some(match gap {
                    Some((s, _)) => (s, child.end_byte()),
                    None => (start, child.end_byte()),
                });
            }
        }
    }

    if let Some((ls, le)) = lead {
        gap = Some(match gap {
            Some((s, _)) => (s, le),
            None => (ls, le),
        });
    }
    if let Some((s, e)) = gap {
        emit_gap(ctx, s, e, scope, out);
    }
}

fn emit_gap(ctx: &Ctx, start: usize, end: usize, scope: Option<&str>, out: &mut Vec<Span>) {
    for (s, e) in window::split_range(ctx.src, start, end, ctx.config) {
        out.push(Span {
            scope: scope.map(str::to_string),
            ..Span::plain(s, e)
        });
    }
}

fn emit_unit(ctx: &Ctx, unit: &Unit, start: usize, scope: Option<&str>, out: &mut Vec<Span>) {
    let end = unit.outer.end_byte();
    let scope = unit.scope.as_deref().or(scope);
    let template = Span {
        start,
        end,
        symbol: Some(unit.symbol.clone()),
        signature: signature(unit, ctx.src),
        scope: scope.map(str::to_string),
        heading: None,
        part: 0,
    };

    if end - start <= ctx.max {
        out.push(template);
        return;
    }

    if let (Shape::Container, Some(body)) = (unit.shape, unit.body) {
        let mut cursor = body.walk();
        let header_end = body
            .named_children(&mut cursor)
            .next()
            .map(|n| n.start_byte())
            .unwrap_or(body.end_byte());
        let header_end = trim_end(ctx.src, start, header_end);
        push_parts(ctx, &template, &[(start, header_end)], out);
        walk_members(ctx, body, unit.label.as_deref(), out);
        return;
    }

    let segments = statement_segments(unit.body.unwrap_or(unit.outer), start, end);
    if segments.len() < 2 {
        let ranges = window::split_range(ctx.src, start, end, ctx.config);
        push_parts(ctx, &template, &ranges, out);
        return;
    }
    let parts = pack(&segments, ctx.max, ctx.overlap);
    push_parts(ctx, &template, &parts, out);
}

/// Emit one span per range with the unit's metadata, hard-windowing any
/// range that is still oversized. Part indices run across all emitted spans.
fn push_parts(ctx: &Ctx, template: &Span, ranges: &[(usize, usize)], out: &mut Vec<Span>) {
    let mut part = 0u32;
    for &(s, e) in ranges {
        let pieces = if e - s > ctx.max {
            window::split_range(ctx.src, s, e, ctx.config)
        } else {
            vec![(s, e)]
        };
        for (ps, pe) in pieces {
            out.push(Span {
                start: ps,
                end: pe,
                part,
                ..template.clone()
            });
            part += 1;
        }
    }
}

/// Statement ranges of a unit body. The first segment is stretched back to
/// the unit start and the last forward to its end, so the parts together
/// cover the whole unit.
fn statement_segments(container: Node, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut node = container;
    loop {
        let mut cursor = node.walk();
        let named: Vec<Node> = node.named_children(&mut cursor).collect();
        // Some grammars wrap statements in one list node (Go's statement_list).
        if named.len() == 1 && named[0].named_child_count() >= 2 {
            node = named[0];
            continue;
        }
        let mut segments: Vec<(usize, usize)> = named
            .iter()
            .map(|n| (n.start_byte(), n.end_byte()))
            .filter(|(s, e)| e > s && *s >= start && *e <= end)
            .collect();
        if let Some(first) = segments.first_mut() {
            first.0 = start;
        }
        if let Some(last) = segments.last_mut() {
            last.1 = end;
        }
        return segments;
    }
}

fn trim_end(src: &str, start: usize, mut end: usize) -> usize {
    while end > start && src.as_bytes()[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    end
}

/// Unit header up to its body, whitespace-collapsed.
fn signature(unit: &Unit, src: &str) -> Option<String> {
    let start = unit.outer.start_byte();
    let raw = match unit.body {
        Some(body) if body.start_byte() > start => &src[start..body.start_byte()],
        _ => {
            let text = &src[start..unit.outer.end_byte()];
            let cut = text.find(['{', '\n']).unwrap_or(text.len());
            &text[..cut]
        }
    };
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, MAX_SIGNATURE_CHARS))
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => s[..i].to_string(),
        None => s.to_string(),
    }
}

fn field_text(node: Node, field: &str, src: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| src[n.byte_range()].to_string())
}

fn leaf<'t>(outer: Node<'t>, symbol: String, body: Option<Node<'t>>) -> Unit<'t> {
    Unit {
        outer,
        symbol,
        label: None,
        scope: None,
        body,
        shape: Shape::Leaf,
    }
}

fn container<'t>(outer: Node<'t>, symbol: String, label: String, body: Option<Node<'t>>) -> Unit<'t> {
    Unit {
        outer,
        symbol,
        label: Some(label),
        scope: None,
        body,
        shape: Shape::Container,
    }
}

fn classify<'t>(node: Node<'t>, lang: Language, src: &str) -> Option<Unit<'t>> {
    match lang {
        Language::Rust => classify_rust(node, src),
        Language::Python => classify_python(node, src),
        Language::JavaScript | Language::TypeScript | Language::Tsx => classify_js(node, src),
        Language::Go => classify_go(node, src),
    }
}

fn classify_rust<'t>(node: Node<'t>, src: &str) -> Option<Unit<'t>> {
    let body = node.child_by_field_name("body");
    match node.kind() {
        "function_item" | "function_signature_item" | "struct_item" | "enum_item"
        | "union_item" | "type_item" | "const_item" | "static_item" | "macro_definition" => {
            Some(leaf(node, field_text(node, "name", src)?, body))
        }
        "trait_item" => {
            let name = field_text(node, "name", src)?;
            let label = format!("trait {}", name);
            Some(container(node, name, label, body))
        }
        "impl_item" => {
            let ty = field_text(node, "type", src)?;
            let label = match field_text(node, "trait", src) {
                Some(tr) => format!("impl {} for {}", tr, ty),
                None => format!("impl {}", ty),
            };
            Some(container(node, ty, label, body))
        }
        "mod_item" => {
            let name = field_text(node, "name", src)?;
            match body {
                Some(_) => {
                    let label = format!("mod {}", name);
                    Some(container(node, name, label, body))
                }
                None => Some(leaf(node, name, None)),
            }
        }
        _ => None,
    }
}

fn classify_python<'t>(node: Node<'t>, src: &str) -> Option<Unit<'t>> {
    match node.kind() {
        "function_definition" => Some(leaf(
            node,
            field_text(node, "name", src)?,
            node.child_by_field_name("body"),
        )),
        "class_definition" => {
            let name = field_text(node, "name", src)?;
            let label = format!("class {}", name);
            Some(container(node, name, label, node.child_by_field_name("body")))
        }
        "decorated_definition" => {
            let inner = node.child_by_field_name("definition")?;
            let mut unit = classify_python(inner, src)?;
            unit.outer = node;
            Some(unit)
        }
        _ => None,
    }
}

fn classify_js<'t>(node: Node<'t>, src: &str) -> Option<Unit<'t>> {
    let body = node.child_by_field_name("body");
    match node.kind() {
        "function_declaration"
        | "generator_function_declaration"
        | "method_definition"
        | "interface_declaration"
        | "type_alias_declaration"
        | "enum_declaration" => Some(leaf(node, field_text(node, "name", src)?, body)),
        "class_declaration" | "abstract_class_declaration" => {
            let name = field_text(node, "name", src)?;
            let label = format!("class {}", name);
            Some(container(node, name, label, body))
        }
        "export_statement" => {
            let inner = node.child_by_field_name("declaration")?;
            let mut unit = classify_js(inner, src)?;
            unit.outer = node;
            Some(unit)
        }
        "lexical_declaration" | "variable_declaration" => {
            let mut cursor = node.walk();
            let declarator = node
                .named_children(&mut cursor)
                .find(|n| n.kind() == "variable_declarator")?;
            let value = declarator.child_by_field_name("value")?;
            if !matches!(
                value.kind(),
                "arrow_function" | "function_expression" | "function"
            ) {
                return None;
            }
            Some(leaf(
                node,
                field_text(declarator, "name", src)?,
                value.child_by_field_name("body"),
            ))
        }
        _ => None,
    }
}

fn classify_go<'t>(node: Node<'t>, src: &str) -> Option<Unit<'t>> {
    let body = node.child_by_field_name("body");
    match node.kind() {
        "function_declaration" => Some(leaf(node, field_text(node, "name", src)?, body)),
        "method_declaration" => {
            let mut unit = leaf(node, field_text(node, "name", src)?, body);
            unit.scope = field_text(node, "receiver", src)
                .and_then(|r| go_receiver_type(&r))
                .map(|t| format!("type {}", t));
            Some(unit)
        }
        "type_declaration" => {
            let mut cursor = node.walk();
            let spec = node
                .named_children(&mut cursor)
                .find(|n| n.kind() == "type_spec" || n.kind() == "type_alias")?;
            Some(leaf(node, field_text(spec, "name", src)?, None))
        }
        _ => None,
    }
}

/// `(s *Server[T])` → `Server`.
fn go_receiver_type(receiver: &str) -> Option<String> {
    let inner = receiver
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();
    let ty = inner
        .split_once(char::is_whitespace)
        .map(|(_, t)| t.trim())
        .unwrap_or(inner);
    let ty = ty.trim_start_matches('*');
    let ty = ty.split('[').next().unwrap_or(ty);
    if ty.is_empty() {
        None
    } else {
        Some(ty.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: 25,
            overlap_tokens: 5,
        }
    }

    fn text<'a>(src: &'a str, s: &Span) -> &'a str {
        &src[s.start..s.end]
    }

    const RUST_SRC: &str = r#"use std::fmt;

/// A point.
pub struct Point {
    x: f64,
    y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}
"#;

    #[test]
    fn test_rust_units_fit() {
        let spans = split(Language::Rust, RUST_SRC, &ChunkerConfig::default()).unwrap();
        let symbols: Vec<_> = spans.iter().map(|s| s.symbol.as_deref()).collect();
        assert_eq!(symbols, vec![None, Some("Point"), Some("Point")]);
        assert_eq!(text(RUST_SRC, &spans[0]), "use std::fmt;");
        assert!(text(RUST_SRC, &spans[1]).starts_with("/// A point."));
        assert_eq!(spans[2].signature.as_deref(), Some("impl Point"));
    }

    #[test]
    fn test_rust_large_impl_descends() {
        let spans = split(Language::Rust, RUST_SRC, &small()).unwrap();
        let norm = spans
            .iter()
            .find(|s| s.symbol.as_deref() == Some("norm"))
            .expect("norm chunk");
        assert_eq!(norm.scope.as_deref(), Some("impl Point"));
        assert_eq!(norm.signature.as_deref(), Some("pub fn norm(&self) -> f64"));
        let header = spans
            .iter()
            .find(|s| s.symbol.as_deref() == Some("Point") && text(RUST_SRC, s).starts_with("impl"))
            .expect("impl header");
        assert_eq!(text(RUST_SRC, header), "impl Point {");
    }

    #[test]
    fn test_oversized_function_split_with_overlap() {
        let mut src = String::from("fn big() {\n");
        for i in 0..30 {
            src.push_str(&format!("    let a{:02} = {};\n", i, i));
        }
        src.push_str("}\n");

        let spans = split(Language::Rust, &src, &small()).unwrap();
        assert!(spans.len() > 1);
        for (i, s) in spans.iter().enumerate() {
            assert_eq!(s.symbol.as_deref(), Some("big"));
            assert_eq!(s.part, i as u32);
            assert!(s.end - s.start <= 100);
        }
        for pair in spans.windows(2) {
            assert!(pair[1].start < pair[0].end, "parts should overlap");
        }
        assert!(text(&src, spans.last().unwrap()).ends_with('}'));
    }

    #[test]
    fn test_syntax_error_is_err() {
        assert!(split(Language::Rust, "fn broken( {\n let x = ;\n", &small()).is_err());
    }

    #[test]
    fn test_python_class_members_scoped() {
        let src = r#"import os


class Greeter:
    """Says hello."""

    def __init__(self, name):
        self.name = name

    def greet(self):
        return "hello " + self.name


def main():
    Greeter("x").greet()
"#;
        let spans = split(Language::Python, src, &small()).unwrap();
        let greet = spans
            .iter()
            .find(|s| s.symbol.as_deref() == Some("greet"))
            .expect("greet chunk");
        assert_eq!(greet.scope.as_deref(), Some("class Greeter"));
        let main = spans
            .iter()
            .find(|s| s.symbol.as_deref() == Some("main"))
            .expect("main chunk");
        assert_eq!(main.scope, None);
        assert!(spans.iter().any(|s| text(src, s) == "import os"));
    }

    #[test]
    fn test_go_method_receiver_scope() {
        let src = "package main\n\ntype Server struct {\n\tport int\n}\n\nfunc (s *Server) Start() error {\n\treturn nil\n}\n";
        let spans = split(Language::Go, src, &ChunkerConfig::default()).unwrap();
        let start = spans
            .iter()
            .find(|s| s.symbol.as_deref() == Some("Start"))
            .expect("Start chunk");
        assert_eq!(start.scope.as_deref(), Some("type Server"));
        assert!(spans.iter().any(|s| s.symbol.as_deref() == Some("Server")));
    }

    #[test]
    fn test_typescript_export_function() {
        let src = "export function handle(req: Request): Response {\n  return new Response();\n}\n";
        let spans = split(Language::TypeScript, src, &ChunkerConfig::default()).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].symbol.as_deref(), Some("handle"));
        assert_eq!(
            spans[0].signature.as_deref(),
            Some("export function handle(req: Request): Response")
        );
    }

    #[test]
    fn test_go_receiver_type() {
        assert_eq!(go_receiver_type("(s *Server)"), Some("Server".into()));
        assert_eq!(go_receiver_type("(c Cache[K, V])"), Some("Cache".into()));
    }
}
