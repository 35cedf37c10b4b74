//! Java syntax layer.
//!
//! Wraps tree-sitter-java: parsing into a [`SourceUnit`], span conversion and
//! the small node helpers the resolver and recognizers share. Declaration
//! lookup lives in [`symbols`].

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};

use tree_sitter::{Node, Tree};

use crate::{AnalysisError, Location, Result};

pub mod symbols;

pub use symbols::{Binding, Declaration, Symbols};

thread_local! {
    static JAVA_PARSER: RefCell<tree_sitter::Parser> = RefCell::new({
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_java::LANGUAGE.into())
            .expect("tree-sitter-java grammar incompatible with tree-sitter version");
        parser
    });
}

/// Type declarations that own members.
pub const TYPE_DECLARATIONS: &[&str] = &[
    "class_declaration",
    "interface_declaration",
    "enum_declaration",
    "record_declaration",
];

/// One parsed Java compilation unit.
pub struct SourceUnit {
    path: PathBuf,
    source: String,
    tree: Tree,
}

impl fmt::Debug for SourceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceUnit")
            .field("path", &self.path)
            .field("len", &self.source.len())
            .finish_non_exhaustive()
    }
}

impl SourceUnit {
    /// Parse Java source text. Syntax errors still produce a tree; only a
    /// parser failure is reported as an error.
    pub fn parse(path: impl Into<PathBuf>, source: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let source = source.into();
        let tree = JAVA_PARSER.with(|parser| parser.borrow_mut().parse(&source, None));
        match tree {
            Some(tree) => {
                if tree.root_node().has_error() {
                    tracing::debug!("Syntax errors in {}", path.display());
                }
                Ok(Self { path, source, tree })
            }
            None => Err(AnalysisError::ParseError { path }),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(path, source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    pub fn has_syntax_errors(&self) -> bool {
        self.tree.root_node().has_error()
    }

    pub fn text(&self, node: Node<'_>) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    pub fn location(&self, node: Node<'_>) -> Location {
        node_to_location(&self.path, &node)
    }
}

/// Convert a tree-sitter node to a Location (1-indexed).
pub fn node_to_location(file: &Path, node: &Node) -> Location {
    let start = node.start_position();
    let end = node.end_position();
    Location::with_end(
        file.to_path_buf(),
        (start.row + 1) as u32,
        (start.column + 1) as u32,
        (end.row + 1) as u32,
        (end.column + 1) as u32,
    )
}

/// Find a child node by its kind.
pub fn find_child_by_kind<'t>(node: &Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find(|child| child.kind() == kind);
    found
}

/// Named children without comments.
pub fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    let children = node
        .named_children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect();
    children
}

/// Pre-order traversal of `node` and all of its descendants.
pub fn for_each_descendant<'t>(node: Node<'t>, mut visit: impl FnMut(Node<'t>)) {
    let mut cursor = node.walk();
    'outer: loop {
        visit(cursor.node());
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.node().id() == node.id() {
                break 'outer;
            }
            if cursor.goto_next_sibling() {
                continue 'outer;
            }
            if !cursor.goto_parent() {
                break 'outer;
            }
        }
    }
}

/// Nearest ancestor whose kind is one of `kinds`.
pub fn enclosing<'t>(node: Node<'t>, kinds: &[&str]) -> Option<Node<'t>> {
    let mut current = node.parent();
    while let Some(n) = current {
        if kinds.contains(&n.kind()) {
            return Some(n);
        }
        current = n.parent();
    }
    None
}

/// Strip parentheses and casts, which never change a value's shape.
pub fn unwrap_expression(node: Node<'_>) -> Node<'_> {
    let mut current = node;
    loop {
        match current.kind() {
            "parenthesized_expression" => match named_children(current).into_iter().next() {
                Some(inner) => current = inner,
                None => return current,
            },
            "cast_expression" => match current.child_by_field_name("value") {
                Some(inner) => current = inner,
                None => return current,
            },
            _ => return current,
        }
    }
}

/// Argument expressions of a method invocation or object creation.
pub fn call_arguments(call: Node<'_>) -> Vec<Node<'_>> {
    call.child_by_field_name("arguments")
        .map(named_children)
        .unwrap_or_default()
}

/// The `variable_declarator`s of a local or field declaration.
pub fn declarators(declaration: Node<'_>) -> Vec<Node<'_>> {
    named_children(declaration)
        .into_iter()
        .filter(|child| child.kind() == "variable_declarator")
        .collect()
}

/// Whether a declaration carries a keyword modifier such as `static` or `final`.
pub fn has_modifier(declaration: Node<'_>, keyword: &str) -> bool {
    let Some(modifiers) = find_child_by_kind(&declaration, "modifiers") else {
        return false;
    };
    let mut cursor = modifiers.walk();
    let found = modifiers
        .children(&mut cursor)
        .any(|child| child.kind() == keyword);
    found
}

/// Annotations on a declaration, in source order.
pub fn annotations(declaration: Node<'_>) -> Vec<Node<'_>> {
    find_child_by_kind(&declaration, "modifiers")
        .map(|modifiers| {
            named_children(modifiers)
                .into_iter()
                .filter(|child| matches!(child.kind(), "annotation" | "marker_annotation"))
                .collect()
        })
        .unwrap_or_default()
}

/// Simple name of an annotation (`org.x.Query` -> `Query`).
pub fn annotation_name<'s>(unit: &'s SourceUnit, annotation: Node<'_>) -> &'s str {
    let name = annotation
        .child_by_field_name("name")
        .map(|n| unit.text(n))
        .unwrap_or("");
    name.rsplit('.').next().unwrap_or(name)
}

pub fn find_annotation<'t>(
    unit: &SourceUnit,
    declaration: Node<'t>,
    name: &str,
) -> Option<Node<'t>> {
    annotations(declaration)
        .into_iter()
        .find(|annotation| annotation_name(unit, *annotation) == name)
}

/// Value of an annotation attribute. A lone positional argument is `value`.
pub fn annotation_argument<'t>(
    unit: &SourceUnit,
    annotation: Node<'t>,
    key: &str,
) -> Option<Node<'t>> {
    let arguments = annotation.child_by_field_name("arguments")?;
    for child in named_children(arguments) {
        if child.kind() == "element_value_pair" {
            let matches = child
                .child_by_field_name("key")
                .is_some_and(|k| unit.text(k) == key);
            if matches {
                return child.child_by_field_name("value");
            }
        } else if key == "value" {
            return Some(child);
        }
    }
    None
}

/// Decode a Java string literal or text block, including escapes.
pub fn decode_string_literal(text: &str) -> Option<String> {
    if let Some(body) = text
        .strip_prefix("\"\"\"")
        .and_then(|t| t.strip_suffix("\"\"\""))
    {
        return Some(unescape(&strip_text_block_indent(body)));
    }
    let body = text.strip_prefix('"')?.strip_suffix('"')?;
    Some(unescape(body))
}

pub fn decode_char_literal(text: &str) -> Option<char> {
    let body = text.strip_prefix('\'')?.strip_suffix('\'')?;
    unescape(body).chars().next()
}

fn strip_text_block_indent(body: &str) -> String {
    // The opening delimiter line is not content.
    let content = match body.find('\n') {
        Some(idx) => &body[idx + 1..],
        None => body,
    };
    let lines: Vec<&str> = content.split('\n').collect();
    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|line| {
            let stripped = line.get(indent..).unwrap_or_else(|| line.trim_start());
            stripped.trim_end()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('s') => out.push(' '),
            Some('0') => out.push('\0'),
            Some('u') => {
                let hex: String = chars.by_ref().skip_while(|c| *c == 'u').take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            // Line continuation inside text blocks
            Some('\n') => {}
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse an integer literal: decimal, hex, octal or binary, with `_` and `L`.
pub fn parse_int_literal(text: &str) -> Option<i64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let digits = cleaned.trim_end_matches(&['l', 'L'][..]);
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    if let Some(bin) = digits
        .strip_prefix("0b")
        .or_else(|| digits.strip_prefix("0B"))
    {
        return u64::from_str_radix(bin, 2).ok().map(|v| v as i64);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return i64::from_str_radix(&digits[1..], 8).ok();
    }
    digits.parse().ok()
}

pub fn parse_float_literal(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    cleaned
        .trim_end_matches(&['f', 'F', 'd', 'D'][..])
        .parse()
        .ok()
}
