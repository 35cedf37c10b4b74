//! Static value resolution.
//!
//! Resolves an expression to a [`ResolvedValue`]:
//! - literals directly, with constant folding for `+ - * /` and unary operators
//! - identifiers through one binding hop (recursively while bindings are static)
//! - class constants in this unit, then through the [`ConstantTable`]
//! - calls to same-unit pure accessors by inlining, bounded by `max_depth`
//! - arrays and collection factories element-wise
//!
//! Resolution never fails: anything that depends on runtime state becomes
//! `Unresolved` with a reason and a span.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use tree_sitter::Node;

use crate::constants::ConstantTable;
use crate::model::{FieldPath, MalformedReason, ResolvedValue, UnresolvedReason, Value};
use crate::syntax::symbols::pure_return;
use crate::syntax::{
    call_arguments, decode_char_literal, decode_string_literal, enclosing, named_children,
    parse_float_literal, parse_int_literal, unwrap_expression, Binding, Declaration, SourceUnit,
    Symbols, TYPE_DECLARATIONS,
};
use crate::Location;

/// Static factories that build a collection from their arguments.
const COLLECTION_FACTORIES: &[(&str, &str)] = &[
    ("Arrays", "asList"),
    ("List", "of"),
    ("Set", "of"),
    ("Collections", "singletonList"),
    ("Collections", "singleton"),
    ("Stream", "of"),
];

/// Parameter bindings of one inlined call.
struct FrameData<'t> {
    id: u32,
    depth: usize,
    method: Node<'t>,
    arguments: Vec<Expr<'t>>,
}

/// An activation of an inlined helper. The root frame binds nothing.
#[derive(Clone, Default)]
pub struct Frame<'t>(Option<Rc<FrameData<'t>>>);

impl<'t> Frame<'t> {
    pub fn root() -> Self {
        Frame(None)
    }

    pub fn depth(&self) -> usize {
        self.0.as_ref().map_or(0, |f| f.depth)
    }

    fn id(&self) -> u32 {
        self.0.as_ref().map_or(0, |f| f.id)
    }
}

/// An expression together with the frame its identifiers resolve in.
#[derive(Clone)]
pub struct Expr<'t> {
    pub node: Node<'t>,
    pub frame: Frame<'t>,
}

impl<'t> Expr<'t> {
    pub fn root(node: Node<'t>) -> Self {
        Self {
            node,
            frame: Frame::root(),
        }
    }

    /// Another node evaluated in the same frame.
    pub fn with_node(&self, node: Node<'t>) -> Self {
        Self {
            node,
            frame: self.frame.clone(),
        }
    }
}

impl fmt::Debug for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expr")
            .field("kind", &self.node.kind())
            .field("range", &self.node.byte_range())
            .field("depth", &self.frame.depth())
            .finish()
    }
}

/// Where one binding hop leads.
pub enum Followed<'t> {
    /// The expression the reference is bound to
    Bound {
        expr: Expr<'t>,
        declared_type: Option<String>,
    },
    /// A varargs parameter bound in an inlined frame
    Variadic(Vec<Expr<'t>>),
    /// A declaration whose value only exists at runtime
    Opaque {
        reason: UnresolvedReason,
        declared_type: Option<String>,
    },
    /// Reassigned or conditionally assigned
    Branching { declared_type: Option<String> },
    /// Not a reference to anything declared in this unit
    NotReference,
}

/// Per-extraction value resolver.
pub struct Resolver<'t> {
    symbols: &'t Symbols<'t>,
    table: &'t ConstantTable,
    max_depth: usize,
    cache: RefCell<HashMap<(usize, u32), ResolvedValue>>,
    in_progress: RefCell<HashSet<(usize, u32)>>,
    next_frame: Cell<u32>,
}

impl<'t> Resolver<'t> {
    pub fn new(symbols: &'t Symbols<'t>, table: &'t ConstantTable, max_depth: usize) -> Self {
        Self {
            symbols,
            table,
            max_depth,
            cache: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(HashSet::new()),
            next_frame: Cell::new(1),
        }
    }

    pub fn unit(&self) -> &'t SourceUnit {
        self.symbols.unit()
    }

    pub fn symbols(&self) -> &'t Symbols<'t> {
        self.symbols
    }

    pub fn table(&self) -> &'t ConstantTable {
        self.table
    }

    pub fn text(&self, node: Node<'t>) -> &'t str {
        self.unit().text(node)
    }

    pub fn location(&self, node: Node<'t>) -> Location {
        self.unit().location(node)
    }

    pub fn resolve_node(&self, node: Node<'t>) -> ResolvedValue {
        self.resolve(&Expr::root(node))
    }

    pub fn resolve(&self, expr: &Expr<'t>) -> ResolvedValue {
        let key = (expr.node.id(), expr.frame.id());
        let cached = self.cache.borrow().get(&key).cloned();
        if let Some(value) = cached {
            return value;
        }
        if !self.in_progress.borrow_mut().insert(key) {
            return self.unresolved(UnresolvedReason::RecursionDepthExceeded, expr.node);
        }
        let value = self.compute(expr);
        self.in_progress.borrow_mut().remove(&key);
        self.cache.borrow_mut().insert(key, value.clone());
        value
    }

    /// The string an expression resolves to, if any.
    pub fn string(&self, expr: &Expr<'t>) -> Option<String> {
        self.resolve(expr).as_str().map(str::to_string)
    }

    pub fn field_path(&self, expr: &Expr<'t>) -> Result<FieldPath, MalformedReason> {
        match self.resolve(expr) {
            ResolvedValue::Literal(Value::String(path)) => Ok(FieldPath::from(path)),
            _ => Err(MalformedReason::UnresolvedFieldPath),
        }
    }

    /// Declared type of a variable, field, helper return or constructor call.
    pub fn declared_type(&self, expr: &Expr<'t>) -> Option<String> {
        let node = unwrap_expression(expr.node);
        match node.kind() {
            "identifier" | "field_access" => match self.declaration_of(node) {
                Some(decl) => decl.type_node().map(|t| self.text(t).to_string()),
                None => None,
            },
            "method_invocation" => self
                .symbols
                .method(node)
                .and_then(|m| m.child_by_field_name("type"))
                .map(|t| self.text(t).to_string()),
            "object_creation_expression" => node
                .child_by_field_name("type")
                .map(|t| self.text(t).to_string()),
            _ => None,
        }
    }

    /// Follow one binding hop from an identifier or field access.
    pub fn follow(&self, expr: &Expr<'t>) -> Followed<'t> {
        let node = unwrap_expression(expr.node);
        match self.declaration_of(node) {
            Some(decl) => self.follow_declaration(decl, &expr.frame),
            None => Followed::NotReference,
        }
    }

    /// Inline a call to a same-unit pure accessor: the returned expression,
    /// evaluated in a fresh frame binding the call's arguments.
    ///
    /// `None` when the call does not target such a helper.
    pub fn inline(&self, call: &Expr<'t>) -> Option<Result<Expr<'t>, UnresolvedReason>> {
        let node = unwrap_expression(call.node);
        if node.kind() != "method_invocation" {
            return None;
        }
        let method = self.symbols.method(node)?;
        let returned = pure_return(method)?;
        if call.frame.depth() >= self.max_depth {
            tracing::debug!(
                "Not inlining {}: depth {} reached",
                self.text(node),
                self.max_depth
            );
            return Some(Err(UnresolvedReason::RecursionDepthExceeded));
        }
        let arguments = call_arguments(node)
            .into_iter()
            .map(|arg| call.with_node(arg))
            .collect();
        let id = self.next_frame.get();
        self.next_frame.set(id + 1);
        let frame = Frame(Some(Rc::new(FrameData {
            id,
            depth: call.frame.depth() + 1,
            method,
            arguments,
        })));
        Some(Ok(Expr {
            node: returned,
            frame,
        }))
    }

    fn declaration_of(&self, node: Node<'t>) -> Option<Declaration<'t>> {
        match node.kind() {
            "identifier" => self.symbols.lookup(node),
            "field_access" => {
                let object = node.child_by_field_name("object")?;
                let field = self.text(node.child_by_field_name("field")?);
                let class = match object.kind() {
                    "this" => enclosing(node, TYPE_DECLARATIONS)?,
                    "identifier" if self.symbols.lookup(object).is_none() => {
                        self.symbols.class(self.text(object))?
                    }
                    _ => return None,
                };
                self.symbols.field_of(class, field)
            }
            _ => None,
        }
    }

    /// Element expressions of a collection-valued expression: array
    /// initializers, collection factories, and locals or helpers that
    /// evaluate to one of those.
    pub fn elements(&self, expr: &Expr<'t>) -> Option<Vec<Expr<'t>>> {
        let node = unwrap_expression(expr.node);
        match node.kind() {
            "array_initializer" => Some(
                named_children(node)
                    .into_iter()
                    .map(|n| expr.with_node(n))
                    .collect(),
            ),
            "array_creation_expression" => node
                .child_by_field_name("value")
                .and_then(|init| self.elements(&expr.with_node(init))),
            "identifier" | "field_access" => match self.follow(expr) {
                Followed::Bound { expr: bound, .. } => self.elements(&bound),
                Followed::Variadic(items) => Some(items),
                _ => None,
            },
            "method_invocation" if is_collection_factory(self.unit(), node) => {
                let args = call_arguments(node);
                if let [single] = args.as_slice() {
                    if let Some(spread) = self.elements(&expr.with_node(*single)) {
                        return Some(spread);
                    }
                }
                Some(args.into_iter().map(|n| expr.with_node(n)).collect())
            }
            "method_invocation" => match self.inline(expr) {
                Some(Ok(returned)) => self.elements(&returned),
                _ => None,
            },
            _ => None,
        }
    }

    fn follow_declaration(&self, decl: Declaration<'t>, frame: &Frame<'t>) -> Followed<'t> {
        let declared_type = decl.type_node().map(|t| self.text(t).to_string());
        let (binding, frame) = match decl {
            Declaration::Local { binding, .. } => (binding, frame.clone()),
            // Field initializers never see a method's parameters.
            Declaration::Field { binding, .. } => (binding, Frame::root()),
            Declaration::Parameter {
                method,
                index,
                variadic,
                ..
            } => {
                return match frame.0.as_ref().filter(|f| f.method.id() == method.id()) {
                    Some(data) if variadic => {
                        Followed::Variadic(data.arguments.iter().skip(index).cloned().collect())
                    }
                    Some(data) => match data.arguments.get(index) {
                        Some(arg) => Followed::Bound {
                            expr: arg.clone(),
                            declared_type,
                        },
                        None => Followed::Opaque {
                            reason: UnresolvedReason::DynamicValue,
                            declared_type,
                        },
                    },
                    None => Followed::Opaque {
                        reason: UnresolvedReason::DynamicValue,
                        declared_type,
                    },
                };
            }
            Declaration::Dynamic { .. } => {
                return Followed::Opaque {
                    reason: UnresolvedReason::DynamicValue,
                    declared_type,
                }
            }
        };
        match binding {
            Binding::Initializer(value) | Binding::Assigned(value) => Followed::Bound {
                expr: Expr { node: value, frame },
                declared_type,
            },
            Binding::Reassigned => Followed::Branching { declared_type },
            Binding::Uninitialized => Followed::Opaque {
                reason: UnresolvedReason::DynamicValue,
                declared_type,
            },
        }
    }

    fn unresolved(&self, reason: UnresolvedReason, node: Node<'t>) -> ResolvedValue {
        ResolvedValue::unresolved(reason, Some(self.location(node)))
    }

    fn compute(&self, expr: &Expr<'t>) -> ResolvedValue {
        let node = unwrap_expression(expr.node);
        let text = self.text(node);
        let literal = |value: Option<Value>| match value {
            Some(value) => ResolvedValue::Literal(value),
            None => self.unresolved(UnresolvedReason::UnsupportedExpression, node),
        };
        match node.kind() {
            "string_literal" => literal(decode_string_literal(text).map(Value::String)),
            "character_literal" => literal(decode_char_literal(text).map(Value::Char)),
            "decimal_integer_literal"
            | "hex_integer_literal"
            | "octal_integer_literal"
            | "binary_integer_literal" => literal(parse_int_literal(text).map(Value::Int)),
            "decimal_floating_point_literal" | "hex_floating_point_literal" => {
                literal(parse_float_literal(text).map(Value::Double))
            }
            "true" => ResolvedValue::Literal(Value::Bool(true)),
            "false" => ResolvedValue::Literal(Value::Bool(false)),
            "null_literal" => ResolvedValue::Literal(Value::Null),
            "class_literal" => {
                let type_name = named_children(node)
                    .into_iter()
                    .next()
                    .map(|t| self.text(t).to_string());
                literal(type_name.map(Value::Class))
            }
            "identifier" | "field_access" => self.resolve_reference(&expr.with_node(node)),
            "unary_expression" => self.resolve_unary(expr, node),
            "binary_expression" => self.resolve_binary(expr, node),
            "array_creation_expression" => match node.child_by_field_name("value") {
                Some(init) => self.resolve(&expr.with_node(init)),
                None => self.unresolved(UnresolvedReason::DynamicValue, node),
            },
            "array_initializer" => ResolvedValue::Literal(Value::Array(
                named_children(node)
                    .into_iter()
                    .map(|element| self.resolve(&expr.with_node(element)))
                    .collect(),
            )),
            "object_creation_expression" => {
                let type_name = node
                    .child_by_field_name("type")
                    .map(|t| self.text(t).to_string())
                    .unwrap_or_default();
                let arguments = call_arguments(node)
                    .into_iter()
                    .map(|arg| self.resolve(&expr.with_node(arg)))
                    .collect();
                ResolvedValue::Literal(Value::Instance {
                    type_name,
                    arguments,
                })
            }
            "method_invocation" => self.resolve_call(expr, node),
            "ternary_expression"
            | "array_access"
            | "lambda_expression"
            | "method_reference"
            | "this"
            | "super"
            | "assignment_expression"
            | "update_expression"
            | "switch_expression"
            | "instanceof_expression" => self.unresolved(UnresolvedReason::DynamicValue, node),
            _ => self.unresolved(UnresolvedReason::UnsupportedExpression, node),
        }
    }

    fn resolve_reference(&self, expr: &Expr<'t>) -> ResolvedValue {
        let node = expr.node;
        match self.follow(expr) {
            Followed::Bound { expr: bound, .. } => self.resolve(&bound),
            Followed::Variadic(args) => ResolvedValue::Literal(Value::Array(
                args.iter().map(|arg| self.resolve(arg)).collect(),
            )),
            Followed::Opaque { reason, .. } => self.unresolved(reason, node),
            Followed::Branching { .. } => self.unresolved(UnresolvedReason::DynamicValue, node),
            Followed::NotReference => {
                let external = if node.kind() == "field_access" {
                    self.table.constant(&qualified_tail(self.text(node)))
                } else {
                    self.table.constant_by_name(self.text(node))
                };
                match external {
                    Some(value) => value.clone(),
                    None => self.unresolved(UnresolvedReason::UnknownDeclaration, node),
                }
            }
        }
    }

    fn resolve_unary(&self, expr: &Expr<'t>, node: Node<'t>) -> ResolvedValue {
        let (Some(operator), Some(operand)) = (
            node.child_by_field_name("operator"),
            node.child_by_field_name("operand"),
        ) else {
            return self.unresolved(UnresolvedReason::UnsupportedExpression, node);
        };
        let value = self.resolve(&expr.with_node(operand));
        let ResolvedValue::Literal(value) = value else {
            return value;
        };
        let folded = match (self.text(operator), value) {
            ("-", Value::Int(i)) => i.checked_neg().map(Value::Int),
            ("-", Value::Double(d)) => Some(Value::Double(-d)),
            ("+", v @ (Value::Int(_) | Value::Double(_))) => Some(v),
            ("!", Value::Bool(b)) => Some(Value::Bool(!b)),
            ("~", Value::Int(i)) => Some(Value::Int(!i)),
            _ => None,
        };
        match folded {
            Some(value) => ResolvedValue::Literal(value),
            None => self.unresolved(UnresolvedReason::UnsupportedExpression, node),
        }
    }

    fn resolve_binary(&self, expr: &Expr<'t>, node: Node<'t>) -> ResolvedValue {
        let (Some(left), Some(operator), Some(right)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("operator"),
            node.child_by_field_name("right"),
        ) else {
            return self.unresolved(UnresolvedReason::UnsupportedExpression, node);
        };
        let left = self.resolve(&expr.with_node(left));
        let right = self.resolve(&expr.with_node(right));
        let (lhs, rhs) = match (&left, &right) {
            (ResolvedValue::Literal(l), ResolvedValue::Literal(r)) => (l, r),
            (ResolvedValue::Unresolved { .. }, _) => return left,
            (_, ResolvedValue::Unresolved { .. }) => return right,
        };
        let op = self.text(operator);
        let folded = match (op, lhs, rhs) {
            ("+", Value::String(_), _) | ("+", _, Value::String(_)) => {
                match (lhs.concat_text(), rhs.concat_text()) {
                    (Some(l), Some(r)) => Some(Value::String(l + &r)),
                    _ => None,
                }
            }
            (_, Value::Int(a), Value::Int(b)) => match op {
                "+" => a.checked_add(*b),
                "-" => a.checked_sub(*b),
                "*" => a.checked_mul(*b),
                "/" => a.checked_div(*b),
                "%" => a.checked_rem(*b),
                _ => None,
            }
            .map(Value::Int),
            (_, Value::Double(_) | Value::Int(_), Value::Double(_) | Value::Int(_)) => {
                let (a, b) = (as_f64(lhs), as_f64(rhs));
                match op {
                    "+" => Some(Value::Double(a + b)),
                    "-" => Some(Value::Double(a - b)),
                    "*" => Some(Value::Double(a * b)),
                    "/" => Some(Value::Double(a / b)),
                    _ => None,
                }
            }
            _ => None,
        };
        match folded {
            Some(value) => ResolvedValue::Literal(value),
            None => self.unresolved(UnresolvedReason::UnsupportedExpression, node),
        }
    }

    fn resolve_call(&self, expr: &Expr<'t>, node: Node<'t>) -> ResolvedValue {
        if is_collection_factory(self.unit(), node) {
            let mut elements: Vec<ResolvedValue> = call_arguments(node)
                .into_iter()
                .map(|arg| self.resolve(&expr.with_node(arg)))
                .collect();
            // asList(array) spreads the array
            if elements.len() == 1 && matches!(elements[0], ResolvedValue::Literal(Value::Array(_)))
            {
                return elements.remove(0);
            }
            return ResolvedValue::Literal(Value::Array(elements));
        }
        match self.inline(expr) {
            Some(Ok(returned)) => self.resolve(&returned),
            Some(Err(reason)) => self.unresolved(reason, node),
            None => self.unresolved(UnresolvedReason::DynamicValue, node),
        }
    }
}

fn is_collection_factory(unit: &SourceUnit, call: Node<'_>) -> bool {
    let name = call
        .child_by_field_name("name")
        .map(|n| unit.text(n))
        .unwrap_or("");
    let receiver = call
        .child_by_field_name("object")
        .map(|o| unit.text(o))
        .unwrap_or("");
    let receiver = receiver.rsplit('.').next().unwrap_or(receiver);
    COLLECTION_FACTORIES.contains(&(receiver, name))
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Double(d) => *d,
        _ => f64::NAN,
    }
}

/// `com.acme.Names.MOVIES` -> `Names.MOVIES`
fn qualified_tail(text: &str) -> String {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parts = compact.rsplit('.');
    match (parts.next(), parts.next()) {
        (Some(field), Some(class)) => format!("{}.{}", class, field),
        (Some(field), None) => field.to_string(),
        _ => compact.clone(),
    }
}
