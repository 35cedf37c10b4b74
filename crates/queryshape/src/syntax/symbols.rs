//! Declaration lookup within one compilation unit.
//!
//! Scoping follows Java's lexical rules closely enough for value tracing:
//! locals declared earlier in an enclosing block, then parameters and
//! loop/catch/lambda variables, then fields of the enclosing classes
//! (innermost first). Lookup is a single hop; following a chain of bindings
//! is the resolver's job.

use std::collections::HashMap;

use tree_sitter::Node;

use super::{
    declarators, find_child_by_kind, for_each_descendant, has_modifier, named_children,
    SourceUnit, TYPE_DECLARATIONS,
};

/// How a variable obtains its value.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'t> {
    /// Declared with an initializer and never reassigned
    Initializer(Node<'t>),
    /// No initializer, exactly one unconditional assignment
    Assigned(Node<'t>),
    /// Reassigned or conditionally assigned
    Reassigned,
    Uninitialized,
}

impl<'t> Binding<'t> {
    pub fn value(&self) -> Option<Node<'t>> {
        match self {
            Binding::Initializer(node) | Binding::Assigned(node) => Some(*node),
            Binding::Reassigned | Binding::Uninitialized => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Declaration<'t> {
    Local {
        declarator: Node<'t>,
        type_node: Option<Node<'t>>,
        binding: Binding<'t>,
    },
    Field {
        declarator: Node<'t>,
        type_node: Option<Node<'t>>,
        binding: Binding<'t>,
        class: Node<'t>,
        is_static: bool,
        is_final: bool,
    },
    Parameter {
        node: Node<'t>,
        type_node: Option<Node<'t>>,
        method: Node<'t>,
        index: usize,
        variadic: bool,
    },
    /// Loop, catch, lambda and resource variables: runtime values by nature
    Dynamic { node: Node<'t> },
}

impl<'t> Declaration<'t> {
    pub fn node(&self) -> Node<'t> {
        match self {
            Declaration::Local { declarator, .. } | Declaration::Field { declarator, .. } => {
                *declarator
            }
            Declaration::Parameter { node, .. } | Declaration::Dynamic { node } => *node,
        }
    }

    pub fn type_node(&self) -> Option<Node<'t>> {
        match self {
            Declaration::Local { type_node, .. }
            | Declaration::Field { type_node, .. }
            | Declaration::Parameter { type_node, .. } => *type_node,
            Declaration::Dynamic { .. } => None,
        }
    }
}

/// Symbol tables for one [`SourceUnit`].
pub struct Symbols<'t> {
    unit: &'t SourceUnit,
    classes: HashMap<&'t str, Node<'t>>,
}

impl<'t> Symbols<'t> {
    pub fn new(unit: &'t SourceUnit) -> Self {
        let mut classes = HashMap::new();
        for_each_descendant(unit.root(), |node| {
            if TYPE_DECLARATIONS.contains(&node.kind()) {
                if let Some(name) = node.child_by_field_name("name") {
                    classes.entry(unit.text(name)).or_insert(node);
                }
            }
        });
        Self { unit, classes }
    }

    pub fn unit(&self) -> &'t SourceUnit {
        self.unit
    }

    /// A type declared anywhere in this unit, by simple name.
    pub fn class(&self, name: &str) -> Option<Node<'t>> {
        self.classes.get(name).copied()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &&'t str> {
        self.classes.keys()
    }

    /// Find the declaration an identifier refers to.
    pub fn lookup(&self, ident: Node<'t>) -> Option<Declaration<'t>> {
        let name = self.unit.text(ident);
        let mut current = ident.parent();
        while let Some(scope) = current {
            match scope.kind() {
                "block" | "constructor_body" | "switch_block_statement_group" => {
                    if let Some(decl) = self.local_in_block(scope, name, ident) {
                        return Some(decl);
                    }
                }
                "for_statement" => {
                    let declared = scope
                        .child_by_field_name("init")
                        .filter(|init| init.kind() == "local_variable_declaration")
                        .and_then(|init| self.declarator_named(init, name));
                    if let Some(node) = declared {
                        return Some(Declaration::Dynamic { node });
                    }
                }
                "enhanced_for_statement" => {
                    if let Some(node) = scope
                        .child_by_field_name("name")
                        .filter(|n| self.unit.text(*n) == name)
                    {
                        return Some(Declaration::Dynamic { node });
                    }
                }
                "try_with_resources_statement" => {
                    let resource = scope
                        .child_by_field_name("resources")
                        .map(named_children)
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|r| r.child_by_field_name("name"))
                        .find(|n| self.unit.text(*n) == name);
                    if let Some(node) = resource {
                        return Some(Declaration::Dynamic { node });
                    }
                }
                "catch_clause" => {
                    let param = find_child_by_kind(&scope, "catch_formal_parameter")
                        .and_then(|p| p.child_by_field_name("name"))
                        .filter(|n| self.unit.text(*n) == name);
                    if let Some(node) = param {
                        return Some(Declaration::Dynamic { node });
                    }
                }
                "lambda_expression" => {
                    if let Some(node) = self.lambda_parameter(scope, name) {
                        return Some(Declaration::Dynamic { node });
                    }
                }
                "method_declaration" | "constructor_declaration" => {
                    if let Some(decl) = self.parameter(scope, name) {
                        return Some(decl);
                    }
                }
                kind if TYPE_DECLARATIONS.contains(&kind) => {
                    if let Some(decl) = self.field_of(scope, name) {
                        return Some(decl);
                    }
                }
                _ => {}
            }
            current = scope.parent();
        }
        None
    }

    /// A field (or record component) declared directly in `class`.
    pub fn field_of(&self, class: Node<'t>, name: &str) -> Option<Declaration<'t>> {
        let is_interface = class.kind() == "interface_declaration";
        for member in class_members(class) {
            if !matches!(member.kind(), "field_declaration" | "constant_declaration") {
                continue;
            }
            let Some(declarator) = self.declarator_named(member, name) else {
                continue;
            };
            let is_static = is_interface || has_modifier(member, "static");
            let is_final = is_interface || has_modifier(member, "final");
            return Some(Declaration::Field {
                declarator,
                type_node: member.child_by_field_name("type"),
                binding: self.field_binding(class, declarator, name),
                class,
                is_static,
                is_final,
            });
        }
        if class.kind() == "record_declaration" {
            let component = class
                .child_by_field_name("parameters")
                .map(named_children)
                .unwrap_or_default()
                .into_iter()
                .find(|p| {
                    p.child_by_field_name("name")
                        .is_some_and(|n| self.unit.text(n) == name)
                });
            if let Some(node) = component {
                return Some(Declaration::Dynamic { node });
            }
        }
        None
    }

    /// Resolve a call without a receiver, on `this`, or on a class declared in
    /// this unit to its method declaration.
    pub fn method(&self, call: Node<'t>) -> Option<Node<'t>> {
        let name = self.unit.text(call.child_by_field_name("name")?);
        let arity = super::call_arguments(call).len();
        match call.child_by_field_name("object") {
            None => {
                let mut current = super::enclosing(call, TYPE_DECLARATIONS);
                while let Some(class) = current {
                    if let Some(method) = self.method_in(class, name, arity) {
                        return Some(method);
                    }
                    current = super::enclosing(class, TYPE_DECLARATIONS);
                }
                None
            }
            Some(object) if object.kind() == "this" => {
                let class = super::enclosing(call, TYPE_DECLARATIONS)?;
                self.method_in(class, name, arity)
            }
            Some(object) if object.kind() == "identifier" => {
                if self.lookup(object).is_some() {
                    return None;
                }
                let class = self.class(self.unit.text(object))?;
                self.method_in(class, name, arity)
            }
            Some(_) => None,
        }
    }

    /// A method declared in `class` with a compatible parameter count.
    pub fn method_in(&self, class: Node<'t>, name: &str, arity: usize) -> Option<Node<'t>> {
        class_members(class).into_iter().find(|member| {
            if member.kind() != "method_declaration" {
                return false;
            }
            let matches_name = member
                .child_by_field_name("name")
                .is_some_and(|n| self.unit.text(n) == name);
            if !matches_name {
                return false;
            }
            let params = formal_parameters(*member);
            let variadic = params.last().is_some_and(|p| p.kind() == "spread_parameter");
            params.len() == arity || (variadic && arity + 1 >= params.len())
        })
    }

    fn local_in_block(&self, block: Node<'t>, name: &str, use_site: Node<'t>) -> Option<Declaration<'t>> {
        let mut found = None;
        for statement in named_children(block) {
            if statement.start_byte() >= use_site.start_byte() {
                break;
            }
            if statement.kind() == "local_variable_declaration" {
                if let Some(declarator) = self.declarator_named(statement, name) {
                    found = Some((statement, declarator));
                }
            }
        }
        let (statement, declarator) = found?;
        Some(Declaration::Local {
            declarator,
            type_node: statement.child_by_field_name("type"),
            binding: self.local_binding(block, declarator, name, use_site),
        })
    }

    fn local_binding(
        &self,
        block: Node<'t>,
        declarator: Node<'t>,
        name: &str,
        use_site: Node<'t>,
    ) -> Binding<'t> {
        let writes = self.writes_to(block, name, false);
        let later: Vec<Node<'t>> = writes
            .into_iter()
            .filter(|w| w.start_byte() > declarator.end_byte())
            .collect();

        if let Some(value) = declarator.child_by_field_name("value") {
            return if later.is_empty() {
                Binding::Initializer(value)
            } else {
                Binding::Reassigned
            };
        }
        match later.as_slice() {
            [] => Binding::Uninitialized,
            [single] => {
                let unconditional = single.kind() == "assignment_expression"
                    && single.end_byte() <= use_site.start_byte()
                    && is_statement_of(*single, block);
                match single.child_by_field_name("right") {
                    Some(right) if unconditional && is_plain_assignment(self.unit, *single) => {
                        Binding::Assigned(right)
                    }
                    _ => Binding::Reassigned,
                }
            }
            _ => Binding::Reassigned,
        }
    }

    fn field_binding(&self, class: Node<'t>, declarator: Node<'t>, name: &str) -> Binding<'t> {
        let writes = self.writes_to(class, name, true);
        if let Some(value) = declarator.child_by_field_name("value") {
            return if writes.is_empty() {
                Binding::Initializer(value)
            } else {
                Binding::Reassigned
            };
        }
        match writes.as_slice() {
            [] => Binding::Uninitialized,
            [single] => {
                let in_constructor = single.kind() == "assignment_expression"
                    && single
                        .parent()
                        .filter(|p| p.kind() == "expression_statement")
                        .and_then(|p| p.parent())
                        .is_some_and(|p| p.kind() == "constructor_body");
                match single.child_by_field_name("right") {
                    Some(right) if in_constructor && is_plain_assignment(self.unit, *single) => {
                        Binding::Assigned(right)
                    }
                    _ => Binding::Reassigned,
                }
            }
            _ => Binding::Reassigned,
        }
    }

    /// Assignments and increments that write `name` inside `scope`.
    fn writes_to(&self, scope: Node<'t>, name: &str, include_this: bool) -> Vec<Node<'t>> {
        let mut writes = Vec::new();
        for_each_descendant(scope, |node| {
            let target = match node.kind() {
                "assignment_expression" => node.child_by_field_name("left"),
                "update_expression" => named_children(node).into_iter().next(),
                _ => None,
            };
            let Some(target) = target else {
                return;
            };
            let hit = match target.kind() {
                "identifier" => self.unit.text(target) == name,
                "field_access" if include_this => {
                    target
                        .child_by_field_name("object")
                        .is_some_and(|o| o.kind() == "this")
                        && target
                            .child_by_field_name("field")
                            .is_some_and(|f| self.unit.text(f) == name)
                }
                _ => false,
            };
            if hit {
                writes.push(node);
            }
        });
        writes
    }

    fn parameter(&self, method: Node<'t>, name: &str) -> Option<Declaration<'t>> {
        let params = formal_parameters(method);
        let count = params.len();
        params.into_iter().enumerate().find_map(|(index, param)| {
            let (name_node, variadic) = if param.kind() == "spread_parameter" {
                let declarator = find_child_by_kind(&param, "variable_declarator")?;
                (declarator.child_by_field_name("name")?, true)
            } else {
                (param.child_by_field_name("name")?, false)
            };
            if self.unit.text(name_node) != name {
                return None;
            }
            let type_node = param
                .child_by_field_name("type")
                .or_else(|| named_children(param).into_iter().find(|c| c.kind().ends_with("type")));
            Some(Declaration::Parameter {
                node: name_node,
                type_node,
                method,
                index,
                variadic: variadic && index + 1 == count,
            })
        })
    }

    fn lambda_parameter(&self, lambda: Node<'t>, name: &str) -> Option<Node<'t>> {
        let params = lambda.child_by_field_name("parameters")?;
        if params.kind() == "identifier" {
            return (self.unit.text(params) == name).then_some(params);
        }
        named_children(params).into_iter().find_map(|p| {
            let ident = if p.kind() == "identifier" {
                p
            } else {
                p.child_by_field_name("name")?
            };
            (self.unit.text(ident) == name).then_some(ident)
        })
    }

    fn declarator_named(&self, declaration: Node<'t>, name: &str) -> Option<Node<'t>> {
        declarators(declaration).into_iter().find(|d| {
            d.child_by_field_name("name")
                .is_some_and(|n| self.unit.text(n) == name)
        })
    }
}

/// Members of a type body, including enum body declarations.
pub fn class_members(class: Node<'_>) -> Vec<Node<'_>> {
    let Some(body) = class.child_by_field_name("body") else {
        return Vec::new();
    };
    let mut members = Vec::new();
    for child in named_children(body) {
        if child.kind() == "enum_body_declarations" {
            members.extend(named_children(child));
        } else {
            members.push(child);
        }
    }
    members
}

/// Formal and spread parameters of a method or constructor.
pub fn formal_parameters(method: Node<'_>) -> Vec<Node<'_>> {
    method
        .child_by_field_name("parameters")
        .map(named_children)
        .unwrap_or_default()
        .into_iter()
        .filter(|p| matches!(p.kind(), "formal_parameter" | "spread_parameter"))
        .collect()
}

/// A method body made of local declarations and one trailing `return`:
/// yields the returned expression.
pub fn pure_return(method: Node<'_>) -> Option<Node<'_>> {
    let body = method.child_by_field_name("body")?;
    let statements = named_children(body);
    let (last, init) = statements.split_last()?;
    if last.kind() != "return_statement" {
        return None;
    }
    if !init
        .iter()
        .all(|s| s.kind() == "local_variable_declaration")
    {
        return None;
    }
    named_children(*last).into_iter().next()
}

fn is_statement_of(assignment: Node<'_>, block: Node<'_>) -> bool {
    assignment
        .parent()
        .filter(|p| p.kind() == "expression_statement")
        .and_then(|p| p.parent())
        .is_some_and(|p| p.id() == block.id())
}

fn is_plain_assignment(unit: &SourceUnit, assignment: Node<'_>) -> bool {
    assignment
        .child_by_field_name("operator")
        .is_some_and(|op| unit.text(op) == "=")
}

#[cfg(test)]
mod tests {
    use super::super::for_each_descendant;
    use super::*;

    fn parse(source: &str) -> SourceUnit {
        SourceUnit::parse("Test.java", source).expect("Should parse")
    }

    /// The last identifier with the given text, i.e. the use site in these fixtures.
    fn last_ident<'t>(unit: &'t SourceUnit, name: &str) -> Node<'t> {
        let mut found = None;
        for_each_descendant(unit.root(), |n| {
            if n.kind() == "identifier" && unit.text(n) == name {
                found = Some(n);
            }
        });
        found.expect("Should find identifier")
    }

    fn bound_text<'t>(unit: &'t SourceUnit, decl: &Declaration<'t>) -> Option<&'t str> {
        match decl {
            Declaration::Local { binding, .. } | Declaration::Field { binding, .. } => {
                binding.value().map(|n| unit.text(n))
            }
            _ => None,
        }
    }

    #[test]
    fn test_local_with_initializer() {
        let unit = parse(
            r#"
class A {
    void f() {
        String name = "movies";
        use(name);
    }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let decl = symbols.lookup(last_ident(&unit, "name")).expect("Should resolve local");
        assert!(matches!(decl, Declaration::Local { .. }));
        assert_eq!(bound_text(&unit, &decl), Some("\"movies\""));
        let ty = decl.type_node().map(|t| unit.text(t));
        assert_eq!(ty, Some("String"));
    }

    #[test]
    fn test_local_single_assignment() {
        let unit = parse(
            r#"
class A {
    void f() {
        int year;
        year = 1999;
        use(year);
    }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let decl = symbols.lookup(last_ident(&unit, "year")).expect("Should resolve local");
        assert!(matches!(
            decl,
            Declaration::Local {
                binding: Binding::Assigned(_),
                ..
            }
        ));
        assert_eq!(bound_text(&unit, &decl), Some("1999"));
    }

    #[test]
    fn test_local_branch_assignment_is_reassigned() {
        let unit = parse(
            r#"
class A {
    void f(boolean b) {
        int year;
        if (b) { year = 1999; }
        use(year);
    }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let decl = symbols.lookup(last_ident(&unit, "year")).expect("Should resolve local");
        assert!(matches!(
            decl,
            Declaration::Local {
                binding: Binding::Reassigned,
                ..
            }
        ));
    }

    #[test]
    fn test_reassigned_local() {
        let unit = parse(
            r#"
class A {
    void f() {
        String c = "a";
        c = "b";
        use(c);
    }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let decl = symbols.lookup(last_ident(&unit, "c")).expect("Should resolve local");
        assert_eq!(bound_text(&unit, &decl), None);
    }

    #[test]
    fn test_parameter_and_loop_variable() {
        let unit = parse(
            r#"
class A {
    void f(String first, int... rest) {
        for (String item : items) { use(item, first, rest); }
    }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        assert!(matches!(
            symbols.lookup(last_ident(&unit, "item")),
            Some(Declaration::Dynamic { .. })
        ));
        assert!(matches!(
            symbols.lookup(last_ident(&unit, "first")),
            Some(Declaration::Parameter { index: 0, variadic: false, .. })
        ));
        assert!(matches!(
            symbols.lookup(last_ident(&unit, "rest")),
            Some(Declaration::Parameter { index: 1, variadic: true, .. })
        ));
    }

    #[test]
    fn test_field_assigned_in_constructor() {
        let unit = parse(
            r#"
class Repo {
    private static final String COLLECTION = "movies";
    private final MongoCollection<Document> collection;

    Repo(MongoDatabase db) {
        this.collection = db.getCollection(COLLECTION);
    }

    void f() { use(collection); }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let decl = symbols
            .lookup(last_ident(&unit, "collection"))
            .expect("Should resolve field");
        match decl {
            Declaration::Field {
                binding: Binding::Assigned(value),
                type_node,
                is_static,
                ..
            } => {
                assert_eq!(unit.text(value), "db.getCollection(COLLECTION)");
                assert_eq!(type_node.map(|t| unit.text(t)), Some("MongoCollection<Document>"));
                assert!(!is_static);
            }
            other => panic!("Expected assigned field, got {:?}", other),
        }

        let constant = symbols
            .lookup(last_ident(&unit, "COLLECTION"))
            .expect("Should resolve constant");
        assert!(matches!(constant, Declaration::Field { is_static: true, is_final: true, .. }));
        assert_eq!(bound_text(&unit, &constant), Some("\"movies\""));
    }

    #[test]
    fn test_method_lookup_and_pure_return() {
        let unit = parse(
            r#"
class Queries {
    static String name() { return "movies"; }
    String busy() { log(); return "x"; }
    void f() { use(name(), Queries.name(), this.busy()); }
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let mut calls = Vec::new();
        for_each_descendant(unit.root(), |n| {
            if n.kind() == "method_invocation" {
                calls.push(n);
            }
        });
        let by_text = |text: &str| {
            *calls
                .iter()
                .find(|c| unit.text(**c) == text)
                .expect("Should find call")
        };

        let bare = symbols.method(by_text("name()")).expect("Should find bare method");
        assert_eq!(pure_return(bare).map(|n| unit.text(n)), Some("\"movies\""));

        let qualified = symbols.method(by_text("Queries.name()"));
        assert!(qualified.is_some());

        let busy = symbols.method(by_text("this.busy()")).expect("Should find busy");
        assert!(pure_return(busy).is_none());
    }

    #[test]
    fn test_interface_constants_are_static() {
        let unit = parse(
            r#"
interface Names {
    String MOVIES = "movies";
}
"#,
        );
        let symbols = Symbols::new(&unit);
        let class = symbols.class("Names").expect("Should find interface");
        assert!(matches!(
            symbols.field_of(class, "MOVIES"),
            Some(Declaration::Field { is_static: true, .. })
        ));
    }
}
