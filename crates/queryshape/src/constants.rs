//! Cross-file facts collected once per analysis pass.
//!
//! The [`ConstantTable`] holds what one file may need from another:
//! `static final` constants, `@Document` collection bindings and the
//! annotated repository methods. It is built in parallel, one partial table
//! per unit, and merged. It is read-only afterwards and shared across
//! extraction threads behind an `Arc`.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::Serialize;
use tree_sitter::Node;

use crate::dialects::template::QueryMethod;
use crate::model::{ResolvedValue, UnresolvedReason};
use crate::resolve::Resolver;
use crate::syntax::{
    annotation_argument, declarators, enclosing, find_annotation, for_each_descendant,
    has_modifier, SourceUnit, Symbols, TYPE_DECLARATIONS,
};
use crate::Location;

/// The collection an entity class is stored in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityBinding {
    pub class_name: String,
    /// `None` when `@Document` names no collection
    pub collection: Option<ResolvedValue>,
    pub location: Location,
}

#[derive(Debug, Default, Clone)]
pub struct ConstantTable {
    /// `Class.NAME` -> value
    constants: HashMap<String, ResolvedValue>,
    /// `NAME` -> value, `None` when two classes disagree
    simple_names: HashMap<String, Option<ResolvedValue>>,
    entities: HashMap<String, EntityBinding>,
    /// Annotated repository methods by method name
    query_methods: HashMap<String, Vec<QueryMethod>>,
}

impl ConstantTable {
    /// Build the table for a set of units.
    ///
    /// Runs two rounds so a constant defined in terms of another file's
    /// constant (`A.X = B.Y + "s"`) resolves regardless of file order.
    pub fn build(units: &[SourceUnit], max_depth: usize) -> Self {
        let first = Self::collect(units, &Self::default(), max_depth);
        let table = Self::collect(units, &first, max_depth);
        tracing::debug!(
            "Constant table: {} constants, {} entities, {} query methods",
            table.constants.len(),
            table.entities.len(),
            table.query_method_count()
        );
        table
    }

    fn collect(units: &[SourceUnit], previous: &ConstantTable, max_depth: usize) -> Self {
        units
            .par_iter()
            .map(|unit| Self::from_unit(unit, previous, max_depth))
            .reduce(Self::default, Self::merge)
    }

    /// Partial table for one unit, resolving against `previous`.
    pub fn from_unit(unit: &SourceUnit, previous: &ConstantTable, max_depth: usize) -> Self {
        let symbols = Symbols::new(unit);
        let resolver = Resolver::new(&symbols, previous, max_depth);
        let mut table = Self::default();

        for_each_descendant(unit.root(), |node| match node.kind() {
            "field_declaration" | "constant_declaration" => {
                table.collect_constants(&resolver, node);
            }
            "class_declaration" | "record_declaration" => {
                if let Some(binding) = entity_binding(&resolver, node) {
                    table.entities.entry(binding.class_name.clone()).or_insert(binding);
                }
            }
            "method_declaration" => {
                if let Some(method) = QueryMethod::from_declaration(&resolver, node) {
                    table.query_methods.entry(method.name.clone()).or_default().push(method);
                }
            }
            _ => {}
        });
        table
    }

    fn collect_constants<'t>(&mut self, resolver: &Resolver<'t>, declaration: Node<'t>) {
        let is_constant = declaration.kind() == "constant_declaration"
            || (has_modifier(declaration, "static") && has_modifier(declaration, "final"));
        if !is_constant {
            return;
        }
        let Some(class_name) = enclosing(declaration, TYPE_DECLARATIONS)
            .and_then(|c| c.child_by_field_name("name"))
            .map(|n| resolver.text(n))
        else {
            return;
        };
        for declarator in declarators(declaration) {
            let (Some(name), Some(value)) = (
                declarator.child_by_field_name("name"),
                declarator.child_by_field_name("value"),
            ) else {
                continue;
            };
            let value = resolver.resolve_node(value);
            if value.is_resolved() {
                self.insert_constant(class_name, resolver.text(name), value);
            }
        }
    }

    fn insert_constant(&mut self, class_name: &str, name: &str, value: ResolvedValue) {
        self.simple_names
            .entry(name.to_string())
            .and_modify(|existing| {
                if existing.as_ref() != Some(&value) {
                    *existing = None;
                }
            })
            .or_insert_with(|| Some(value.clone()));
        self.constants.insert(format!("{}.{}", class_name, name), value);
    }

    /// Combine two partial tables. Earlier entries win on conflicts.
    pub fn merge(mut self, other: ConstantTable) -> Self {
        for (key, value) in other.constants {
            self.constants.entry(key).or_insert(value);
        }
        for (name, value) in other.simple_names {
            match self.simple_names.get_mut(&name) {
                Some(existing) => {
                    if *existing != value {
                        *existing = None;
                    }
                }
                None => {
                    self.simple_names.insert(name, value);
                }
            }
        }
        for (class_name, binding) in other.entities {
            self.entities.entry(class_name).or_insert(binding);
        }
        for (name, methods) in other.query_methods {
            self.query_methods.entry(name).or_default().extend(methods);
        }
        self
    }

    /// A constant by `Class.NAME`.
    pub fn constant(&self, qualified: &str) -> Option<&ResolvedValue> {
        self.constants.get(qualified)
    }

    /// A constant by bare name (static imports). Ambiguous names are unknown.
    pub fn constant_by_name(&self, name: &str) -> Option<&ResolvedValue> {
        self.simple_names.get(name).and_then(|v| v.as_ref())
    }

    pub fn entity(&self, class_name: &str) -> Option<&EntityBinding> {
        let simple = class_name.rsplit('.').next().unwrap_or(class_name);
        self.entities.get(simple)
    }

    /// Collection name for an entity class; implicit when not bound.
    pub fn collection_for(&self, class_name: &str, location: Location) -> ResolvedValue {
        match self.entity(class_name).and_then(|b| b.collection.clone()) {
            Some(collection) => collection,
            None => ResolvedValue::unresolved(UnresolvedReason::ImplicitCollectionName, Some(location)),
        }
    }

    pub fn query_methods(&self, name: &str) -> &[QueryMethod] {
        self.query_methods.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn query_method_count(&self) -> usize {
        self.query_methods.values().map(Vec::len).sum()
    }
}

fn entity_binding<'t>(resolver: &Resolver<'t>, class: Node<'t>) -> Option<EntityBinding> {
    let unit = resolver.unit();
    let annotation = find_annotation(unit, class, "Document")?;
    let class_name = unit.text(class.child_by_field_name("name")?).to_string();
    let collection = annotation_argument(unit, annotation, "collection")
        .or_else(|| annotation_argument(unit, annotation, "value"))
        .map(|value| resolver.resolve_node(value))
        .filter(|value| value.as_str() != Some(""));
    Some(EntityBinding {
        class_name,
        collection,
        location: unit.location(annotation),
    })
}
