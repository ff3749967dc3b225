//! Lexical scopes and name bindings.
//!
//! Scopes form a parent-linked tree stored in one arena. Functions may be
//! bound several times under one name (an overload set); any other clash
//! within a single scope is a `DuplicateBinding`.

use std::collections::HashMap;

use crate::entity::{EntityId, EntityTable, define_id};
use crate::error::CoreError;
use crate::span::SourceLocation;

define_id! {
    pub struct ScopeId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Module,
    Function,
    Block,
    Case,
}

#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    bindings: HashMap<String, Vec<EntityId>>,
    exports: Vec<EntityId>,
}

#[derive(Debug)]
pub struct ScopeTable {
    scopes: Vec<Scope>,
}

impl Default for ScopeTable {
    fn default() -> Self {
        ScopeTable::new()
    }
}

impl ScopeTable {
    /// Creates the table with its root scope.
    pub fn new() -> Self {
        ScopeTable {
            scopes: vec![Scope {
                parent: None,
                kind: ScopeKind::Root,
                bindings: HashMap::new(),
                exports: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId::new(0)
    }

    pub fn push(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let id = ScopeId::new(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent: Some(parent),
            kind,
            bindings: HashMap::new(),
            exports: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index() as usize]
    }

    fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.index() as usize]
    }

    /// Binds `entity` under its own name.
    pub fn register(
        &mut self,
        entities: &EntityTable,
        scope: ScopeId,
        entity: EntityId,
    ) -> Result<(), CoreError> {
        let name = entities.get(entity).name.clone();
        let location = entities.get(entity).location.clone();
        self.register_as(entities, scope, &name, entity, &location)
    }

    /// Binds `entity` under `name` (which differs from the entity name for
    /// aliased imports).
    pub fn register_as(
        &mut self,
        entities: &EntityTable,
        scope: ScopeId,
        name: &str,
        entity: EntityId,
        location: &SourceLocation,
    ) -> Result<(), CoreError> {
        let bound = self
            .get_mut(scope)
            .bindings
            .entry(name.to_string())
            .or_default();
        if bound.contains(&entity) {
            return Ok(());
        }
        let overloadable = entities.get(entity).is_fn()
            && bound.iter().all(|existing| entities.get(*existing).is_fn());
        if !bound.is_empty() && !overloadable {
            return Err(CoreError::DuplicateBinding {
                name: name.to_string(),
                location: location.clone(),
            });
        }
        bound.push(entity);
        Ok(())
    }

    /// Nearest enclosing binding of `name` that is not a function.
    pub fn resolve(&self, entities: &EntityTable, scope: ScopeId, name: &str) -> Option<EntityId> {
        self.ancestors(scope).find_map(|current| {
            self.get(current)
                .bindings
                .get(name)?
                .iter()
                .copied()
                .find(|id| !entities.get(*id).is_fn())
        })
    }

    /// Every visible function named `name`, innermost scope first.
    pub fn resolve_overloads(
        &self,
        entities: &EntityTable,
        scope: ScopeId,
        name: &str,
    ) -> Vec<EntityId> {
        let mut found = Vec::new();
        for current in self.ancestors(scope) {
            let Some(bound) = self.get(current).bindings.get(name) else {
                continue;
            };
            for id in bound {
                if entities.get(*id).is_fn() && !found.contains(id) {
                    found.push(*id);
                }
            }
        }
        found
    }

    /// Entities bound to `name` directly in `scope`, ignoring parents.
    pub fn local(&self, scope: ScopeId, name: &str) -> &[EntityId] {
        self.get(scope)
            .bindings
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn export(&mut self, scope: ScopeId, entity: EntityId) {
        let exports = &mut self.get_mut(scope).exports;
        if !exports.contains(&entity) {
            exports.push(entity);
        }
    }

    pub fn exports(&self, scope: ScopeId) -> &[EntityId] {
        &self.get(scope).exports
    }

    /// Exported entities of `scope` named `name` (several for overloads).
    pub fn exported(&self, entities: &EntityTable, scope: ScopeId, name: &str) -> Vec<EntityId> {
        self.exports(scope)
            .iter()
            .copied()
            .filter(|id| entities.get(*id).name == name)
            .collect()
    }

    fn ancestors(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), |current| self.get(*current).parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, FnBody, FnDef, VarDef};
    use crate::hir::ExprId;
    use crate::types::Type;

    fn var(entities: &mut EntityTable, name: &str) -> EntityId {
        entities.alloc(
            name,
            SourceLocation::builtin(),
            EntityKind::Variable(VarDef {
                ty: Type::I32,
                mutable: false,
            }),
        )
    }

    fn func(entities: &mut EntityTable, scopes: &ScopeTable, name: &str) -> EntityId {
        let body = FnBody::Expr {
            first: ExprId::new(0),
            root: ExprId::new(0),
        };
        entities.alloc(
            name,
            SourceLocation::builtin(),
            EntityKind::Fn(FnDef::new(scopes.root(), Vec::new(), body)),
        )
    }

    #[test]
    fn functions_overload_but_values_clash() {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        let root = scopes.root();
        let first = func(&mut entities, &scopes, "get");
        let second = func(&mut entities, &scopes, "get");
        scopes.register(&entities, root, first).expect("first");
        scopes.register(&entities, root, second).expect("overload");

        let value = var(&mut entities, "get");
        let err = scopes.register(&entities, root, value).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateBinding { .. }));

        let x = var(&mut entities, "x");
        let y = var(&mut entities, "x");
        scopes.register(&entities, root, x).expect("x");
        let err = scopes.register(&entities, root, y).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateBinding { .. }));
    }

    #[test]
    fn registering_the_same_entity_twice_is_a_no_op() {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        let root = scopes.root();
        let x = var(&mut entities, "x");
        scopes.register(&entities, root, x).expect("first");
        scopes.register(&entities, root, x).expect("again");
        assert_eq!(scopes.resolve(&entities, root, "x"), Some(x));
    }

    #[test]
    fn resolve_finds_the_nearest_value_binding() {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        let root = scopes.root();
        let inner = scopes.push(root, ScopeKind::Block);
        let outer_x = var(&mut entities, "x");
        let inner_x = var(&mut entities, "x");
        scopes.register(&entities, root, outer_x).expect("outer");
        scopes.register(&entities, inner, inner_x).expect("inner");

        assert_eq!(scopes.resolve(&entities, inner, "x"), Some(inner_x));
        assert_eq!(scopes.resolve(&entities, root, "x"), Some(outer_x));
        assert_eq!(scopes.resolve(&entities, inner, "y"), None);
    }

    #[test]
    fn overloads_are_collected_from_every_enclosing_scope() {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        let root = scopes.root();
        let module = scopes.push(root, ScopeKind::Module);
        let block = scopes.push(module, ScopeKind::Block);
        let outer = func(&mut entities, &scopes, "len");
        let inner = func(&mut entities, &scopes, "len");
        scopes.register(&entities, root, outer).expect("outer");
        scopes.register(&entities, module, inner).expect("inner");
        scopes.register(&entities, block, outer).expect("reimport");

        assert_eq!(
            scopes.resolve_overloads(&entities, block, "len"),
            vec![outer, inner]
        );
        assert_eq!(scopes.resolve(&entities, block, "len"), None);
    }

    #[test]
    fn exports_are_filtered_by_name() {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        let module = scopes.push(scopes.root(), ScopeKind::Module);
        let a = func(&mut entities, &scopes, "a");
        let b = func(&mut entities, &scopes, "b");
        scopes.export(module, a);
        scopes.export(module, b);
        scopes.export(module, a);
        assert_eq!(scopes.exports(module), &[a, b]);
        assert_eq!(scopes.exported(&entities, module, "b"), vec![b]);
    }
}
