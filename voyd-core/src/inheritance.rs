//! Nominal inheritance encoding.
//!
//! Every concrete object type has an ancestor chain `[self, parent, ...,
//! Object]` of entity ids. The chain drives compile-time subtype checks
//! and overload scoring, and is emitted as a constant `i32` array that
//! each runtime struct carries in field 0, so a type-guard test is a
//! linear scan for the case type's id.

use std::collections::HashMap;
use std::rc::Rc;

use crate::entity::{EntityId, EntityTable, ResolveState};

#[derive(Debug, Default)]
pub struct InheritanceEncoder {
    chains: HashMap<EntityId, Rc<[EntityId]>>,
}

impl InheritanceEncoder {
    pub fn new() -> Self {
        InheritanceEncoder::default()
    }

    /// `[ty, parent, ..., Object]`. Only chains of finished layouts are
    /// memoized.
    pub fn ancestor_chain(&mut self, entities: &EntityTable, ty: EntityId) -> Rc<[EntityId]> {
        if let Some(chain) = self.chains.get(&ty) {
            return chain.clone();
        }
        let def = entities.object(ty);
        let mut chain = vec![ty];
        if let Some(parent) = def.and_then(|def| def.parent) {
            chain.extend(self.ancestor_chain(entities, parent).iter().copied());
        }
        let chain: Rc<[EntityId]> = chain.into();
        if def.is_some_and(|def| def.state == ResolveState::Done) {
            self.chains.insert(ty, chain.clone());
        }
        chain
    }

    /// Reflexive, transitive subtype test.
    pub fn extends(&mut self, entities: &EntityTable, ty: EntityId, ancestor: EntityId) -> bool {
        self.distance(entities, ty, ancestor).is_some()
    }

    /// Number of inheritance steps from `ty` up to `ancestor`.
    pub fn distance(
        &mut self,
        entities: &EntityTable,
        ty: EntityId,
        ancestor: EntityId,
    ) -> Option<u32> {
        self.ancestor_chain(entities, ty)
            .iter()
            .position(|id| *id == ancestor)
            .map(|index| index as u32)
    }

    /// Nearest type both `a` and `b` extend.
    pub fn common_ancestor(
        &mut self,
        entities: &EntityTable,
        a: EntityId,
        b: EntityId,
    ) -> Option<EntityId> {
        let other = self.ancestor_chain(entities, b);
        self.ancestor_chain(entities, a)
            .iter()
            .copied()
            .find(|id| other.contains(id))
    }

    /// Value used for `ty` in runtime ancestor arrays.
    pub fn runtime_id(ty: EntityId) -> i32 {
        ty.index() as i32
    }
}
