//! The entity table of one generation
//!
//! Slots are allocated densely starting at 1; slot 0 is reserved as "no
//! entity". Re-setting an id allocates a fresh slot and vacates the old
//! one, so a slot number is never reused within a generation.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{Entity, EntityId};

pub struct EntityTable {
    by_id: BTreeMap<EntityId, u32>,
    /// Records addressed by slot; vacated slots are `None`
    records: Vec<Option<Entity>>,
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTable {
    pub fn new() -> Self {
        Self {
            by_id: BTreeMap::new(),
            records: vec![None],
        }
    }

    /// Allocate a slot for the entity. Returns the new record and the
    /// displaced slot when the id was already present.
    pub fn set_entity(
        &mut self,
        id: EntityId,
        version: u64,
        extras: &[u8],
    ) -> (Entity, Option<u32>) {
        let index = self.records.len() as u32;
        let displaced = self.by_id.insert(id.clone(), index);
        if let Some(old) = displaced {
            self.records[old as usize] = None;
        }

        let entity = Entity::new(id, index, version, extras.to_vec());
        self.records.push(Some(entity.clone()));
        (entity, displaced)
    }

    /// Vacate the entity's slot. Returns the slot it held.
    pub fn del_entity(&mut self, id: &EntityId) -> Option<u32> {
        let index = self.by_id.remove(id)?;
        self.records[index as usize] = None;
        Some(index)
    }

    pub fn set_extras(&mut self, id: &EntityId, extras: &[u8]) -> bool {
        let Some(&index) = self.by_id.get(id) else {
            return false;
        };
        if let Some(record) = &mut self.records[index as usize] {
            record.extras = extras.to_vec();
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        let &index = self.by_id.get(id)?;
        self.records[index as usize].clone()
    }

    pub fn get_by_index(&self, index: u32) -> Option<Entity> {
        self.records.get(index as usize)?.clone()
    }

    /// Highest slot ever allocated (0 when the table is empty)
    pub fn max_index(&self) -> u32 {
        self.records.len() as u32 - 1
    }

    pub fn live_count(&self) -> usize {
        self.by_id.len()
    }

    /// Live entities ordered by id
    pub fn list_by_id(&self) -> Vec<Entity> {
        self.by_id
            .values()
            .filter_map(|&index| self.records[index as usize].clone())
            .collect()
    }

    /// Live entities ordered by slot, as stored in the entities stream
    pub fn list_by_index(&self) -> Vec<Entity> {
        self.records.iter().flatten().cloned().collect()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.list_by_index())?)
    }
}
