// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::block::RequestId;
use ::std::collections::BTreeMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Queued reads in arrival order. Arrival order is also expiry order, so the head is always the read that expires
/// first.
#[derive(Debug, Default)]
pub struct ReadFifo {
    map: BTreeMap<u64, RequestId>,
    next_pos: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ReadFifo {
    /// Appends a read. Returns its position.
    pub fn push_back(&mut self, id: RequestId) -> u64 {
        let pos: u64 = self.next_pos;
        self.next_pos += 1;
        self.map.insert(pos, id);
        pos
    }

    pub fn remove(&mut self, pos: u64) -> Option<RequestId> {
        self.map.remove(&pos)
    }

    /// Puts `id` at `pos`, returning whoever held that position.
    pub fn replace(&mut self, pos: u64, id: RequestId) -> Option<RequestId> {
        self.map.insert(pos, id)
    }

    /// Oldest read.
    pub fn front(&self) -> Option<RequestId> {
        self.map.first_key_value().map(|(_, id)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.map.values().copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
