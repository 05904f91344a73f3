// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::block::{
    RequestId,
    Sector,
};
use ::std::{
    collections::BTreeMap,
    ops::Bound,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Position of a request in a [SortList].
///
/// Keys order by barrier epoch first, then by start sector, then by arrival. A barrier opens a new epoch and takes
/// sector zero within it, so it sorts after everything queued before it and ahead of everything queued after it.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone)]
pub struct SortKey {
    epoch: u64,
    sector: Sector,
    seq: u64,
}

/// Queued requests of one direction, in ascending sector order.
#[derive(Debug, Default)]
pub struct SortList {
    map: BTreeMap<SortKey, RequestId>,
    /// Number of barriers inserted so far.
    epoch: u64,
    /// Arrival counter, breaks ties between requests starting at the same sector.
    next_seq: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SortKey {
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl SortList {
    /// Inserts a request starting at `sector` and returns its key.
    pub fn insert(&mut self, id: RequestId, sector: Sector, barrier: bool) -> SortKey {
        if barrier {
            self.epoch += 1;
        }
        let key: SortKey = SortKey {
            epoch: self.epoch,
            sector: if barrier { 0 } else { sector },
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if let Some(existing) = self.map.insert(key, id) {
            panic!("sort key {:?} already held by {}", key, existing);
        }
        key
    }

    pub fn remove(&mut self, key: SortKey) -> Option<RequestId> {
        self.map.remove(&key)
    }

    /// Moves the request at `key` to a new start sector within the same epoch. Returns the new key.
    pub fn reposition(&mut self, key: SortKey, sector: Sector) -> SortKey {
        let id: RequestId = match self.map.remove(&key) {
            Some(id) => id,
            None => panic!("reposition() of unknown sort key {:?}", key),
        };
        let new_key: SortKey = SortKey { sector, ..key };
        self.map.insert(new_key, id);
        new_key
    }

    /// Lowest request.
    pub fn first(&self) -> Option<RequestId> {
        self.map.first_key_value().map(|(_, id)| *id)
    }

    /// Request sorted right after `key`.
    pub fn next(&self, key: SortKey) -> Option<RequestId> {
        self.map
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, id)| *id)
    }

    /// Request sorted right before `key`.
    pub fn prev(&self, key: SortKey) -> Option<RequestId> {
        self.map.range(..key).next_back().map(|(_, id)| *id)
    }

    /// Requests in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = RequestId> + '_ {
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

#[cfg(test)]
mod tests {
    use super::{
        SortKey,
        SortList,
    };
    use crate::block::RequestId;
    use ::anyhow::Result;

    fn ids(list: &SortList) -> Vec<usize> {
        list.iter().map(usize::from).collect()
    }

    #[test]
    fn keeps_ascending_sector_order() -> Result<()> {
        let mut list: SortList = SortList::default();
        list.insert(RequestId::from(0), 300, false);
        list.insert(RequestId::from(1), 100, false);
        list.insert(RequestId::from(2), 200, false);
        list.insert(RequestId::from(3), 100, false);

        crate::ensure_eq!(ids(&list), vec![1, 3, 2, 0]);
        crate::ensure_eq!(list.first(), Some(RequestId::from(1)));
        Ok(())
    }

    #[test]
    fn barrier_fences_later_requests() -> Result<()> {
        let mut list: SortList = SortList::default();
        list.insert(RequestId::from(0), 500, false);
        let barrier: SortKey = list.insert(RequestId::from(1), 900, true);
        list.insert(RequestId::from(2), 10, false);
        list.insert(RequestId::from(3), 600, false);

        crate::ensure_eq!(ids(&list), vec![0, 1, 2, 3]);
        crate::ensure_eq!(list.prev(barrier), Some(RequestId::from(0)));
        crate::ensure_eq!(list.next(barrier), Some(RequestId::from(2)));
        Ok(())
    }

    #[test]
    fn reposition_keeps_arrival_tiebreak() -> Result<()> {
        let mut list: SortList = SortList::default();
        let a: SortKey = list.insert(RequestId::from(0), 100, false);
        list.insert(RequestId::from(1), 50, false);

        let a: SortKey = list.reposition(a, 40);
        crate::ensure_eq!(a.sector(), 40);
        crate::ensure_eq!(ids(&list), vec![0, 1]);
        crate::ensure_eq!(list.remove(a), Some(RequestId::from(0)));
        crate::ensure_eq!(list.len(), 1);
        Ok(())
    }
}
