// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    block::{
        RequestId,
        Sector,
    },
    runtime::fail::Fail,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// log2 of the number of hash buckets.
pub const DL_HASH_SHIFT: u32 = 10;

/// Multiplier of the bucket function (2^64 divided by the golden ratio).
const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Verdict of a hash lookup on one bucket entry.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum HashProbe {
    /// The entry belongs to an older generation or can no longer merge. It is dropped from its bucket.
    Stale,
    /// The entry is live but does not end at the looked up sector.
    Miss,
    /// The entry ends at the looked up sector.
    Hit,
}

/// Back-merge hash: requests bucketed by end sector.
///
/// Entries carry no state of their own. Each one is stamped, on the scheduler side, with the generation that was
/// current when it was inserted; [MergeHash::invalidate] starts a new generation, which turns every existing entry
/// stale without walking the buckets.
pub struct MergeHash {
    buckets: Vec<Vec<RequestId>>,
    /// Current generation. Never zero, zero marks requests that are off the hash.
    valid_count: u32,
    shift: u32,
    len: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl MergeHash {
    /// Allocates a hash with `1 << shift` buckets.
    pub fn new(shift: u32) -> Result<Self, Fail> {
        debug_assert!(shift > 0 && shift < 32);
        let nr_buckets: usize = 1 << shift;
        let mut buckets: Vec<Vec<RequestId>> = Vec::new();
        buckets.try_reserve_exact(nr_buckets)?;
        buckets.resize_with(nr_buckets, Vec::new);

        Ok(Self {
            buckets,
            valid_count: 1,
            shift,
            len: 0,
        })
    }

    /// Stamp for entries inserted now.
    pub fn generation(&self) -> u32 {
        self.valid_count
    }

    /// Starts a new generation.
    pub fn invalidate(&mut self) {
        self.valid_count = self.valid_count.wrapping_add(1);
        if self.valid_count == 0 {
            self.valid_count = 1;
        }
    }

    /// Bucket that holds requests ending at `key`.
    pub fn bucket_of(&self, key: Sector) -> usize {
        let block: u64 = key >> 3;
        (block.wrapping_mul(GOLDEN_RATIO_64) >> (64 - self.shift)) as usize
    }

    pub fn insert(&mut self, id: RequestId, key: Sector) {
        let bucket: usize = self.bucket_of(key);
        self.buckets[bucket].push(id);
        self.len += 1;
    }

    /// Removes `id`, which was inserted under `key`. Returns false if it was not there.
    pub fn remove(&mut self, id: RequestId, key: Sector) -> bool {
        let bucket: usize = self.bucket_of(key);
        let entries: &mut Vec<RequestId> = &mut self.buckets[bucket];
        match entries.iter().position(|entry| *entry == id) {
            Some(ix) => {
                entries.remove(ix);
                self.len -= 1;
                true
            },
            None => false,
        }
    }

    /// Walks the bucket of `key`, newest entry first, until `probe` reports a hit. Entries reported stale on the way
    /// are dropped.
    pub fn find<F>(&mut self, key: Sector, mut probe: F) -> Option<RequestId>
    where
        F: FnMut(RequestId) -> HashProbe,
    {
        let bucket: usize = self.bucket_of(key);
        let entries: &mut Vec<RequestId> = &mut self.buckets[bucket];
        let mut ix: usize = entries.len();
        while ix > 0 {
            ix -= 1;
            match probe(entries[ix]) {
                HashProbe::Stale => {
                    entries.remove(ix);
                    self.len -= 1;
                },
                HashProbe::Miss => (),
                HashProbe::Hit => return Some(entries[ix]),
            }
        }
        None
    }

    /// Whether `id` sits in the bucket of `key`.
    pub fn contains(&self, id: RequestId, key: Sector) -> bool {
        self.buckets[self.bucket_of(key)].contains(&id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
