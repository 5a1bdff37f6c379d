//! Remote-key translation tables used during device migration (spec §4.5).

use crate::error::{RdmaError, Result};

/// One `(old_rkey, new_rkey)` pair recorded during a `dup2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RkeyPair {
    /// The rkey this task used to hold, against the old device.
    pub old_rkey: u32,
    /// The rkey it now holds, against the new device.
    pub new_rkey: u32,
}

/// Table of rkeys this Connection re-registered during a `dup2`, keyed by the
/// old rkey (spec §3, §4.5).
#[derive(Debug, Default)]
pub struct RkeyTbl {
    entries: Vec<RkeyPair>,
}

impl RkeyTbl {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a re-registration. Overwrites any prior entry for the same `old_rkey`.
    pub fn record(&mut self, old_rkey: u32, new_rkey: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.old_rkey == old_rkey) {
            entry.new_rkey = new_rkey;
        } else {
            self.entries.push(RkeyPair { old_rkey, new_rkey });
        }
    }

    /// Translates `old_rkey` to its new value. `0` is always returned unchanged
    /// (spec §8 property 4).
    #[must_use]
    pub fn translate(&self, old_rkey: u32) -> Option<u32> {
        if old_rkey == 0 {
            return Some(0);
        }
        self.entries
            .iter()
            .find(|e| e.old_rkey == old_rkey)
            .map(|e| e.new_rkey)
    }

    /// Number of recorded pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Table of peer-granted remote keys this Connection has been handed,
/// translated the same way after a `dup2` (spec §4.5).
#[derive(Debug, Default)]
pub struct PeerRkeyTbl {
    inner: RkeyTbl,
}

impl PeerRkeyTbl {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a peer rkey re-homed onto the new device.
    pub fn record(&mut self, old_rkey: u32, new_rkey: u32) {
        self.inner.record(old_rkey, new_rkey);
    }

    /// Translates an incoming message's peer-granted `old_rkey`; fails on an
    /// unknown non-zero key (spec §4.5, §7 `RkeyUnknown`).
    pub fn translate(&self, old_rkey: u32) -> Result<u32> {
        self.inner
            .translate(old_rkey)
            .ok_or(RdmaError::RkeyUnknown(old_rkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_returns_recorded_pair() {
        let mut tbl = RkeyTbl::new();
        tbl.record(0xAAAA, 0xBBBB);
        assert_eq!(tbl.translate(0xAAAA), Some(0xBBBB));
    }

    #[test]
    fn translate_zero_is_identity() {
        let tbl = RkeyTbl::new();
        assert_eq!(tbl.translate(0), Some(0));
    }

    #[test]
    fn translate_unknown_is_none() {
        let tbl = RkeyTbl::new();
        assert_eq!(tbl.translate(0x1234), None);
    }

    #[test]
    fn peer_table_unknown_key_errors() {
        let tbl = PeerRkeyTbl::new();
        assert!(matches!(tbl.translate(0x1234), Err(RdmaError::RkeyUnknown(0x1234))));
    }

    #[test]
    fn peer_table_translates_after_record() {
        let mut tbl = PeerRkeyTbl::new();
        tbl.record(0x10, 0x20);
        assert_eq!(tbl.translate(0x10).unwrap(), 0x20);
        assert_eq!(tbl.translate(0).unwrap(), 0);
    }
}
