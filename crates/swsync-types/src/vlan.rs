//! VLAN ids, membership bitmaps and the membership diff.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q VLAN identifier (1-4094).
///
/// ```
/// use swsync_types::VlanId;
///
/// assert_eq!(VlanId::new(100).unwrap().as_u16(), 100);
/// assert!(VlanId::new(0).is_err());
/// assert!(VlanId::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    /// VLAN used for untagged traffic on ports without an explicit PVID.
    pub const DEFAULT: VlanId = VlanId(1);

    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("Vlan")
            .or_else(|| s.strip_prefix("vlan"))
            .unwrap_or(s);
        let id: u16 = digits.parse().map_err(|_| ParseError::InvalidVlanId(0))?;
        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

const WORDS: usize = 4096 / 32;

/// Set of VLANs stored as 128 words of 32 bits, bit `n` of word `k` standing
/// for VLAN `32 * k + n`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VlanBitmap([u32; WORDS]);

impl VlanBitmap {
    pub const fn new() -> Self {
        VlanBitmap([0; WORDS])
    }

    pub fn insert(&mut self, vid: VlanId) -> bool {
        let (word, bit) = Self::slot(vid);
        let was = self.0[word] & bit != 0;
        self.0[word] |= bit;
        !was
    }

    pub fn remove(&mut self, vid: VlanId) -> bool {
        let (word, bit) = Self::slot(vid);
        let was = self.0[word] & bit != 0;
        self.0[word] &= !bit;
        was
    }

    pub fn contains(&self, vid: VlanId) -> bool {
        let (word, bit) = Self::slot(vid);
        self.0[word] & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Raw words, lowest VLANs first.
    pub fn words(&self) -> &[u32; WORDS] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = VlanId> + '_ {
        bits_of(&self.0)
    }

    fn slot(vid: VlanId) -> (usize, u32) {
        let v = usize::from(vid.as_u16());
        (v / 32, 1u32 << (v % 32))
    }
}

impl Default for VlanBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VlanBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|v| v.as_u16())).finish()
    }
}

impl FromIterator<VlanId> for VlanBitmap {
    fn from_iter<I: IntoIterator<Item = VlanId>>(iter: I) -> Self {
        let mut bitmap = VlanBitmap::new();
        for vid in iter {
            bitmap.insert(vid);
        }
        bitmap
    }
}

impl Serialize for VlanBitmap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for VlanBitmap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let vids = Vec::<VlanId>::deserialize(deserializer)?;
        Ok(vids.into_iter().collect())
    }
}

/// Yields every set bit of `words` as a VLAN id. Bits 0 and 4095 never hold
/// a valid id and are skipped.
fn bits_of(words: &[u32; WORDS]) -> impl Iterator<Item = VlanId> + '_ {
    words.iter().enumerate().flat_map(|(k, word)| {
        let mut w = *word;
        std::iter::from_fn(move || {
            while w != 0 {
                let bit = w.trailing_zeros();
                w &= w - 1;
                let raw = (k as u32 * 32 + bit) as u16;
                if let Ok(vid) = VlanId::new(raw) {
                    return Some(vid);
                }
            }
            None
        })
    })
}

/// VLAN membership of one bridge port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanMembership {
    members: VlanBitmap,
    untagged: VlanBitmap,
    pvid: Option<VlanId>,
}

impl VlanMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot, rejecting a PVID that is not a member and dropping
    /// untagged bits for non-members.
    pub fn from_parts(
        members: VlanBitmap,
        mut untagged: VlanBitmap,
        pvid: Option<VlanId>,
    ) -> Result<Self, ParseError> {
        if let Some(p) = pvid {
            if !members.contains(p) {
                return Err(ParseError::PvidNotMember(p.as_u16()));
            }
        }
        for (u, m) in untagged.0.iter_mut().zip(members.0.iter()) {
            *u &= *m;
        }
        Ok(VlanMembership {
            members,
            untagged,
            pvid,
        })
    }

    /// Adds `vid`, optionally untagged and optionally as PVID.
    pub fn add(&mut self, vid: VlanId, untagged: bool, pvid: bool) {
        self.members.insert(vid);
        if untagged {
            self.untagged.insert(vid);
        } else {
            self.untagged.remove(vid);
        }
        if pvid {
            self.pvid = Some(vid);
        } else if self.pvid == Some(vid) {
            self.pvid = None;
        }
    }

    /// Removes `vid`; clears the PVID if it pointed at it.
    pub fn remove(&mut self, vid: VlanId) {
        self.members.remove(vid);
        self.untagged.remove(vid);
        if self.pvid == Some(vid) {
            self.pvid = None;
        }
    }

    pub fn is_member(&self, vid: VlanId) -> bool {
        self.members.contains(vid)
    }

    pub fn is_untagged(&self, vid: VlanId) -> bool {
        self.untagged.contains(vid)
    }

    pub fn pvid(&self) -> Option<VlanId> {
        self.pvid
    }

    pub fn members(&self) -> &VlanBitmap {
        &self.members
    }

    pub fn untagged(&self) -> &VlanBitmap {
        &self.untagged
    }

    /// Difference between two snapshots, computed one 32-bit word at a time.
    ///
    /// Every VLAN whose member bit, untagged bit or PVID role differs lands in
    /// exactly one of `added`, `removed` or `changed`; nothing else is touched.
    pub fn diff(old: &VlanMembership, new: &VlanMembership) -> VlanDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for k in 0..WORDS {
            let (om, nm) = (old.members.0[k], new.members.0[k]);
            let (ou, nu) = (old.untagged.0[k], new.untagged.0[k]);
            let member_diff = om ^ nm;
            let untagged_diff = (ou ^ nu) & om & nm;
            if member_diff == 0 && untagged_diff == 0 {
                continue;
            }
            collect_word(k, member_diff & nm, &mut added);
            collect_word(k, member_diff & om, &mut removed);
            collect_word(k, untagged_diff, &mut changed);
        }

        // A PVID move on a VLAN present in both snapshots is a change too.
        for pvid in [old.pvid, new.pvid].into_iter().flatten() {
            if old.is_member(pvid)
                && new.is_member(pvid)
                && (old.pvid == Some(pvid)) != (new.pvid == Some(pvid))
                && !changed.contains(&pvid)
            {
                changed.push(pvid);
            }
        }
        changed.sort();

        VlanDiff {
            added,
            removed,
            changed,
        }
    }
}

fn collect_word(k: usize, mut word: u32, out: &mut Vec<VlanId>) {
    while word != 0 {
        let bit = word.trailing_zeros();
        word &= word - 1;
        if let Ok(vid) = VlanId::new((k as u32 * 32 + bit) as u16) {
            out.push(vid);
        }
    }
}

/// Result of [`VlanMembership::diff`], each list in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VlanDiff {
    pub added: Vec<VlanId>,
    pub removed: Vec<VlanId>,
    /// Member in both snapshots, but untagged flag or PVID role moved.
    pub changed: Vec<VlanId>,
}

impl VlanDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
