//! Ordering of event revisions produced by different clusters.
//!
//! A revision packs a sequence number in bits 0-12, the producing cluster id in bits 13-18 and
//! the wall clock in milliseconds in bits 19-63. Revisions of one cluster compare as integers.
//! Revisions of different clusters compare by their clocks, and clocks closer than the allowed
//! NTP drift are treated as concurrent.

use std::cmp::Ordering;

const SEQUENCE_BITS: u32 = 13;
const CLUSTER_BITS: u32 = 6;
const CLUSTER_SHIFT: u32 = SEQUENCE_BITS;
const MILLIS_SHIFT: u32 = SEQUENCE_BITS + CLUSTER_BITS;
const CLUSTER_MASK: u64 = (1 << CLUSTER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// 2020-05-10T00:00:00Z in milliseconds since the epoch.
const V2_EPOCH_MILLIS: u64 = 1_589_068_800_000;

/// The smallest revision using the structured layout: 2020-05-10T00:00:00Z, cluster 0,
/// sequence 1. Anything below is an opaque counter.
pub const V2_MIN_REVISION: u64 = (V2_EPOCH_MILLIS << MILLIS_SHIFT) | 1;

/// Default tolerated clock difference between clusters.
pub const DEFAULT_ALLOWED_NTP_DIFF_MS: u64 = 5000;

/// Packs a revision.
pub fn encode_revision(millis: u64, cluster_id: u64, sequence: u64) -> u64 {
    (millis << MILLIS_SHIFT)
        | ((cluster_id & CLUSTER_MASK) << CLUSTER_SHIFT)
        | (sequence & SEQUENCE_MASK)
}

/// The cluster that produced a revision.
pub fn cluster_id(revision: u64) -> u64 {
    (revision >> CLUSTER_SHIFT) & CLUSTER_MASK
}

/// The wall clock of a revision in milliseconds.
pub fn millis(revision: u64) -> u64 {
    revision >> MILLIS_SHIFT
}

/// Compares revisions with a configurable clock tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevisionComparator {
    allowed_ntp_diff_ms: u64,
}

impl Default for RevisionComparator {
    fn default() -> Self {
        RevisionComparator {
            allowed_ntp_diff_ms: DEFAULT_ALLOWED_NTP_DIFF_MS,
        }
    }
}

impl RevisionComparator {
    /// A comparator tolerating the given drift.
    pub fn new(allowed_ntp_diff_ms: u64) -> Self {
        RevisionComparator {
            allowed_ntp_diff_ms,
        }
    }

    /// Orders two revisions. `Equal` across clusters means the two are concurrent.
    pub fn compare(&self, a: u64, b: u64) -> Ordering {
        if a < V2_MIN_REVISION || b < V2_MIN_REVISION || cluster_id(a) == cluster_id(b) {
            return a.cmp(&b);
        }
        let (ma, mb) = (millis(a), millis(b));
        if ma.abs_diff(mb) <= self.allowed_ntp_diff_ms {
            Ordering::Equal
        } else {
            ma.cmp(&mb)
        }
    }

    /// Whether an event at `a` should supersede one at `b`. Concurrent events from different
    /// clusters supersede each other so that neither is dropped.
    pub fn is_newer(&self, a: u64, b: u64) -> bool {
        match self.compare(a, b) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                a >= V2_MIN_REVISION && b >= V2_MIN_REVISION && cluster_id(a) != cluster_id(b)
            }
        }
    }
}

/// [`RevisionComparator::compare`] with the default tolerance.
pub fn compare_revision(a: u64, b: u64) -> Ordering {
    RevisionComparator::default().compare(a, b)
}

/// [`RevisionComparator::is_newer`] with the default tolerance.
pub fn revision_is_newer(a: u64, b: u64) -> bool {
    RevisionComparator::default().is_newer(a, b)
}
