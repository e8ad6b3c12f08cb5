//! Time-ordered identifiers and the dotted-order encoding.
//!
//! A [`RunId`] is a 128-bit value whose most-significant 48 bits are an
//! epoch-millisecond timestamp, whose next 12 bits are a per-process
//! monotonic counter (breaking ties between ids minted in the same
//! millisecond), and whose remaining 68 bits are random. Two ids minted
//! in the same process in the same millisecond still sort consistently
//! with mint order because of the counter; ids are otherwise globally
//! unique by construction (time + random bits), so independent
//! processes never need to coordinate to avoid collisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const COUNTER_BITS: u32 = 12;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Global (epoch_ms, counter) state used to keep ids minted within the
/// same millisecond strictly increasing. Packed into one atomic so the
/// read-modify-write is a single CAS loop.
static LAST: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Returns `(epoch_ms, counter)` such that repeated calls within one
/// process never produce the same pair, and the pair sorts the same as
/// mint order.
fn next_tick() -> (u64, u16) {
    loop {
        let now = now_millis();
        let prev = LAST.load(Ordering::Relaxed);
        let prev_ms = prev >> COUNTER_BITS;
        let (new_ms, counter) = if now > prev_ms {
            (now, 0u64)
        } else {
            let next_counter = (prev & COUNTER_MASK) + 1;
            if next_counter > COUNTER_MASK {
                // Counter exhausted within this millisecond: spin into
                // the next millisecond rather than overflow into the
                // timestamp bits.
                (prev_ms + 1, 0)
            } else {
                (prev_ms, next_counter)
            }
        };
        let packed = (new_ms << COUNTER_BITS) | counter;
        if LAST
            .compare_exchange_weak(prev, packed, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return (new_ms, counter as u16);
        }
    }
}

/// A time-ordered 128-bit run identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u128);

impl RunId {
    /// Mints a fresh, time-ordered id using the current wall clock.
    pub fn new() -> Self {
        let (epoch_ms, counter) = next_tick();
        Self::from_parts(epoch_ms, counter, rand::random())
    }

    /// Builds an id from explicit parts. `random` is masked to the low
    /// 68 bits; any higher bits are discarded.
    pub fn from_parts(epoch_ms: u64, counter: u16, random: u128) -> Self {
        let mut bits: u128 = (epoch_ms as u128) << 80;
        bits |= ((counter as u128) & COUNTER_MASK as u128) << 68;
        bits |= random & ((1u128 << 68) - 1);
        Self(bits)
    }

    /// The embedded epoch-millisecond timestamp.
    pub fn epoch_millis(&self) -> u64 {
        (self.0 >> 80) as u64
    }

    /// The embedded per-millisecond counter.
    pub fn counter(&self) -> u16 {
        ((self.0 >> 68) & COUNTER_MASK as u128) as u16
    }

    /// Wraps an externally supplied 128-bit value (e.g. a `Uuid` handed
    /// in by the caller). Does not validate that it is time-ordered;
    /// callers that care should check [`RunId::is_time_ordered`] and log
    /// a warning; out-of-order ids are accepted, not rejected.
    pub fn from_u128(bits: u128) -> Self {
        Self(bits)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Best-effort check that this id's top 48 bits look like a
    /// plausible epoch-millisecond timestamp (within a generous past/
    /// future window). Externally supplied ids failing this check still
    /// work, but downstream dotted-order ordering guarantees weaken.
    pub fn is_time_ordered(&self) -> bool {
        let ms = self.epoch_millis();
        let now = now_millis();
        // Accept anything from year ~2000 through ~50 years in the future.
        const YEAR_2000_MS: u64 = 946_684_800_000;
        ms >= YEAR_2000_MS && ms <= now.saturating_add(50 * 365 * 24 * 3600 * 1000)
    }

    fn to_uuid(self) -> Uuid {
        Uuid::from_u128(self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.to_uuid())
    }
}

impl std::str::FromStr for RunId {
    type Err = crate::error::TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| crate::error::TraceError::Validation(format!("invalid run id {s:?}: {e}")))?;
        Ok(Self(uuid.as_u128()))
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Encodes an epoch-millisecond timestamp plus a 0-999 execution-order
/// suffix into a 20-character string that sorts lexicographically the
/// same as chronologically: `YYYYMMDDTHHMMSSmmm###`.
pub fn encode_timestamp_lex(epoch_ms: i64, exec_order: u32) -> String {
    use chrono::{TimeZone, Utc};
    let dt = Utc
        .timestamp_millis_opt(epoch_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap());
    format!(
        "{}{:03}",
        dt.format("%Y%m%dT%H%M%S%3f"),
        exec_order % 1000
    )
}

/// Decodes a timestamp-lex string back into `(epoch_ms, exec_order)`.
pub fn decode_timestamp_lex(s: &str) -> crate::error::Result<(i64, u32)> {
    use chrono::{NaiveDateTime, TimeZone, Utc};
    if s.len() != 20 {
        return Err(crate::error::TraceError::InvalidDottedOrder(format!(
            "timestamp-lex segment has wrong length: {s:?}"
        )));
    }
    let (ts_part, order_part) = s.split_at(17);
    let naive = NaiveDateTime::parse_from_str(ts_part, "%Y%m%dT%H%M%S%3f").map_err(|e| {
        crate::error::TraceError::InvalidDottedOrder(format!("bad timestamp {ts_part:?}: {e}"))
    })?;
    let epoch_ms = Utc.from_utc_datetime(&naive).timestamp_millis();
    let exec_order: u32 = order_part.parse().map_err(|e| {
        crate::error::TraceError::InvalidDottedOrder(format!("bad exec-order {order_part:?}: {e}"))
    })?;
    Ok((epoch_ms, exec_order))
}

/// One `⟨timestamp-lex⟩Z⟨id⟩` segment of a dotted-order string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub timestamp_lex: String,
    pub id: RunId,
}

impl Segment {
    pub fn new(epoch_ms: i64, exec_order: u32, id: RunId) -> Self {
        Self {
            timestamp_lex: encode_timestamp_lex(epoch_ms, exec_order),
            id,
        }
    }

    pub fn format(&self) -> String {
        format!("{}Z{}", self.timestamp_lex, self.id)
    }

    pub fn parse(s: &str) -> crate::error::Result<Self> {
        let (ts, id) = s.split_once('Z').ok_or_else(|| {
            crate::error::TraceError::InvalidDottedOrder(format!("missing 'Z' separator: {s:?}"))
        })?;
        // `ts` must still decode cleanly even though we don't need the
        // parsed value here — this validates segment shape eagerly.
        decode_timestamp_lex(ts)?;
        let id: RunId = id
            .parse()
            .map_err(|_| crate::error::TraceError::InvalidDottedOrder(format!("bad id: {id:?}")))?;
        Ok(Self {
            timestamp_lex: ts.to_string(),
            id,
        })
    }
}

/// Joins ancestor segments and a final self segment into a dotted-order
/// string. Pure, side-effect free.
pub fn join_segments(parents: &[Segment], own: &Segment) -> String {
    let mut parts: Vec<String> = parents.iter().map(Segment::format).collect();
    parts.push(own.format());
    parts.join(".")
}

/// Splits a dotted-order string into its segments.
pub fn split_segments(dotted: &str) -> crate::error::Result<Vec<Segment>> {
    dotted.split('.').map(Segment::parse).collect()
}

/// Rewrites segments left-to-right so each segment's timestamp-lex is
/// strictly greater than the previous one's, preserving each segment's
/// id and execution-order suffix. Idempotent:
/// running `fix` on an already-fixed string is a no-op.
pub fn fix(dotted: &str) -> crate::error::Result<String> {
    let mut segments = split_segments(dotted)?;
    for i in 1..segments.len() {
        // Compare the full 20-char timestamp-lex, not just the decoded
        // ms: two segments sharing a ms but already separated by a
        // strictly-greater execution-order suffix are already ordered
        // and must be left untouched.
        if segments[i].timestamp_lex.as_str() <= segments[i - 1].timestamp_lex.as_str() {
            let (prev_ms, _) = decode_timestamp_lex(&segments[i - 1].timestamp_lex)?;
            let (_, cur_order) = decode_timestamp_lex(&segments[i].timestamp_lex)?;
            segments[i].timestamp_lex = encode_timestamp_lex(prev_ms + 1, cur_order);
        }
    }
    Ok(segments
        .iter()
        .map(Segment::format)
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ids_mint_unique_and_ordered_within_same_millisecond() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        // Counters are assigned under a shared clock tick, so either the
        // millisecond advanced or the counter did.
        assert!(b.as_u128() > a.as_u128() || b.epoch_millis() >= a.epoch_millis());
    }

    #[test]
    fn run_id_round_trips_through_display_and_parse() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn timestamp_lex_round_trips() {
        let epoch_ms = 1_700_000_123_456i64;
        let s = encode_timestamp_lex(epoch_ms, 42);
        assert_eq!(s.len(), 20);
        let (ms, order) = decode_timestamp_lex(&s).unwrap();
        assert_eq!(ms, epoch_ms);
        assert_eq!(order, 42);
    }

    #[test]
    fn fix_pass_shifts_equal_or_earlier_child_forward() {
        let parent = Segment::new(1_700_000_000_000, 0, RunId::new());
        // Child minted with the same millisecond as the parent — a
        // coarse-clock tie the fix-pass must repair.
        let child = Segment::new(1_700_000_000_000, 0, RunId::new());
        let dotted = join_segments(&[parent.clone()], &child);
        let fixed = fix(&dotted).unwrap();
        let segments = split_segments(&fixed).unwrap();
        let (parent_ms, _) = decode_timestamp_lex(&segments[0].timestamp_lex).unwrap();
        let (child_ms, _) = decode_timestamp_lex(&segments[1].timestamp_lex).unwrap();
        assert!(child_ms > parent_ms);
        // Id suffix is preserved by the fix-pass.
        assert_eq!(segments[1].id, child.id);
    }

    #[test]
    fn fix_leaves_a_same_ms_child_untouched_when_its_order_suffix_already_sorts_later() {
        // Same millisecond as the parent, but the child's execution-order
        // suffix already makes its full timestamp-lex sort later — the
        // fix-pass must not rewrite its ms in this case.
        let parent = Segment::new(1_700_000_000_000, 3, RunId::new());
        let child = Segment::new(1_700_000_000_000, 5, RunId::new());
        let dotted = join_segments(&[parent.clone()], &child);
        let fixed = fix(&dotted).unwrap();
        let segments = split_segments(&fixed).unwrap();
        assert_eq!(segments[1].timestamp_lex, child.timestamp_lex);
        let (parent_ms, _) = decode_timestamp_lex(&segments[0].timestamp_lex).unwrap();
        let (child_ms, _) = decode_timestamp_lex(&segments[1].timestamp_lex).unwrap();
        assert_eq!(child_ms, parent_ms);
    }

    #[test]
    fn fix_is_idempotent() {
        let parent = Segment::new(1_700_000_000_000, 0, RunId::new());
        let child = Segment::new(1_700_000_000_000, 0, RunId::new());
        let dotted = join_segments(&[parent], &child);
        let once = fix(&dotted).unwrap();
        let twice = fix(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn dotted_order_is_a_prefix_relation() {
        let root = Segment::new(1_700_000_000_000, 0, RunId::new());
        let root_dotted = join_segments(&[], &root);
        let child = Segment::new(1_700_000_000_050, 0, RunId::new());
        let child_dotted = join_segments(&[root.clone()], &child);
        assert!(child_dotted.starts_with(&root_dotted));
    }

    proptest::proptest! {
        // Property 1 (spec.md §8): whatever the input millisecond/order
        // values, a fixed chain is strictly increasing segment-to-segment,
        // regardless of how out-of-order or tied the inputs were.
        #[test]
        fn fix_pass_always_yields_a_strictly_increasing_chain(
            millis in proptest::collection::vec(1_600_000_000_000i64..1_800_000_000_000i64, 2..8),
            orders in proptest::collection::vec(0u32..1000, 2..8),
        ) {
            let n = millis.len().min(orders.len());
            let segments: Vec<Segment> = (0..n)
                .map(|i| Segment::new(millis[i], orders[i], RunId::new()))
                .collect();
            let (own, parents) = segments.split_last().unwrap();
            let dotted = join_segments(parents, own);
            let fixed = fix(&dotted).unwrap();
            let fixed_segments = split_segments(&fixed).unwrap();
            let decoded: Vec<i64> = fixed_segments
                .iter()
                .map(|s| decode_timestamp_lex(&s.timestamp_lex).unwrap().0)
                .collect();
            for pair in decoded.windows(2) {
                prop_assert!(pair[1] > pair[0]);
            }
        }

        // Property 7 (spec.md §8): running `fix` twice is the same as
        // running it once, for any well-formed chain.
        #[test]
        fn fix_pass_is_idempotent_for_any_chain(
            millis in proptest::collection::vec(1_600_000_000_000i64..1_800_000_000_000i64, 1..8),
            orders in proptest::collection::vec(0u32..1000, 1..8),
        ) {
            let n = millis.len().min(orders.len());
            let segments: Vec<Segment> = (0..n)
                .map(|i| Segment::new(millis[i], orders[i], RunId::new()))
                .collect();
            let (own, parents) = segments.split_last().unwrap();
            let dotted = join_segments(parents, own);
            let once = fix(&dotted).unwrap();
            let twice = fix(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
