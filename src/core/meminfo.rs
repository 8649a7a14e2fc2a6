//! Sanitizing guest-reported memory usage.
//!
//! Everything in here treats its input as hostile: a guest controls the blob
//! completely. A sample that fails any check is rejected as a whole and the
//! domain keeps whatever estimate it had before.

use serde::{Deserialize, Serialize};

use crate::core::domain::DomainState;
use crate::errors::MeminfoError;
use crate::utils::KIB;

/// Upper bound on the raw blob, matching the store's value size limit.
pub const MAX_SAMPLE_LEN: usize = 4096;

const REQUIRED_FIELDS: [&str; 6] = [
    "MemTotal",
    "MemFree",
    "Buffers",
    "Cached",
    "SwapTotal",
    "SwapFree",
];

/// A validated usage sample. All figures are bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Meminfo {
    /// Guest reported its used memory directly.
    Used(u64),
    /// Guest forwarded its `/proc/meminfo` counters.
    Detailed {
        mem_total: u64,
        mem_free: u64,
        buffers: u64,
        cached: u64,
        swap_total: u64,
        swap_free: u64,
    },
}

impl Meminfo {
    /// Memory the guest actually needs: resident minus reclaimable caches, plus swapped-out pages.
    pub fn mem_used(&self) -> Option<u64> {
        match *self {
            Meminfo::Used(used) => Some(used),
            Meminfo::Detailed {
                mem_total,
                mem_free,
                buffers,
                cached,
                swap_total,
                swap_free,
            } => mem_total
                .checked_sub(mem_free)?
                .checked_sub(buffers)?
                .checked_sub(cached)?
                .checked_add(swap_total.checked_sub(swap_free)?),
        }
    }
}

/// Parse an untrusted blob. Accepts either a bare byte count or
/// `/proc/meminfo`-style `Key: value kB` lines.
pub fn parse(untrusted: &str) -> Result<Meminfo, MeminfoError> {
    if untrusted.len() > MAX_SAMPLE_LEN {
        return Err(MeminfoError::TooLarge(untrusted.len()));
    }
    let untrusted = untrusted.trim();
    if untrusted.is_empty() {
        return Err(MeminfoError::Empty);
    }

    if !untrusted.contains(':') {
        let used = untrusted
            .parse::<u64>()
            .map_err(|_| invalid("mem_used", untrusted))?;
        return Ok(Meminfo::Used(used));
    }

    let mut values: [Option<u64>; 6] = [None; 6];
    for line in untrusted.lines() {
        let Some((key, raw)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let Some(slot) = REQUIRED_FIELDS.iter().position(|f| *f == key) else {
            continue;
        };
        let raw = raw.trim();
        let digits = raw.strip_suffix("kB").map(str::trim_end).unwrap_or(raw);
        let kib = digits.parse::<u64>().map_err(|_| invalid(key, raw))?;
        let bytes = kib
            .checked_mul(KIB)
            .ok_or(MeminfoError::Overflow(REQUIRED_FIELDS[slot]))?;
        values[slot] = Some(bytes);
    }

    let mut fields = [0u64; 6];
    for (slot, value) in values.iter().enumerate() {
        fields[slot] = value.ok_or(MeminfoError::MissingField(REQUIRED_FIELDS[slot]))?;
    }
    let [mem_total, mem_free, buffers, cached, swap_total, swap_free] = fields;

    if swap_free > swap_total {
        return Err(MeminfoError::Suspicious("SwapFree exceeds SwapTotal"));
    }
    let reclaimable = mem_free
        .checked_add(cached)
        .and_then(|v| v.checked_add(buffers))
        .ok_or(MeminfoError::Overflow("MemFree"))?;
    if reclaimable > mem_total {
        return Err(MeminfoError::Suspicious(
            "MemFree + Cached + Buffers exceeds MemTotal",
        ));
    }

    let info = Meminfo::Detailed {
        mem_total,
        mem_free,
        buffers,
        cached,
        swap_total,
        swap_free,
    };
    info.mem_used().ok_or(MeminfoError::Overflow("SwapTotal"))?;
    Ok(info)
}

/// Validate `untrusted` and, only if every check passes, store it on `dom`.
/// `limit` caps the plausible usage (total host memory).
pub fn ingest(dom: &mut DomainState, untrusted: &str, limit: u64) -> Result<u64, MeminfoError> {
    let info = parse(untrusted)?;
    let used = info.mem_used().ok_or(MeminfoError::Overflow("mem_used"))?;
    if used > limit {
        return Err(MeminfoError::OutOfRange { used, limit });
    }
    dom.meminfo = Some(info);
    dom.mem_used = Some(used);
    Ok(used)
}

fn invalid(field: &str, value: &str) -> MeminfoError {
    MeminfoError::InvalidValue {
        field: field.to_string(),
        value: value.chars().take(32).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mib;

    fn sample(fields: [u64; 6]) -> String {
        let mut blob = String::new();
        for (name, kib) in REQUIRED_FIELDS.iter().zip(fields) {
            blob.push_str(&format!("{}:  {} kB\n", name, kib));
        }
        blob.push_str("Active:  123456 kB\n");
        blob
    }

    const NORMAL: [u64; 6] = [1024000, 200000, 24000, 300000, 512000, 412000];

    #[test]
    fn parses_proc_meminfo_block() {
        let info = parse(&sample(NORMAL)).unwrap();
        let expected = (1024000 - 200000 - 24000 - 300000 + 512000 - 412000) * KIB;
        assert_eq!(info.mem_used(), Some(expected));
    }

    #[test]
    fn parses_bare_byte_count() {
        assert_eq!(parse(" 1048576\n").unwrap(), Meminfo::Used(1048576));
    }

    #[test]
    fn rejects_negative_and_garbage_values() {
        assert!(matches!(parse("-5"), Err(MeminfoError::InvalidValue { .. })));
        assert!(matches!(parse("lots"), Err(MeminfoError::InvalidValue { .. })));
        let bad = sample(NORMAL).replace("200000", "-200000");
        assert!(matches!(parse(&bad), Err(MeminfoError::InvalidValue { .. })));
        assert!(matches!(parse("MemTotal: ünïcödé kB"), Err(MeminfoError::InvalidValue { .. })));
    }

    #[test]
    fn rejects_missing_fields() {
        let partial = "MemTotal: 100 kB\nMemFree: 10 kB\n";
        assert_eq!(parse(partial), Err(MeminfoError::MissingField("Buffers")));
    }

    #[test]
    fn rejects_inconsistent_counters() {
        let swap = sample([1024000, 200000, 24000, 300000, 512000, 612000]);
        assert!(matches!(parse(&swap), Err(MeminfoError::Suspicious(_))));

        let free = sample([1024000, 900000, 24000, 300000, 512000, 412000]);
        assert!(matches!(parse(&free), Err(MeminfoError::Suspicious(_))));
    }

    #[test]
    fn rejects_overflowing_values() {
        let huge = sample([u64::MAX, 200000, 24000, 300000, 512000, 412000]);
        assert_eq!(parse(&huge), Err(MeminfoError::Overflow("MemTotal")));
    }

    #[test]
    fn rejects_oversized_and_empty_blobs() {
        let big = "1".repeat(MAX_SAMPLE_LEN + 1);
        assert_eq!(parse(&big), Err(MeminfoError::TooLarge(MAX_SAMPLE_LEN + 1)));
        assert_eq!(parse("   \n"), Err(MeminfoError::Empty));
    }

    #[test]
    fn failed_ingest_keeps_previous_estimate() {
        let mut dom = DomainState::new(4);
        ingest(&mut dom, &mib(300).to_string(), mib(4096)).unwrap();
        let before = dom.clone();

        assert!(ingest(&mut dom, "-1", mib(4096)).is_err());
        assert!(ingest(&mut dom, &mib(9000).to_string(), mib(4096)).is_err());
        assert_eq!(dom, before);
        assert_eq!(dom.mem_used, Some(mib(300)));
    }
}
