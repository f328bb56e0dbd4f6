use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

pub static SYNC_CYCLES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static SYNC_CYCLES_SKIPPED_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static MUTATIONS_ACCEPTED_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static MUTATIONS_CONFLICT_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static MUTATIONS_TRANSIENT_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static MUTATIONS_EXHAUSTED_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static MUTATIONS_DISCARDED_TOTAL: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Conflict,
    Transient,
    Exhausted,
    Discarded,
}

pub fn record_cycle(skipped: bool) {
    if skipped {
        SYNC_CYCLES_SKIPPED_TOTAL.fetch_add(1, Ordering::Relaxed);
    } else {
        SYNC_CYCLES_TOTAL.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_outcome(outcome: Outcome) {
    let counter = match outcome {
        Outcome::Accepted => &MUTATIONS_ACCEPTED_TOTAL,
        Outcome::Conflict => &MUTATIONS_CONFLICT_TOTAL,
        Outcome::Transient => &MUTATIONS_TRANSIENT_TOTAL,
        Outcome::Exhausted => &MUTATIONS_EXHAUSTED_TOTAL,
        Outcome::Discarded => &MUTATIONS_DISCARDED_TOTAL,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Prometheus text exposition of every counter.
pub fn render_prometheus() -> String {
    let counters: [(&str, &str, &AtomicU64); 7] = [
        ("tally_sync_cycles_total", "Sync cycles started", &SYNC_CYCLES_TOTAL),
        (
            "tally_sync_cycles_skipped_total",
            "Sync requests skipped (busy or offline)",
            &SYNC_CYCLES_SKIPPED_TOTAL,
        ),
        (
            "tally_mutations_accepted_total",
            "Mutations accepted by the remote service",
            &MUTATIONS_ACCEPTED_TOTAL,
        ),
        (
            "tally_mutations_conflict_total",
            "Mutations rejected as conflicts",
            &MUTATIONS_CONFLICT_TOTAL,
        ),
        (
            "tally_mutations_transient_total",
            "Transient delivery failures",
            &MUTATIONS_TRANSIENT_TOTAL,
        ),
        (
            "tally_mutations_exhausted_total",
            "Mutations parked after exhausting retries",
            &MUTATIONS_EXHAUSTED_TOTAL,
        ),
        (
            "tally_mutations_discarded_total",
            "Mutations of unrecognized kind discarded",
            &MUTATIONS_DISCARDED_TOTAL,
        ),
    ];

    let mut out = String::new();
    for (name, help, counter) in counters {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {}", counter.load(Ordering::Relaxed));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_counter() {
        record_outcome(Outcome::Conflict);
        let text = render_prometheus();
        assert!(text.contains("# TYPE tally_sync_cycles_total counter"));
        assert!(text.contains("tally_mutations_discarded_total "));

        let conflicts = text
            .lines()
            .find(|l| l.starts_with("tally_mutations_conflict_total "))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap();
        assert!(conflicts >= 1);
    }
}
