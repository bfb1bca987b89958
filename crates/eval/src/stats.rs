//! Evaluation KPI snapshots
//!
//! Embedders that want to know whether memoization is earning its keep can
//! take an [`EvalStats`] snapshot at any point: human-readable via
//! `Display`, machine-readable via serde. This is a library surface only;
//! no environment variable or CLI reads happen here.

use serde::Serialize;

use crate::eval::Evaluator;

/// Point-in-time snapshot of the evaluator's memoization counters.
#[derive(Debug, Clone, Serialize)]
pub struct EvalStats {
    /// Fresh memo hits.
    pub thunk_hits: u64,
    /// Entries found but invalidated by a GC cycle advance.
    pub thunk_stale_hits: u64,
    /// Reductions whose results were inserted into the cache.
    pub thunk_misses: u64,
    /// Reductions not cached because an impure primop ran.
    pub impure_skips: u64,
    /// Reductions not cached because the value was shallowly uncacheable.
    pub uncacheable_skips: u64,
    /// Pointer-cache hits while hashing expressions.
    pub expr_cache_hits: u64,
    /// Pointer-cache misses while hashing expressions.
    pub expr_cache_misses: u64,
    /// Live memo entries (including logically-stale ones).
    pub memo_entries: usize,
    /// Current impurity token.
    pub impurity_token: u64,
    /// Current GC cycle.
    pub gc_cycle: u64,
}

impl EvalStats {
    pub fn snapshot(evaluator: &Evaluator) -> Self {
        let counters = evaluator.counters();
        EvalStats {
            thunk_hits: counters.hits.get(),
            thunk_stale_hits: counters.stale_hits.get(),
            thunk_misses: counters.misses.get(),
            impure_skips: counters.impure_skips.get(),
            uncacheable_skips: counters.lazy_skips.get(),
            expr_cache_hits: evaluator.expr_cache().hits.get(),
            expr_cache_misses: evaluator.expr_cache().misses.get(),
            memo_entries: evaluator.memo_cache().len(),
            impurity_token: evaluator.impurity_token(),
            gc_cycle: evaluator.current_gc_cycle(),
        }
    }

    /// Fraction of cache-eligible forcings that hit, if any happened.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.thunk_hits + self.thunk_misses;
        if total == 0 {
            None
        } else {
            Some(self.thunk_hits as f64 / total as f64)
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl std::fmt::Display for EvalStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "thunk memo:")?;
        writeln!(f, "  hits            {}", self.thunk_hits)?;
        writeln!(f, "  stale hits      {}", self.thunk_stale_hits)?;
        writeln!(f, "  misses          {}", self.thunk_misses)?;
        writeln!(f, "  impure skips    {}", self.impure_skips)?;
        writeln!(f, "  lazy skips      {}", self.uncacheable_skips)?;
        writeln!(f, "  entries         {}", self.memo_entries)?;
        if let Some(rate) = self.hit_rate() {
            writeln!(f, "  hit rate        {:.1}%", rate * 100.0)?;
        }
        writeln!(f, "expr hash cache:")?;
        writeln!(f, "  hits            {}", self.expr_cache_hits)?;
        writeln!(f, "  misses          {}", self.expr_cache_misses)?;
        writeln!(f, "impurity token    {}", self.impurity_token)?;
        write!(f, "gc cycle          {}", self.gc_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::pos::PosIdx;
    use crate::value::Value;
    use rill_core::EvalInputs;

    #[test]
    fn test_snapshot_tracks_forcing() {
        let ev = Evaluator::new(EvalInputs::default());
        let env = ev.base_env();
        let expr = Expr::int(5);

        let cell = Value::thunk(env.clone(), expr.clone());
        ev.force(&cell, PosIdx::NONE).unwrap();
        let after_miss = EvalStats::snapshot(&ev);
        assert_eq!(after_miss.thunk_misses, 1);
        assert_eq!(after_miss.thunk_hits, 0);

        let again = Value::thunk(env, expr);
        ev.force(&again, PosIdx::NONE).unwrap();
        let after_hit = EvalStats::snapshot(&ev);
        assert_eq!(after_hit.thunk_hits, 1);
        assert_eq!(after_hit.hit_rate(), Some(0.5));
    }

    #[test]
    fn test_json_rendering() {
        let ev = Evaluator::new(EvalInputs::default());
        let json = EvalStats::snapshot(&ev).to_json();
        assert!(json.contains("\"thunk_hits\""));
        assert!(json.contains("\"gc_cycle\""));
    }
}
