//! CPU range specification compiler.
//!
//! A specification is a comma-separated list of clauses evaluated left to
//! right over a bitmap that starts with every host CPU cleared:
//!
//! | Clause | Effect |
//! |---|---|
//! | `n` | select CPU `n` |
//! | `a-b` | select CPUs `a..=b` |
//! | `^n` | deselect CPU `n` |
//!
//! Each clause produces a fresh bitmap from the previous one, so
//! `"0-2,^1"` over 4 CPUs yields `[true, false, true, false]`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a specification was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecErrorReason {
    /// A token is not a non-negative integer, or a clause has the wrong shape.
    Malformed,
    /// A referenced CPU index is `>= total`.
    OutOfRange,
    /// A range's upper bound is below its lower bound.
    ReversedRange,
    /// The specification selects no CPU at all.
    Empty,
}

impl fmt::Display for SpecErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Malformed => "malformed",
            Self::OutOfRange => "out_of_range",
            Self::ReversedRange => "reversed_range",
            Self::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// An invalid CPU specification, naming the offending clause.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid cpu specification: clause {clause:?} is {reason}")]
pub struct CpuSpecError {
    pub clause: String,
    pub reason: SpecErrorReason,
}

impl CpuSpecError {
    fn new(clause: &str, reason: SpecErrorReason) -> Self {
        Self {
            clause: clause.to_string(),
            reason,
        }
    }
}

/// A fixed-width placement bitmap; index `i` is host CPU `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuMap(Vec<bool>);

impl CpuMap {
    /// A bitmap of `total` CPUs with nothing selected.
    pub fn cleared(total: usize) -> Self {
        Self(vec![false; total])
    }

    /// A bitmap of `total` CPUs with everything selected.
    pub fn full(total: usize) -> Self {
        Self(vec![true; total])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Indices of the selected CPUs, ascending.
    pub fn selected(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, set)| set.then_some(i))
    }

    pub fn count_selected(&self) -> usize {
        self.0.iter().filter(|set| **set).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    /// Render as Linux cpulist text, e.g. `"0-2,5"`. Empty maps render as `""`.
    pub fn to_cpulist(&self) -> String {
        let mut parts = Vec::new();
        let mut run: Option<(usize, usize)> = None;
        for cpu in self.selected() {
            run = match run {
                Some((start, end)) if end + 1 == cpu => Some((start, cpu)),
                Some(done) => {
                    parts.push(render_run(done));
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(done) = run {
            parts.push(render_run(done));
        }
        parts.join(",")
    }

    /// Returns a copy with `lo..=hi` set to `value`, every other index unchanged.
    fn with_range(&self, lo: usize, hi: usize, value: bool) -> CpuMap {
        CpuMap(
            self.0
                .iter()
                .enumerate()
                .map(|(i, prev)| if (lo..=hi).contains(&i) { value } else { *prev })
                .collect(),
        )
    }
}

impl From<Vec<bool>> for CpuMap {
    fn from(bits: Vec<bool>) -> Self {
        Self(bits)
    }
}

impl fmt::Display for CpuMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for set in &self.0 {
            f.write_str(if *set { "T" } else { "F" })?;
        }
        Ok(())
    }
}

fn render_run((start, end): (usize, usize)) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select(usize),
    Range(usize, usize),
    Deselect(usize),
}

fn parse_index(token: &str, clause: &str) -> Result<usize, CpuSpecError> {
    let token = token.trim();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CpuSpecError::new(clause, SpecErrorReason::Malformed));
    }
    // All digits, so the only parse failure is overflow. Saturate and let
    // the range check report it as out of range.
    Ok(token.parse().unwrap_or(usize::MAX))
}

fn parse_clause(raw: &str) -> Result<Clause, CpuSpecError> {
    let clause = raw.trim();
    if let Some(rest) = clause.strip_prefix('^') {
        return Ok(Clause::Deselect(parse_index(rest, clause)?));
    }
    match clause.split_once('-') {
        Some((lo, hi)) => Ok(Clause::Range(
            parse_index(lo, clause)?,
            parse_index(hi, clause)?,
        )),
        None => Ok(Clause::Select(parse_index(clause, clause)?)),
    }
}

fn clauses(spec: &str) -> impl Iterator<Item = (&str, Result<Clause, CpuSpecError>)> {
    spec.split(',').map(|raw| (raw.trim(), parse_clause(raw)))
}

/// Syntax-only check: every clause parses and no range is reversed.
///
/// Host width is not known here, so out-of-range and empty results are left
/// to [`compile`].
pub fn validate(spec: &str) -> Result<(), CpuSpecError> {
    for (text, clause) in clauses(spec) {
        if let Clause::Range(lo, hi) = clause? {
            if hi < lo {
                return Err(CpuSpecError::new(text, SpecErrorReason::ReversedRange));
            }
        }
    }
    Ok(())
}

/// Compile `spec` into a bitmap of exactly `total` CPUs.
///
/// Fails on the first bad clause. Indices are checked against `total` before
/// range order, so `"9-2"` over 8 CPUs is `out_of_range`.
pub fn compile(spec: &str, total: usize) -> Result<CpuMap, CpuSpecError> {
    let map = clauses(spec).try_fold(CpuMap::cleared(total), |template, (text, clause)| {
        let in_range = |cpu: usize| {
            if cpu < total {
                Ok(cpu)
            } else {
                Err(CpuSpecError::new(text, SpecErrorReason::OutOfRange))
            }
        };
        match clause? {
            Clause::Select(cpu) => {
                let cpu = in_range(cpu)?;
                Ok(template.with_range(cpu, cpu, true))
            }
            Clause::Deselect(cpu) => {
                let cpu = in_range(cpu)?;
                Ok(template.with_range(cpu, cpu, false))
            }
            Clause::Range(lo, hi) => {
                in_range(lo)?;
                in_range(hi)?;
                if hi < lo {
                    return Err(CpuSpecError::new(text, SpecErrorReason::ReversedRange));
                }
                Ok(template.with_range(lo, hi, true))
            }
        }
    })?;

    if map.count_selected() == 0 {
        return Err(CpuSpecError::new(spec.trim(), SpecErrorReason::Empty));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(s: &str) -> Vec<bool> {
        s.chars().map(|c| c == 'T').collect()
    }

    #[test]
    fn compiles_inclusive_range() {
        let map = compile("2-4", 8).unwrap();
        assert_eq!(map.as_slice(), bits("FFTTTFFF").as_slice());
        assert_eq!(map.to_string(), "FFTTTFFF");
    }

    #[test]
    fn reversed_range_rejected() {
        let err = compile("5-2", 8).unwrap_err();
        assert_eq!(err.reason, SpecErrorReason::ReversedRange);
        assert_eq!(err.clause, "5-2");
    }

    #[test]
    fn single_index_past_end_is_out_of_range() {
        let err = compile("9", 8).unwrap_err();
        assert_eq!(err.reason, SpecErrorReason::OutOfRange);
    }

    #[test]
    fn range_upper_bound_checked_against_total() {
        assert_eq!(
            compile("0-8", 8).unwrap_err().reason,
            SpecErrorReason::OutOfRange
        );
        assert_eq!(
            compile("9-2", 8).unwrap_err().reason,
            SpecErrorReason::OutOfRange
        );
    }

    #[test]
    fn deselect_applies_after_select() {
        let map = compile("0-2,^1", 4).unwrap();
        assert_eq!(map.as_slice(), bits("TFTF").as_slice());
    }

    #[test]
    fn clause_order_matters() {
        // ^1 runs against an empty template, then 0-2 re-selects it.
        let map = compile("^1,0-2", 4).unwrap();
        assert_eq!(map.as_slice(), bits("TTTF").as_slice());
    }

    #[test]
    fn full_range_is_identity() {
        for total in 1..=16 {
            let spec = format!("0-{}", total - 1);
            assert_eq!(compile(&spec, total).unwrap(), CpuMap::full(total));
        }
    }

    #[test]
    fn compile_is_deterministic() {
        let a = compile("1,3-5,^4,7", 8).unwrap();
        let b = compile("1,3-5,^4,7", 8).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.selected().collect::<Vec<_>>(), vec![1, 3, 5, 7]);
    }

    #[test]
    fn malformed_tokens() {
        for spec in ["", "a", "1,,2", "1-", "-3", "1-2-3", "^", "^x", "+1", "^1-2", "1 2"] {
            let err = compile(spec, 8).unwrap_err();
            assert_eq!(err.reason, SpecErrorReason::Malformed, "spec {spec:?}");
        }
    }

    #[test]
    fn whitespace_around_clauses_ignored() {
        let map = compile(" 0 , 2-3 ", 4).unwrap();
        assert_eq!(map.as_slice(), bits("TFTT").as_slice());
    }

    #[test]
    fn fully_deselected_spec_is_empty() {
        let err = compile("1,^1", 4).unwrap_err();
        assert_eq!(err.reason, SpecErrorReason::Empty);
        assert_eq!(err.clause, "1,^1");
    }

    #[test]
    fn deselect_out_of_range() {
        let err = compile("0,^4", 4).unwrap_err();
        assert_eq!(err.reason, SpecErrorReason::OutOfRange);
        assert_eq!(err.clause, "^4");
    }

    #[test]
    fn zero_width_host_rejects_everything() {
        assert_eq!(
            compile("0", 0).unwrap_err().reason,
            SpecErrorReason::OutOfRange
        );
    }

    #[test]
    fn oversized_index_is_out_of_range() {
        let err = compile("99999999999999999999", 8).unwrap_err();
        assert_eq!(err.reason, SpecErrorReason::OutOfRange);
        assert_eq!(err.clause, "99999999999999999999");

        let err = compile("0-99999999999999999999", 8).unwrap_err();
        assert_eq!(err.reason, SpecErrorReason::OutOfRange);

        assert!(validate("99999999999999999999").is_ok());
        assert!(validate("0,^99999999999999999999").is_ok());
    }

    #[test]
    fn validate_checks_syntax_only() {
        assert!(validate("0-63,^5").is_ok());
        assert!(validate("1024").is_ok());
        assert_eq!(
            validate("5-2").unwrap_err().reason,
            SpecErrorReason::ReversedRange
        );
        assert_eq!(
            validate("1,x").unwrap_err().reason,
            SpecErrorReason::Malformed
        );
    }

    #[test]
    fn cpulist_rendering() {
        assert_eq!(compile("0-2,5", 8).unwrap().to_cpulist(), "0-2,5");
        assert_eq!(compile("7", 8).unwrap().to_cpulist(), "7");
        assert_eq!(compile("0-7,^3", 8).unwrap().to_cpulist(), "0-2,4-7");
        assert_eq!(CpuMap::cleared(4).to_cpulist(), "");
    }

    #[test]
    fn cpulist_round_trips_through_compile() {
        let map = compile("1,3-6,^5", 8).unwrap();
        assert_eq!(compile(&map.to_cpulist(), 8).unwrap(), map);
    }

    #[test]
    fn error_serializes_with_reason() {
        let err = compile("9", 8).unwrap_err();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["reason"], "out_of_range");
        assert_eq!(json["clause"], "9");
    }
}
