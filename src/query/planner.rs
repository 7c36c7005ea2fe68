//! Predicate normalization.
//!
//! Rewrites a predicate into disjunctive normal form: an OR of
//! conjunctions of possibly-negated terms. Negation is pushed to the
//! leaves first, then AND distributes over OR with a hard cap on the
//! number of disjuncts so pathological expressions fail typed instead
//! of exploding.

use crate::error::{DbError, DbResult};
use crate::query::{Conjunct, Predicate};

/// Upper bound on disjuncts produced by distribution.
const MAX_DISJUNCTS: usize = 128;

/// A predicate in disjunctive normal form. No disjuncts means nothing
/// matches; a disjunct with no conjuncts matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dnf {
    pub(crate) disjuncts: Vec<Vec<Conjunct>>,
}

impl Dnf {
    pub(crate) fn matches_nothing(&self) -> bool {
        self.disjuncts.is_empty()
    }

    pub(crate) fn matches_everything(&self) -> bool {
        self.disjuncts.iter().any(|c| c.is_empty())
    }
}

/// Negation-normal intermediate: negation only at leaves.
enum Nnf {
    All,
    None,
    Leaf(Conjunct),
    And(Vec<Nnf>),
    Or(Vec<Nnf>),
}

pub(crate) fn normalize(predicate: &Predicate, max_depth: usize) -> DbResult<Dnf> {
    let depth = predicate.depth();
    if depth > max_depth {
        return Err(DbError::unexecutable(format!(
            "predicate depth {depth} exceeds limit {max_depth}"
        )));
    }
    let nnf = to_nnf(predicate, false);
    let disjuncts = to_dnf(nnf)?;
    Ok(Dnf { disjuncts })
}

fn to_nnf(predicate: &Predicate, negated: bool) -> Nnf {
    match (predicate, negated) {
        (Predicate::All, false) | (Predicate::None, true) => Nnf::All,
        (Predicate::All, true) | (Predicate::None, false) => Nnf::None,
        (Predicate::Term(term), negated) => {
            Nnf::Leaf(Conjunct { term: term.clone(), negated })
        }
        (Predicate::Not(inner), negated) => to_nnf(inner, !negated),
        (Predicate::And(parts), false) | (Predicate::Or(parts), true) => {
            Nnf::And(parts.iter().map(|p| to_nnf(p, negated)).collect())
        }
        (Predicate::Or(parts), false) | (Predicate::And(parts), true) => {
            Nnf::Or(parts.iter().map(|p| to_nnf(p, negated)).collect())
        }
    }
}

fn to_dnf(nnf: Nnf) -> DbResult<Vec<Vec<Conjunct>>> {
    match nnf {
        Nnf::All => Ok(vec![Vec::new()]),
        Nnf::None => Ok(Vec::new()),
        Nnf::Leaf(conjunct) => Ok(vec![vec![conjunct]]),
        Nnf::Or(parts) => {
            let mut disjuncts = Vec::new();
            for part in parts {
                disjuncts.extend(to_dnf(part)?);
                check_width(disjuncts.len())?;
            }
            Ok(disjuncts)
        }
        Nnf::And(parts) => {
            // Cross-product of the children's disjunct lists.
            let mut acc: Vec<Vec<Conjunct>> = vec![Vec::new()];
            for part in parts {
                let rhs = to_dnf(part)?;
                if rhs.is_empty() {
                    return Ok(Vec::new());
                }
                let mut next = Vec::with_capacity(acc.len() * rhs.len());
                for left in &acc {
                    for right in &rhs {
                        let mut merged = left.clone();
                        merged.extend(right.iter().cloned());
                        dedup_conjuncts(&mut merged);
                        next.push(merged);
                    }
                }
                check_width(next.len())?;
                acc = next;
            }
            Ok(acc)
        }
    }
}

fn check_width(width: usize) -> DbResult<()> {
    if width > MAX_DISJUNCTS {
        return Err(DbError::unexecutable(format!(
            "normalization produced over {MAX_DISJUNCTS} disjuncts"
        )));
    }
    Ok(())
}

fn dedup_conjuncts(conjuncts: &mut Vec<Conjunct>) {
    conjuncts.sort();
    conjuncts.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrHandle;
    use crate::query::Term;
    use crate::value::Value;

    fn eq(n: u32, v: i64) -> Predicate {
        Predicate::equals(AttrHandle(n), Value::Int(v))
    }

    fn norm(p: &Predicate) -> Dnf {
        normalize(p, 32).expect("normalize")
    }

    #[test]
    fn literals_normalize_to_edge_forms() {
        assert!(norm(&Predicate::All).matches_everything());
        assert!(norm(&Predicate::None).matches_nothing());
        assert!(norm(&Predicate::not(Predicate::All)).matches_nothing());
    }

    #[test]
    fn and_absorbs_all_and_none() {
        let dnf = norm(&Predicate::and(vec![eq(1, 5), Predicate::All]));
        assert_eq!(dnf.disjuncts.len(), 1);
        assert_eq!(dnf.disjuncts[0].len(), 1);
        assert!(norm(&Predicate::and(vec![eq(1, 5), Predicate::None])).matches_nothing());
    }

    #[test]
    fn distribution_crosses_and_over_or() {
        let p = Predicate::and(vec![
            Predicate::or(vec![eq(1, 1), eq(1, 2)]),
            Predicate::or(vec![eq(2, 1), eq(2, 2)]),
        ]);
        let dnf = norm(&p);
        assert_eq!(dnf.disjuncts.len(), 4);
        assert!(dnf.disjuncts.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn de_morgan_pushes_negation_to_leaves() {
        let p = Predicate::not(Predicate::or(vec![eq(1, 1), eq(2, 2)]));
        let dnf = norm(&p);
        assert_eq!(dnf.disjuncts.len(), 1);
        let conjuncts = &dnf.disjuncts[0];
        assert_eq!(conjuncts.len(), 2);
        assert!(conjuncts.iter().all(|c| c.negated));
    }

    #[test]
    fn double_negation_cancels() {
        let p = Predicate::not(Predicate::not(eq(1, 1)));
        let dnf = norm(&p);
        assert_eq!(
            dnf.disjuncts,
            vec![vec![Conjunct {
                term: Term::Equals { attr: AttrHandle(1), value: Value::Int(1) },
                negated: false
            }]]
        );
    }

    #[test]
    fn repeated_conjuncts_collapse() {
        let p = Predicate::and(vec![eq(1, 1), eq(1, 1)]);
        let dnf = norm(&p);
        assert_eq!(dnf.disjuncts[0].len(), 1);
    }

    #[test]
    fn depth_and_width_limits_fail_typed() {
        let mut deep = eq(1, 1);
        for _ in 0..40 {
            deep = Predicate::not(deep);
        }
        let err = normalize(&deep, 32).unwrap_err();
        assert_eq!(err.code().as_str(), "unexecutable");

        // 2^8 = 256 disjuncts blows the width cap.
        let wide = Predicate::and(
            (0..8)
                .map(|n| Predicate::or(vec![eq(n, 0), eq(n, 1)]))
                .collect(),
        );
        let err = normalize(&wide, 32).unwrap_err();
        assert_eq!(err.code().as_str(), "unexecutable");
    }
}
