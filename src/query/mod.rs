//! Predicate queries.
//!
//! A [`Predicate`] is a boolean expression over attribute terms. The
//! planner normalizes it to disjunctive normal form, turns each
//! conjunct into an extraction operator, and the executor runs each
//! disjunct as a chain from cheapest operator to most expensive, so the
//! expensive per-item checks only ever see a narrowed candidate set.

pub(crate) mod executor;
pub(crate) mod operators;
pub(crate) mod planner;

pub(crate) use executor::{execute, execute_within};

use crate::attr::AttrHandle;
use crate::value::Value;

/// Comparison direction for ordered scalar kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The operator equivalent to negating this one.
    pub(crate) fn negate(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Ge => CompareOp::Lt,
        }
    }

    pub(crate) fn sql(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Atomic condition on one attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    /// The attribute stores exactly this value (for collections: any
    /// member equals it).
    Equals { attr: AttrHandle, value: Value },
    /// Like [`Term::Equals`] against the item backing an identified
    /// object, resolved when the query runs.
    EqualsIdentified { attr: AttrHandle, id: String },
    /// Ordered comparison; only integer, timestamp, and string
    /// attributes support it.
    Compare { attr: AttrHandle, op: CompareOp, value: Value },
    /// The attribute stores at least one value.
    NotNull { attr: AttrHandle },
    /// The collection shares at least one member with `values`.
    Intersects { attr: AttrHandle, values: Vec<Value> },
}

impl Term {
    pub(crate) fn attr(&self) -> AttrHandle {
        match self {
            Term::Equals { attr, .. }
            | Term::EqualsIdentified { attr, .. }
            | Term::Compare { attr, .. }
            | Term::NotNull { attr }
            | Term::Intersects { attr, .. } => *attr,
        }
    }
}

/// One normalized leaf: a term, possibly negated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Conjunct {
    pub(crate) term: Term,
    pub(crate) negated: bool,
}

/// Boolean expression over terms.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Predicate {
    /// Matches every item.
    All,
    /// Matches nothing.
    None,
    Term(Term),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn equals(attr: AttrHandle, value: Value) -> Predicate {
        Predicate::Term(Term::Equals { attr, value })
    }

    pub fn equals_identified(attr: AttrHandle, id: impl Into<String>) -> Predicate {
        Predicate::Term(Term::EqualsIdentified { attr, id: id.into() })
    }

    pub fn compare(attr: AttrHandle, op: CompareOp, value: Value) -> Predicate {
        Predicate::Term(Term::Compare { attr, op, value })
    }

    pub fn not_null(attr: AttrHandle) -> Predicate {
        Predicate::Term(Term::NotNull { attr })
    }

    pub fn intersects(attr: AttrHandle, values: Vec<Value>) -> Predicate {
        Predicate::Term(Term::Intersects { attr, values })
    }

    pub fn and(parts: Vec<Predicate>) -> Predicate {
        Predicate::And(parts)
    }

    pub fn or(parts: Vec<Predicate>) -> Predicate {
        Predicate::Or(parts)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Predicate) -> Predicate {
        Predicate::Not(Box::new(inner))
    }

    pub(crate) fn depth(&self) -> usize {
        match self {
            Predicate::All | Predicate::None | Predicate::Term(_) => 1,
            Predicate::Not(inner) => 1 + inner.depth(),
            Predicate::And(parts) | Predicate::Or(parts) => {
                1 + parts.iter().map(Predicate::depth).max().unwrap_or(0)
            }
        }
    }

    /// String ids of every identified-object term, ascending and unique.
    /// Live queries re-resolve these once per evaluation pass.
    pub(crate) fn identified_ids(&self) -> Vec<String> {
        fn walk(p: &Predicate, out: &mut Vec<String>) {
            match p {
                Predicate::All | Predicate::None => {}
                Predicate::Term(Term::EqualsIdentified { id, .. }) => out.push(id.clone()),
                Predicate::Term(_) => {}
                Predicate::Not(inner) => walk(inner, out),
                Predicate::And(parts) | Predicate::Or(parts) => {
                    for part in parts {
                        walk(part, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Attributes this predicate depends on, ascending and unique.
    pub(crate) fn attrs(&self) -> Vec<AttrHandle> {
        fn walk(p: &Predicate, out: &mut Vec<AttrHandle>) {
            match p {
                Predicate::All | Predicate::None => {}
                Predicate::Term(term) => out.push(term.attr()),
                Predicate::Not(inner) => walk(inner, out),
                Predicate::And(parts) | Predicate::Or(parts) => {
                    for part in parts {
                        walk(part, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u32) -> AttrHandle {
        AttrHandle(n)
    }

    #[test]
    fn depth_counts_nesting() {
        let p = Predicate::and(vec![
            Predicate::equals(h(1), Value::Int(1)),
            Predicate::not(Predicate::or(vec![
                Predicate::not_null(h(2)),
                Predicate::All,
            ])),
        ]);
        assert_eq!(p.depth(), 4);
    }

    #[test]
    fn identified_ids_come_from_every_depth() {
        let p = Predicate::and(vec![
            Predicate::equals_identified(h(1), "tag:urgent"),
            Predicate::not(Predicate::or(vec![
                Predicate::equals_identified(h(2), "tag:done"),
                Predicate::equals_identified(h(1), "tag:urgent"),
            ])),
        ]);
        assert_eq!(p.identified_ids(), vec!["tag:done".to_owned(), "tag:urgent".to_owned()]);
        assert!(Predicate::All.identified_ids().is_empty());
    }

    #[test]
    fn attrs_are_sorted_and_unique() {
        let p = Predicate::or(vec![
            Predicate::equals(h(7), Value::Int(1)),
            Predicate::and(vec![
                Predicate::not_null(h(2)),
                Predicate::equals(h(7), Value::Int(2)),
            ]),
        ]);
        assert_eq!(p.attrs(), vec![h(2), h(7)]);
    }

    #[test]
    fn negating_a_comparison_flips_it() {
        assert_eq!(CompareOp::Lt.negate(), CompareOp::Ge);
        assert_eq!(CompareOp::Ge.negate(), CompareOp::Lt);
        assert_eq!(CompareOp::Le.negate(), CompareOp::Gt);
    }
}
