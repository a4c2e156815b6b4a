//! Multiplicity tracking: how each in-scope variable is consumed.
//!
//! Every inference rule produces a multiplicity map alongside its type.
//! Sibling sub-expressions combine their maps with [`Multiplicity::seq_merge`]
//! (effects happen in program order) or [`Multiplicity::par_merge`] (match
//! arms — only one fires). Leaving a binder or a borrow region sweeps the
//! map and emits the weakening constraints the exit implies.

use std::collections::BTreeMap;
use std::fmt;

use affe_ast::{Access, Name};
use affe_types::{Kind, KindConst, Region, Usage};

use crate::{Constraint, ConstraintSet, InferError, Provenance, Reason};

/// How a single variable has been consumed along an inference path.
///
/// The kind list accumulates the kind of each site where the variable was
/// used; `Shadow` marks a variable whose borrow has exited scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Use {
    Shadow,
    Borrow(Access, Vec<Kind>),
    Normal(Vec<Kind>),
}

impl fmt::Display for Use {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Use::Shadow => write!(f, "out of scope"),
            Use::Borrow(Access::Read, _) => write!(f, "borrowed (&)"),
            Use::Borrow(Access::Write, _) => write!(f, "borrowed (&!)"),
            Use::Normal(_) => write!(f, "consumed"),
        }
    }
}

/// Finite map from in-scope variable to its use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multiplicity {
    uses: BTreeMap<Name, Use>,
}

impl Multiplicity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.uses.is_empty()
    }

    pub fn get(&self, name: &Name) -> Option<&Use> {
        self.uses.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.uses.keys()
    }

    /// Record one owned use at the given kind.
    pub fn record_use(&mut self, name: Name, kind: Kind) {
        debug_assert!(
            !self.uses.contains_key(&name),
            "a single inference rule records at most one use"
        );
        self.uses.insert(name, Use::Normal(vec![kind]));
    }

    /// Record one borrow at the given kind.
    pub fn record_borrow(&mut self, name: Name, access: Access, kind: Kind) {
        debug_assert!(!self.uses.contains_key(&name));
        self.uses.insert(name, Use::Borrow(access, vec![kind]));
    }

    /// Combine the uses of two sub-expressions evaluated in program
    /// order, `self` first.
    ///
    /// A variable consumed in both halves must be unrestricted; read
    /// borrows accumulate; any write-borrow overlap, or a mix of owning
    /// and borrowing uses, is an error. A closed borrow scope (`Shadow`)
    /// dissolves against whatever happens on the other side: the owner
    /// is usable again once its borrows have exited.
    pub fn seq_merge(
        mut self,
        later: Multiplicity,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) -> Result<Multiplicity, InferError> {
        for (name, second) in later.uses {
            let Some(first) = self.uses.remove(&name) else {
                self.uses.insert(name, second);
                continue;
            };
            let combined = match (first, second) {
                (Use::Shadow, other) | (other, Use::Shadow) => other,
                (Use::Normal(mut ks1), Use::Normal(ks2)) => {
                    ks1.extend(ks2);
                    // Consumed more than once: every use site must be
                    // unrestricted.
                    for kind in &ks1 {
                        out.push(Constraint::KindLeq {
                            lhs: kind.clone(),
                            rhs: Kind::Const(KindConst::new(Usage::Un, Region::Never)),
                            provenance: Provenance::new(
                                provenance.span,
                                Reason::SequentialReuse,
                            ),
                        });
                    }
                    Use::Normal(ks1)
                }
                (Use::Borrow(Access::Read, mut ks1), Use::Borrow(Access::Read, ks2)) => {
                    ks1.extend(ks2);
                    Use::Borrow(Access::Read, ks1)
                }
                (first, second) => {
                    return Err(InferError::UseMismatch {
                        name,
                        first,
                        second,
                    });
                }
            };
            self.uses.insert(name, combined);
        }
        Ok(self)
    }

    /// Combine the uses of two match arms: only one fires, so no
    /// unrestricted-use constraint is emitted, but the arms must consume
    /// each variable the same way.
    ///
    /// Owned-use lists keep the worst-case arm rather than concatenating,
    /// so a variable consumed once in every arm still counts as consumed
    /// once. Borrow lists take the union: every borrow site's kind must
    /// obey the region exits, whichever arm fires.
    pub fn par_merge(mut self, other: Multiplicity) -> Result<Multiplicity, InferError> {
        for (name, second) in other.uses {
            let Some(first) = self.uses.remove(&name) else {
                self.uses.insert(name, second);
                continue;
            };
            let combined = match (first, second) {
                (Use::Shadow, Use::Shadow) => Use::Shadow,
                (Use::Normal(ks1), Use::Normal(ks2)) => {
                    Use::Normal(if ks2.len() > ks1.len() { ks2 } else { ks1 })
                }
                (Use::Borrow(a1, mut ks1), Use::Borrow(a2, ks2)) if a1 == a2 => {
                    for kind in ks2 {
                        if !ks1.contains(&kind) {
                            ks1.push(kind);
                        }
                    }
                    Use::Borrow(a1, ks1)
                }
                (first, second) => {
                    return Err(InferError::UseMismatch {
                        name,
                        first,
                        second,
                    });
                }
            };
            self.uses.insert(name, combined);
        }
        Ok(self)
    }

    /// Discharge a binder leaving scope.
    ///
    /// Exactly one owned use, or borrowed-only use, emits nothing. Zero
    /// uses, or two and more owned uses, require the binding to be
    /// discardable: its kind must be affine or weaker.
    pub fn exit_binder(
        &mut self,
        name: &Name,
        kind: &Kind,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) {
        let weaken = match self.uses.remove(name) {
            None => true,
            Some(Use::Normal(ks)) => ks.len() != 1,
            Some(Use::Borrow(..)) | Some(Use::Shadow) => false,
        };
        if weaken {
            out.push(Constraint::KindLeq {
                lhs: kind.clone(),
                rhs: Kind::Const(KindConst::new(Usage::Aff, Region::Never)),
                provenance: Provenance::new(provenance.span, Reason::Weakening),
            });
        }
    }

    /// Close the borrow scope of the given names: their borrow entries
    /// become shadows, releasing the owner for later consumption while
    /// keeping live-borrow conflicts in sibling positions detectable.
    pub fn exit_scope(&mut self, names: &[Name]) {
        for name in names {
            if let Some(entry @ Use::Borrow(..)) = self.uses.get_mut(name) {
                *entry = Use::Shadow;
            }
        }
    }

    /// Bound the kind of a closure by everything it captures: each owned
    /// use inside the lambda body forces the arrow's kind at least as
    /// high as the captured value's kind.
    pub fn constrain_all(
        &self,
        arrow_kind: &Kind,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) {
        for used in self.uses.values() {
            if let Use::Normal(kinds) = used {
                for kind in kinds {
                    out.push(Constraint::KindLeq {
                        lhs: kind.clone(),
                        rhs: arrow_kind.clone(),
                        provenance: Provenance::new(provenance.span, Reason::ArrowCapture),
                    });
                }
            }
        }
    }
}
