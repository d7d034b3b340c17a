//! The per-tablet write path: constraint checking and commit sessions.
//!
//! This is the unconditional-write entry point: the RPC layer batches
//! mutations by extent, [`prepare_mutations_for_commit`] runs constraints
//! and claims a slot in the tablet's commit order, and the caller logs the
//! survivors before committing them.

use std::sync::Arc;

use tabletdb_common::Mutation;

use crate::tablet::{CommitSession, Tablet};

/// A table constraint, run against every mutation before it may commit.
pub trait ConstraintChecker: Send + Sync {
    /// `Ok` to admit the mutation, `Err` with a human-readable reason to
    /// report it as a violation.
    fn check(&self, mutation: &Mutation) -> Result<(), String>;
}

/// The default constraint: keys must fit in sane bounds.
pub struct SizeConstraint {
    /// Largest admissible key component
    pub max_key_component: usize,
}

impl Default for SizeConstraint {
    fn default() -> Self {
        SizeConstraint {
            max_key_component: 1 << 20,
        }
    }
}

impl ConstraintChecker for SizeConstraint {
    fn check(&self, mutation: &Mutation) -> Result<(), String> {
        if mutation.row.is_empty() {
            return Err("row may not be empty".into());
        }
        if mutation.row.len() > self.max_key_component {
            return Err(format!("row exceeds {} bytes", self.max_key_component));
        }
        for update in &mutation.updates {
            if update.family.len() > self.max_key_component
                || update.qualifier.len() > self.max_key_component
            {
                return Err(format!(
                    "column exceeds {} bytes",
                    self.max_key_component
                ));
            }
        }
        Ok(())
    }
}

/// Result of preparing a batch against one tablet. Mutations keep the
/// caller's ids so outcomes can be reported per mutation.
///
/// A mutation that made it into `non_violators` is covered by the
/// invariant: once the commit session commits, it has been applied *and*
/// durably logged (at its resolved durability), or the whole batch was
/// reported failed. There is no partial state in between.
pub struct Prepared {
    /// The granted commit session, absent when the tablet is closed or
    /// nothing survived constraints
    pub commit_session: Option<CommitSession>,
    /// Mutations that passed constraints, in input order
    pub non_violators: Vec<(u64, Mutation)>,
    /// Mutations that failed a constraint, with the reason
    pub violators: Vec<(u64, Mutation, String)>,
    /// The tablet refused the batch entirely because it is closing
    pub tablet_closed: bool,
}

/// Run constraints and acquire a commit session for the survivors.
pub fn prepare_mutations_for_commit(
    tablet: &Arc<Tablet>,
    constraints: &[Arc<dyn ConstraintChecker>],
    mutations: Vec<(u64, Mutation)>,
) -> Prepared {
    let mut non_violators = Vec::with_capacity(mutations.len());
    let mut violators = Vec::new();
    for (id, mutation) in mutations {
        match constraints
            .iter()
            .find_map(|c| c.check(&mutation).err())
        {
            Some(reason) => violators.push((id, mutation, reason)),
            None => non_violators.push((id, mutation)),
        }
    }

    if non_violators.is_empty() {
        return Prepared {
            commit_session: None,
            non_violators,
            violators,
            tablet_closed: false,
        };
    }

    match tablet.grant_session() {
        Some(session) => Prepared {
            commit_session: Some(session),
            non_violators,
            violators,
            tablet_closed: false,
        },
        None => Prepared {
            commit_session: None,
            non_violators,
            violators,
            tablet_closed: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tabletdb_common::{Durability, KeyExtent, TableId};
    use tabletdb_metadata::MetadataTime;

    use super::*;

    fn tablet() -> Arc<Tablet> {
        Tablet::new(
            KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>),
            BTreeSet::new(),
            MetadataTime::Logical(0),
            Durability::Sync,
        )
    }

    fn constraints() -> Vec<Arc<dyn ConstraintChecker>> {
        vec![Arc::new(SizeConstraint::default())]
    }

    #[test]
    fn violators_are_separated() {
        let t = tablet();
        let good = Mutation::new("r").put("f", "q", "v");
        let bad = Mutation::new("").put("f", "q", "v");
        let prepared = prepare_mutations_for_commit(
            &t,
            &constraints(),
            vec![(1, good.clone()), (2, bad.clone())],
        );
        assert_eq!(prepared.non_violators, vec![(1, good)]);
        assert_eq!(prepared.violators.len(), 1);
        assert_eq!(prepared.violators[0].0, 2);
        assert_eq!(prepared.violators[0].1, bad);
        assert!(!prepared.tablet_closed);
        prepared.commit_session.unwrap().abort();
    }

    #[tokio::test]
    async fn closed_tablet_is_reported() {
        let t = tablet();
        t.close().await.unwrap();
        let prepared = prepare_mutations_for_commit(
            &t,
            &constraints(),
            vec![(1, Mutation::new("r").put("f", "q", "v"))],
        );
        assert!(prepared.tablet_closed);
        assert!(prepared.commit_session.is_none());
    }

    #[test]
    fn all_violators_grant_no_session() {
        let t = tablet();
        let prepared = prepare_mutations_for_commit(
            &t,
            &constraints(),
            vec![(1, Mutation::new("").put("f", "q", "v"))],
        );
        assert!(prepared.commit_session.is_none());
        assert!(!prepared.tablet_closed);
        assert_eq!(prepared.violators.len(), 1);
    }
}
