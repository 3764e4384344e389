//! HEAD / PRIMARY / ALTERNATE repair and the individual removal state machine
//!
//! An individual leaves the active population by withdrawal or by being
//! marked duplicate of another individual. Both states are terminal and
//! both require every role the individual holds to be handed over first,
//! unless the household has no one left to hand it to.

use hope_common::db::{CollectorRole, HouseholdRole, MergeScope, RELATIONSHIP_HEAD};
use hope_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::households::{self, Household};
use crate::db::individuals::{self, Individual};
use crate::db::{documents, roles};
use crate::services::index_notifier::MutationSet;

/// Role hand-over that cannot be applied. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ReassignmentError {
    #[error("Individual {individual} already holds PRIMARY in household {household}")]
    AlternateIsPrimary { household: Uuid, individual: Uuid },

    #[error("Household {household}: {role} held by {outgoing} is not reassigned")]
    MissingRole {
        household: Uuid,
        role: HouseholdRole,
        outgoing: Uuid,
    },

    #[error("Household {household}: {outgoing} does not hold {role}")]
    NotHolder {
        household: Uuid,
        role: HouseholdRole,
        outgoing: Uuid,
    },

    #[error("Individual {0} cannot take over a role from itself")]
    SameIndividual(Uuid),

    #[error("New head {individual} is not a member of household {household}")]
    HeadNotMember { household: Uuid, individual: Uuid },
}

impl From<ReassignmentError> for Error {
    fn from(err: ReassignmentError) -> Self {
        Error::Conflict(err.to_string())
    }
}

/// One role hand-over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignmentEntry {
    pub role: HouseholdRole,
    pub household_id: Uuid,
    pub outgoing_individual_id: Uuid,
    pub new_individual_id: Uuid,
}

impl ReassignmentEntry {
    pub fn new(role: HouseholdRole, household_id: Uuid, outgoing: Uuid, new: Uuid) -> Self {
        Self {
            role,
            household_id,
            outgoing_individual_id: outgoing,
            new_individual_id: new,
        }
    }
}

/// How an individual leaves the active population
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Withdraw,
    DuplicateOf(Uuid),
}

/// Apply hand-overs to one household, HEAD first, then PRIMARY, then
/// ALTERNATE
pub async fn reassign_roles(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    entries: &[ReassignmentEntry],
) -> Result<MutationSet> {
    let mut household = households::load_household(conn, household_id, MergeScope::Any)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Household {}", household_id)))?;

    let mut ordered: Vec<&ReassignmentEntry> = entries.iter().collect();
    if let Some(stray) = ordered.iter().find(|e| e.household_id != household_id) {
        return Err(Error::InvalidInput(format!(
            "Reassignment for household {} passed to household {}",
            stray.household_id, household_id
        )));
    }
    ordered.sort_by_key(|e| e.role);

    let mut mutations = MutationSet::new();
    for entry in ordered {
        if entry.new_individual_id == entry.outgoing_individual_id {
            return Err(ReassignmentError::SameIndividual(entry.new_individual_id).into());
        }
        let incoming = load_candidate(conn, entry.new_individual_id, &household).await?;

        match entry.role {
            HouseholdRole::Head => {
                apply_head(conn, &mut household, entry, &incoming, &mut mutations).await?;
            }
            HouseholdRole::Primary => {
                apply_collector(conn, &household, entry, CollectorRole::Primary).await?;
            }
            HouseholdRole::Alternate => {
                apply_collector(conn, &household, entry, CollectorRole::Alternate).await?;
            }
        }

        mutations.add_individual(entry.new_individual_id);
        mutations.add_individual(entry.outgoing_individual_id);
    }

    if !mutations.is_empty() {
        mutations.add_household(household_id);
    }
    Ok(mutations)
}

async fn load_candidate(
    conn: &mut SqliteConnection,
    id: Uuid,
    household: &Household,
) -> Result<Individual> {
    let individual = individuals::load_individual(conn, id, MergeScope::Any)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Individual {}", id)))?;

    if !individual.is_active() {
        return Err(Error::Conflict(format!("Individual {} is withdrawn or a duplicate", id)));
    }
    if individual.program_id != household.program_id {
        return Err(Error::Conflict(format!(
            "Individual {} is outside the program of household {}",
            id, household.id
        )));
    }
    Ok(individual)
}

async fn apply_head(
    conn: &mut SqliteConnection,
    household: &mut Household,
    entry: &ReassignmentEntry,
    incoming: &Individual,
    mutations: &mut MutationSet,
) -> Result<()> {
    if household.head_of_household_id == Some(incoming.id) && incoming.is_head() {
        debug!(household = %household.id, head = %incoming.id, "Already head");
        return Ok(());
    }
    if household.head_of_household_id != Some(entry.outgoing_individual_id) {
        return Err(ReassignmentError::NotHolder {
            household: household.id,
            role: HouseholdRole::Head,
            outgoing: entry.outgoing_individual_id,
        }
        .into());
    }
    if incoming.household_id != Some(household.id) {
        return Err(ReassignmentError::HeadNotMember {
            household: household.id,
            individual: incoming.id,
        }
        .into());
    }

    households::set_head(conn, household.id, Some(incoming.id)).await?;
    let demoted = individuals::demote_other_members(conn, household.id, incoming.id).await?;
    individuals::set_relationship(conn, incoming.id, RELATIONSHIP_HEAD).await?;
    household.head_of_household_id = Some(incoming.id);
    mutations.add_individuals(demoted);

    info!(
        household = %household.id,
        from = %entry.outgoing_individual_id,
        to = %incoming.id,
        "Head reassigned"
    );
    Ok(())
}

async fn apply_collector(
    conn: &mut SqliteConnection,
    household: &Household,
    entry: &ReassignmentEntry,
    role: CollectorRole,
) -> Result<()> {
    let current = roles::find_role(conn, household.id, role).await?;
    let row = match current {
        Some(row) if row.individual_id == entry.new_individual_id => {
            debug!(
                household = %household.id,
                role = %role,
                "Role already held by the new individual"
            );
            return Ok(());
        }
        Some(row) if row.individual_id == entry.outgoing_individual_id => row,
        _ => {
            return Err(ReassignmentError::NotHolder {
                household: household.id,
                role: role.into(),
                outgoing: entry.outgoing_individual_id,
            }
            .into())
        }
    };

    if let Some(opposing) = roles::find_role(conn, household.id, role.opposite()).await? {
        if opposing.individual_id == entry.new_individual_id {
            if role == CollectorRole::Alternate {
                return Err(ReassignmentError::AlternateIsPrimary {
                    household: household.id,
                    individual: entry.new_individual_id,
                }
                .into());
            }
            // New PRIMARY gives up its ALTERNATE slot
            roles::delete_role(conn, opposing.id).await?;
        }
    }

    roles::repoint_role(conn, row.id, entry.new_individual_id).await?;
    info!(
        household = %household.id,
        role = %role,
        from = %entry.outgoing_individual_id,
        to = %entry.new_individual_id,
        "Collector role reassigned"
    );
    Ok(())
}

/// Check that `entries` cover every role `individual_id` must hand over
/// before it can be removed. Writes nothing.
pub async fn verify_reassignment_coverage(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    entries: &[ReassignmentEntry],
) -> Result<()> {
    let individual = individuals::load_individual(conn, individual_id, MergeScope::Any)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Individual {}", individual_id)))?;

    let covered = |household: Uuid, role: HouseholdRole| {
        entries
            .iter()
            .any(|e| {
                e.household_id == household
                    && e.role == role
                    && e.outgoing_individual_id == individual_id
            })
    };

    for household_id in households::headed_by(conn, individual_id).await? {
        if is_sole_member(conn, &individual, household_id).await? {
            continue;
        }
        if !covered(household_id, HouseholdRole::Head) {
            return Err(ReassignmentError::MissingRole {
                household: household_id,
                role: HouseholdRole::Head,
                outgoing: individual_id,
            }
            .into());
        }
    }

    for row in roles::roles_held_by(conn, individual_id).await? {
        if row.role != CollectorRole::Primary || covered(row.household_id, HouseholdRole::Primary) {
            continue;
        }
        if is_sole_member(conn, &individual, row.household_id).await? {
            continue;
        }
        return Err(ReassignmentError::MissingRole {
            household: row.household_id,
            role: HouseholdRole::Primary,
            outgoing: individual_id,
        }
        .into());
    }

    Ok(())
}

async fn is_sole_member(
    conn: &mut SqliteConnection,
    individual: &Individual,
    household_id: Uuid,
) -> Result<bool> {
    if individual.household_id != Some(household_id) {
        return Ok(false);
    }
    Ok(individuals::active_member_count(conn, household_id).await? <= 1)
}

/// Active, non-removed members of a household
pub async fn household_active_member_count(
    conn: &mut SqliteConnection,
    household_id: Uuid,
) -> Result<i64> {
    individuals::active_member_count(conn, household_id).await
}

pub async fn withdraw_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    entries: &[ReassignmentEntry],
) -> Result<MutationSet> {
    remove_individual(conn, individual_id, Removal::Withdraw, entries).await
}

/// Mark `individual_id` duplicate of `unique_individual_id` and invalidate
/// its documents
pub async fn mark_duplicate(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    unique_individual_id: Uuid,
    entries: &[ReassignmentEntry],
) -> Result<MutationSet> {
    let removal = Removal::DuplicateOf(unique_individual_id);
    remove_individual(conn, individual_id, removal, entries).await
}

/// ACTIVE → WITHDRAWN or DUPLICATE-of-X after applying the hand-overs.
///
/// A household left without active members is withdrawn too.
pub async fn remove_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    removal: Removal,
    entries: &[ReassignmentEntry],
) -> Result<MutationSet> {
    let individual = individuals::load_individual(conn, individual_id, MergeScope::Any)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Individual {}", individual_id)))?;
    if !individual.is_active() {
        return Err(Error::Conflict(format!(
            "Individual {} is already withdrawn or a duplicate",
            individual_id
        )));
    }

    if let Removal::DuplicateOf(unique_id) = removal {
        if unique_id == individual_id {
            return Err(Error::InvalidInput(format!(
                "Individual {} cannot duplicate itself",
                individual_id
            )));
        }
        let unique = individuals::load_individual(conn, unique_id, MergeScope::Any)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Individual {}", unique_id)))?;
        if unique.duplicate {
            return Err(Error::Conflict(format!("Individual {} is itself a duplicate", unique_id)));
        }
    }

    verify_reassignment_coverage(conn, individual_id, entries).await?;

    let mut by_household: BTreeMap<Uuid, Vec<ReassignmentEntry>> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.outgoing_individual_id == individual_id) {
        by_household.entry(entry.household_id).or_default().push(entry.clone());
    }

    let mut mutations = MutationSet::new();
    for (household_id, household_entries) in &by_household {
        mutations.merge(reassign_roles(conn, *household_id, household_entries).await?);
    }

    // Whatever is still held was optional (ALTERNATE) or belongs to a
    // household that is about to lose its last member
    for leftover in roles::roles_held_by(conn, individual_id).await? {
        debug!(
            household = %leftover.household_id,
            role = %leftover.role,
            "Dropping unreassigned role"
        );
        roles::delete_role(conn, leftover.id).await?;
        mutations.add_household(leftover.household_id);
    }

    match removal {
        Removal::Withdraw => {
            individuals::mark_withdrawn(conn, individual_id).await?;
            info!(individual = %individual_id, "Individual withdrawn");
        }
        Removal::DuplicateOf(unique_id) => {
            individuals::mark_duplicate(conn, individual_id, unique_id).await?;
            let invalidated = documents::invalidate_for_individual(conn, individual_id).await?;
            info!(
                individual = %individual_id,
                unique = %unique_id,
                invalidated,
                "Individual marked duplicate"
            );
        }
    }
    mutations.add_individual(individual_id);

    if let Some(household_id) = individual.household_id {
        mutations.add_household(household_id);
        if individuals::active_member_count(conn, household_id).await? == 0 {
            households::mark_withdrawn(conn, household_id).await?;
            warn!(household = %household_id, "Last active member removed, household withdrawn");
        }
    }

    Ok(mutations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::programs::{insert_business_area, insert_program, BusinessArea, Program};
    use crate::db::roles::RoleAssignment;
    use hope_common::db::{open_in_memory, MergeStatus};

    struct Family {
        household: Uuid,
        head: Uuid,
        spouse: Uuid,
        child: Uuid,
    }

    async fn family(conn: &mut SqliteConnection) -> Family {
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "yemen".into(),
            name: "Yemen".into(),
            postpone_deduplication: false,
        };
        insert_business_area(conn, &area).await.unwrap();
        let program = Program {
            id: Uuid::new_v4(),
            business_area_id: area.id,
            name: "Cash".into(),
            status: "ACTIVE".into(),
        };
        insert_program(conn, &program).await.unwrap();

        let mut household = Household::new("HH-Y", area.id);
        household.program_id = Some(program.id);
        household.rdi_merge_status = MergeStatus::Merged;
        households::insert_household(conn, &household).await.unwrap();

        let mut ids = Vec::new();
        for name in ["Head", "Spouse", "Child"] {
            let mut ind = Individual::new(format!("IND-{}", name), name, area.id);
            ind.household_id = Some(household.id);
            ind.program_id = Some(program.id);
            ind.rdi_merge_status = MergeStatus::Merged;
            if name == "Head" {
                ind.relationship = RELATIONSHIP_HEAD.into();
            }
            individuals::insert_individual(conn, &ind).await.unwrap();
            ids.push(ind.id);
        }
        households::set_head(conn, household.id, Some(ids[0])).await.unwrap();
        let primary =
            RoleAssignment::new(household.id, ids[0], CollectorRole::Primary, MergeStatus::Merged);
        roles::insert_role(conn, &primary).await.unwrap();
        let alternate = RoleAssignment::new(
            household.id,
            ids[1],
            CollectorRole::Alternate,
            MergeStatus::Merged,
        );
        roles::insert_role(conn, &alternate).await.unwrap();

        Family {
            household: household.id,
            head: ids[0],
            spouse: ids[1],
            child: ids[2],
        }
    }

    #[tokio::test]
    async fn test_duplicate_head_and_primary_needs_both_gaps_filled() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let f = family(&mut conn).await;

        let err = mark_duplicate(&mut conn, f.head, f.child, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let head_only = [ReassignmentEntry::new(HouseholdRole::Head, f.household, f.head, f.child)];
        let err = mark_duplicate(&mut conn, f.head, f.child, &head_only).await.unwrap_err();
        assert!(err.to_string().contains("PRIMARY"), "{}", err);

        let both = [
            ReassignmentEntry::new(HouseholdRole::Primary, f.household, f.head, f.child),
            ReassignmentEntry::new(HouseholdRole::Head, f.household, f.head, f.child),
        ];
        mark_duplicate(&mut conn, f.head, f.child, &both).await.unwrap();

        let household = households::load_household(&mut conn, f.household, MergeScope::Any)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(household.head_of_household_id, Some(f.child));
        let primary = roles::find_role(&mut conn, f.household, CollectorRole::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(primary.individual_id, f.child);

        let old = individuals::load_individual(&mut conn, f.head, MergeScope::Any)
            .await
            .unwrap()
            .unwrap();
        assert!(old.duplicate);
        assert_eq!(old.unique_individual_id, Some(f.child));
        assert_eq!(old.relationship, hope_common::db::RELATIONSHIP_UNKNOWN);
        assert_eq!(household_active_member_count(&mut conn, f.household).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_alternate_to_primary_holder_conflicts() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let f = family(&mut conn).await;

        let entries = [ReassignmentEntry::new(
            HouseholdRole::Alternate,
            f.household,
            f.spouse,
            f.head,
        )];
        let err = reassign_roles(&mut conn, f.household, &entries).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_primary_moved_away_before_receiving_alternate() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let f = family(&mut conn).await;

        // Listed in the "wrong" order: applied PRIMARY first
        let entries = [
            ReassignmentEntry::new(HouseholdRole::Alternate, f.household, f.spouse, f.head),
            ReassignmentEntry::new(HouseholdRole::Primary, f.household, f.head, f.child),
        ];
        reassign_roles(&mut conn, f.household, &entries).await.unwrap();

        let primary = roles::find_role(&mut conn, f.household, CollectorRole::Primary)
            .await
            .unwrap()
            .unwrap();
        let alternate = roles::find_role(&mut conn, f.household, CollectorRole::Alternate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(primary.individual_id, f.child);
        assert_eq!(alternate.individual_id, f.head);
    }

    #[tokio::test]
    async fn test_new_primary_drops_its_alternate() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let f = family(&mut conn).await;

        let entries = [ReassignmentEntry::new(
            HouseholdRole::Primary,
            f.household,
            f.head,
            f.spouse,
        )];
        reassign_roles(&mut conn, f.household, &entries).await.unwrap();

        let rows = roles::roles_of_household(&mut conn, f.household, MergeScope::Any)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role, CollectorRole::Primary);
        assert_eq!(rows[0].individual_id, f.spouse);
    }

    #[tokio::test]
    async fn test_withdraw_drops_alternate_and_last_member_withdraws_household() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let f = family(&mut conn).await;

        withdraw_individual(&mut conn, f.spouse, &[]).await.unwrap();
        assert!(roles::find_role(&mut conn, f.household, CollectorRole::Alternate)
            .await
            .unwrap()
            .is_none());

        withdraw_individual(&mut conn, f.child, &[]).await.unwrap();
        // Head is now the sole active member: no hand-over needed
        withdraw_individual(&mut conn, f.head, &[]).await.unwrap();

        let household = households::load_household(&mut conn, f.household, MergeScope::Any)
            .await
            .unwrap()
            .unwrap();
        assert!(household.withdrawn);

        let err = withdraw_individual(&mut conn, f.head, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "withdrawal is terminal");
    }

    #[tokio::test]
    async fn test_inactive_candidate_rejected() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let f = family(&mut conn).await;
        withdraw_individual(&mut conn, f.child, &[]).await.unwrap();

        let entries = [ReassignmentEntry::new(HouseholdRole::Head, f.household, f.head, f.child)];
        let err = reassign_roles(&mut conn, f.household, &entries).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let missing = [ReassignmentEntry::new(
            HouseholdRole::Head,
            f.household,
            f.head,
            Uuid::new_v4(),
        )];
        let err = reassign_roles(&mut conn, f.household, &missing).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
