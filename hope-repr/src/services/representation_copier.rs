//! Per-program representations of households and individuals
//!
//! Resolution order for a source entity and a target program:
//!
//! 1. The source already lives in the target program: it is the
//!    representation.
//! 2. The source is a pure copy (origin link to another row, nothing copied
//!    from it): resolve its origin instead, copies are never copied.
//! 3. The lineage already has a row in the target program: reuse it.
//! 4. The source was never scoped nor copied: adjust it in place. A
//!    household qualifies only when its members qualify too, and a member
//!    only moves together with its household.
//! 5. Otherwise copy the row and its satellites.
//!
//! Households resolve their members first, then the household row, then the
//! head and collector roles. Everything runs on the caller's connection; a
//! failure anywhere leaves the caller's savepoint to roll back the whole
//! household.

use hope_common::db::{EntityKind, MergeScope, MergeStatus};
use hope_common::{Error, Result};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::households::{self, Household};
use crate::db::individuals::{self, Individual};
use crate::db::programs::{self, Program};
use crate::db::roles::{self, RoleAssignment};
use crate::db::{accounts, cards, collections, documents, identities};
use crate::services::collection_registry::ensure_collection;
use crate::services::index_notifier::MutationSet;

/// Origin links are followed at most this many hops
const MAX_ORIGIN_HOPS: usize = 8;

/// How a representation was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Already present, nothing written
    Existing,
    /// The source row itself moved into the program
    AdjustedInPlace,
    /// A new row was written
    Copied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Representation {
    pub id: Uuid,
    pub resolution: Resolution,
}

impl Representation {
    fn existing(id: Uuid) -> Self {
        Self {
            id,
            resolution: Resolution::Existing,
        }
    }
}

/// Resolves representations for one unit of work.
///
/// Holds a memo of (kind, source, program) → representation so an
/// individual referenced twice (member and external collector) resolves
/// once. Create one per item: the memo is not valid across a rolled-back
/// savepoint.
#[derive(Debug, Default)]
pub struct RepresentationCopier {
    cache: HashMap<(EntityKind, Uuid, Uuid), Uuid>,
    programs: HashMap<Uuid, Program>,
    mutations: MutationSet,
}

impl RepresentationCopier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities written so far
    pub fn mutations(&self) -> &MutationSet {
        &self.mutations
    }

    pub fn into_mutations(self) -> MutationSet {
        self.mutations
    }

    /// Representation of a household in `program_id`, with members, head,
    /// roles and (for true copies) entitlement cards
    pub async fn household_representation(
        &mut self,
        conn: &mut SqliteConnection,
        source_id: Uuid,
        program_id: Uuid,
    ) -> Result<Representation> {
        let program = self.program(conn, program_id).await?;
        if let Some(id) = self.cache.get(&(EntityKind::Household, source_id, program_id)) {
            return Ok(Representation::existing(*id));
        }

        let mut source = load_household(conn, source_id).await?;
        check_business_area(EntityKind::Household, source.id, source.business_area_id, &program)?;

        let mut hops = 0;
        loop {
            if source.program_id == Some(program_id) {
                let rep = Representation::existing(source.id);
                return Ok(self.remember(EntityKind::Household, source_id, program_id, rep));
            }
            if source.is_copy()
                && !collections::has_outgoing_copies(conn, EntityKind::Household, source.id).await?
            {
                hops += 1;
                if hops > MAX_ORIGIN_HOPS {
                    return Err(Error::Internal(format!(
                        "Household {} origin chain too long",
                        source_id
                    )));
                }
                let origin = source.copied_from_id.unwrap_or(source.id);
                debug!(
                    household = %source.id,
                    origin = %origin,
                    "Pure copy, resolving origin instead"
                );
                source = load_household(conn, origin).await?;
                continue;
            }
            break;
        }

        if let Some(collection_id) = source.collection_id {
            let existing =
                collections::find_in_program(conn, EntityKind::Household, collection_id, program_id)
                    .await?;
            if let Some(existing) = existing {
                let rep = Representation::existing(existing);
                return Ok(self.remember(EntityKind::Household, source_id, program_id, rep));
            }
        }

        // Members before the household row. The household moves in place
        // only together with all of its members.
        let members = individuals::load_members(conn, source.id, MergeScope::Any).await?;
        let in_place = source.program_id.is_none()
            && source.collection_id.is_none()
            && members
                .iter()
                .filter(|m| !m.duplicate)
                .all(|m| m.program_id.is_none() && m.collection_id.is_none());
        let target_id = if in_place { source.id } else { Uuid::new_v4() };

        let mut resolved: HashMap<Uuid, Uuid> = HashMap::with_capacity(members.len());
        for member in members.iter().filter(|m| !m.duplicate) {
            let rep = self.resolve_individual(conn, member.id, &program, Some(target_id)).await?;
            resolved.insert(member.id, rep.id);
        }

        let resolution = if in_place {
            households::adjust_in_place(conn, source.id, program_id).await?;
            ensure_collection(conn, EntityKind::Household, source.id).await?;
            Resolution::AdjustedInPlace
        } else {
            let collection_id = ensure_collection(conn, EntityKind::Household, source.id).await?;
            let copy = Household {
                id: target_id,
                program_id: Some(program_id),
                collection_id: Some(collection_id),
                copied_from_id: Some(source.id),
                origin_unicef_id: Some(
                    source
                        .origin_unicef_id
                        .clone()
                        .unwrap_or_else(|| source.unicef_id.clone()),
                ),
                head_of_household_id: None,
                created_at: chrono::Utc::now(),
                ..source.clone()
            };
            households::insert_household(conn, &copy).await?;
            Resolution::Copied
        };

        // Head by lookup of its representation
        let head = match source.head_of_household_id {
            Some(head_id) => match resolved.get(&head_id) {
                Some(rep) => Some(*rep),
                None => {
                    let rep = self
                        .resolve_individual(conn, head_id, &program, Some(target_id))
                        .await?;
                    Some(rep.id)
                }
            },
            None => None,
        };
        if head != source.head_of_household_id || !in_place {
            households::set_head(conn, target_id, head).await?;
        }

        if !in_place {
            let written =
                cards::copy_cards(conn, source.id, target_id, source.rdi_merge_status).await?;
            debug!(household = %target_id, cards = written, "Entitlement cards copied");
        }

        self.copy_roles(conn, &source, target_id, in_place, &resolved, &program).await?;

        self.mutations.add_household(target_id);
        info!(
            household = %source.id,
            representation = %target_id,
            program = %program_id,
            members = resolved.len(),
            in_place,
            "Household representation created"
        );

        Ok(self.remember(
            EntityKind::Household,
            source_id,
            program_id,
            Representation {
                id: target_id,
                resolution,
            },
        ))
    }

    /// Representation of an individual in `program_id`, outside any
    /// household copy (external collectors, orphans)
    pub async fn individual_representation(
        &mut self,
        conn: &mut SqliteConnection,
        source_id: Uuid,
        program_id: Uuid,
    ) -> Result<Representation> {
        let program = self.program(conn, program_id).await?;
        self.resolve_individual(conn, source_id, &program, None).await
    }

    async fn resolve_individual(
        &mut self,
        conn: &mut SqliteConnection,
        source_id: Uuid,
        program: &Program,
        household_id: Option<Uuid>,
    ) -> Result<Representation> {
        let program_id = program.id;
        let cached = self
            .cache
            .get(&(EntityKind::Individual, source_id, program_id))
            .copied();
        if let Some(id) = cached {
            if let Some(household_id) = household_id {
                individuals::attach_to_household(conn, id, household_id).await?;
            }
            return Ok(Representation::existing(id));
        }

        let mut source = load_individual(conn, source_id).await?;
        check_business_area(EntityKind::Individual, source.id, source.business_area_id, program)?;

        let mut hops = 0;
        loop {
            if source.program_id == Some(program_id) {
                let rep = Representation::existing(source.id);
                return Ok(self.remember(EntityKind::Individual, source_id, program_id, rep));
            }
            if source.is_copy()
                && !collections::has_outgoing_copies(conn, EntityKind::Individual, source.id).await?
            {
                hops += 1;
                if hops > MAX_ORIGIN_HOPS {
                    return Err(Error::Internal(format!(
                        "Individual {} origin chain too long",
                        source_id
                    )));
                }
                let origin = source.copied_from_id.unwrap_or(source.id);
                source = load_individual(conn, origin).await?;
                continue;
            }
            break;
        }

        if let Some(collection_id) = source.collection_id {
            let existing = collections::find_in_program(
                conn,
                EntityKind::Individual,
                collection_id,
                program_id,
            )
            .await?;
            if let Some(existing) = existing {
                // A member that got its representation as an external
                // collector first has no household yet
                if let Some(household_id) = household_id {
                    individuals::attach_to_household(conn, existing, household_id).await?;
                    self.mutations.add_individual(existing);
                }
                let rep = Representation::existing(existing);
                return Ok(self.remember(EntityKind::Individual, source_id, program_id, rep));
            }
        }

        if source.duplicate {
            return Err(Error::Conflict(format!(
                "Individual {} is marked duplicate of {:?} and cannot be enrolled",
                source.id, source.unique_individual_id
            )));
        }

        // A member moves in place only with its own household; enrolled on
        // its own or into a household copy it is copied instead
        let in_place = source.program_id.is_none()
            && source.collection_id.is_none()
            && source.household_id == household_id;
        let representation = if in_place {
            individuals::adjust_in_place(conn, source.id, program_id)
                .await
                .map_err(|e| e.for_entity(source.id))?;
            ensure_collection(conn, EntityKind::Individual, source.id).await?;
            accounts::validate_for_individual(conn, source.id).await?;
            Representation {
                id: source.id,
                resolution: Resolution::AdjustedInPlace,
            }
        } else {
            let id = self.copy_individual(conn, &source, program_id, household_id).await?;
            Representation {
                id,
                resolution: Resolution::Copied,
            }
        };

        self.mutations.add_individual(representation.id);
        Ok(self.remember(EntityKind::Individual, source_id, program_id, representation))
    }

    async fn copy_individual(
        &mut self,
        conn: &mut SqliteConnection,
        source: &Individual,
        program_id: Uuid,
        household_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let collection_id = ensure_collection(conn, EntityKind::Individual, source.id).await?;
        let copy = Individual {
            id: Uuid::new_v4(),
            household_id,
            program_id: Some(program_id),
            collection_id: Some(collection_id),
            copied_from_id: Some(source.id),
            origin_unicef_id: Some(
                source
                    .origin_unicef_id
                    .clone()
                    .unwrap_or_else(|| source.unicef_id.clone()),
            ),
            duplicate: false,
            unique_individual_id: None,
            created_at: chrono::Utc::now(),
            ..source.clone()
        };
        individuals::insert_individual(conn, &copy).await?;

        let status = source.rdi_merge_status;
        let docs = documents::copy_documents(conn, source.id, copy.id, program_id, status)
            .await
            .map_err(|e| e.for_entity(source.id))?;
        let ids = identities::copy_identities(conn, source.id, copy.id, status).await?;
        let accounts = accounts::copy_accounts(conn, source.id, copy.id, status).await?;

        debug!(
            individual = %source.id,
            representation = %copy.id,
            program = %program_id,
            documents = docs,
            identities = ids,
            accounts,
            "Individual copied"
        );
        Ok(copy.id)
    }

    async fn copy_roles(
        &mut self,
        conn: &mut SqliteConnection,
        source: &Household,
        target_id: Uuid,
        in_place: bool,
        resolved: &HashMap<Uuid, Uuid>,
        program: &Program,
    ) -> Result<()> {
        for role in roles::roles_of_household(conn, source.id, MergeScope::Any).await? {
            let holder = match resolved.get(&role.individual_id) {
                Some(rep) => *rep,
                // External collector: not a member of the household
                None => self.resolve_individual(conn, role.individual_id, program, None).await?.id,
            };

            if in_place {
                if holder != role.individual_id {
                    roles::repoint_role(conn, role.id, holder).await?;
                }
            } else {
                let copy = RoleAssignment::new(target_id, holder, role.role, role.rdi_merge_status);
                roles::insert_role(conn, &copy).await?;
            }
        }
        Ok(())
    }

    async fn program(&mut self, conn: &mut SqliteConnection, program_id: Uuid) -> Result<Program> {
        if let Some(program) = self.programs.get(&program_id) {
            return Ok(program.clone());
        }
        let program = programs::load_program(conn, program_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Program {}", program_id)))?;
        self.programs.insert(program_id, program.clone());
        Ok(program)
    }

    fn remember(
        &mut self,
        kind: EntityKind,
        source_id: Uuid,
        program_id: Uuid,
        rep: Representation,
    ) -> Representation {
        self.cache.insert((kind, source_id, program_id), rep.id);
        rep
    }
}

async fn load_household(conn: &mut SqliteConnection, id: Uuid) -> Result<Household> {
    let household = households::load_household(conn, id, MergeScope::Any)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Household {}", id)))?;
    if household.rdi_merge_status != MergeStatus::Merged {
        return Err(Error::Conflict(format!("Household {} is not merged yet", id)));
    }
    Ok(household)
}

async fn load_individual(conn: &mut SqliteConnection, id: Uuid) -> Result<Individual> {
    let individual = individuals::load_individual(conn, id, MergeScope::Any)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Individual {}", id)))?;
    if individual.rdi_merge_status != MergeStatus::Merged {
        return Err(Error::Conflict(format!("Individual {} is not merged yet", id)));
    }
    Ok(individual)
}

fn check_business_area(
    kind: EntityKind,
    id: Uuid,
    business_area_id: Uuid,
    program: &Program,
) -> Result<()> {
    if business_area_id != program.business_area_id {
        return Err(Error::Conflict(format!(
            "{} {} belongs to another business area than program {}",
            kind, id, program.id
        )));
    }
    Ok(())
}
