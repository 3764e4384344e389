//! Cross-program identity
//!
//! A collection is created the first time an entity gets a representation
//! and is shared by every representation of that entity afterwards.

use hope_common::db::EntityKind;
use hope_common::Result;
use sqlx::SqliteConnection;
use tracing::debug;
use uuid::Uuid;

use crate::db::collections::{self, CollectionMember};

/// Collection of an entity, creating and attaching one if it has none.
///
/// Runs inside the caller's transaction. The conditional attach makes a
/// concurrent creator lose cleanly: its collection row is removed again
/// before commit and the winner's id is returned.
pub async fn ensure_collection(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: Uuid,
) -> Result<Uuid> {
    if let Some(existing) = collections::collection_of(conn, kind, entity_id).await? {
        return Ok(existing);
    }

    let created = collections::insert_collection(conn, kind).await?;
    if collections::attach_if_unset(conn, kind, entity_id, created).await? {
        debug!(kind = %kind, entity = %entity_id, collection = %created, "Collection created");
        return Ok(created);
    }

    collections::delete_collection(conn, created).await?;
    match collections::collection_of(conn, kind, entity_id).await? {
        Some(winner) => Ok(winner),
        None => Err(hope_common::Error::Internal(format!(
            "{} {} lost collection attach but has no collection",
            kind, entity_id
        ))),
    }
}

/// Collection id, or the entity's own id when it was never copied
pub async fn lineage_key(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: Uuid,
) -> Result<Uuid> {
    Ok(collections::collection_of(conn, kind, entity_id).await?.unwrap_or(entity_id))
}

/// All live representations of a collection, any program
pub async fn collection_members(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    collection_id: Uuid,
) -> Result<Vec<CollectionMember>> {
    collections::collection_members(conn, kind, collection_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::households::{insert_household, Household};
    use crate::db::programs::{insert_business_area, BusinessArea};
    use hope_common::db::open_in_memory;
    use hope_common::Error;

    #[tokio::test]
    async fn test_ensure_collection_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "sudan".into(),
            name: "Sudan".into(),
            postpone_deduplication: false,
        };
        insert_business_area(&mut conn, &area).await.unwrap();
        let household = Household::new("HH-1", area.id);
        insert_household(&mut conn, &household).await.unwrap();

        assert_eq!(
            lineage_key(&mut conn, EntityKind::Household, household.id).await.unwrap(),
            household.id
        );

        let first = ensure_collection(&mut conn, EntityKind::Household, household.id)
            .await
            .unwrap();
        let second = ensure_collection(&mut conn, EntityKind::Household, household.id)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            lineage_key(&mut conn, EntityKind::Household, household.id).await.unwrap(),
            first
        );

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_ensure_collection_missing_entity() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let err = ensure_collection(&mut conn, EntityKind::Individual, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
