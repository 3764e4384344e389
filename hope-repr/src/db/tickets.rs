//! Needs-adjudication grievance tickets

use hope_common::db::{AdjudicationDecision, TicketStatus};
use hope_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_time, parse_uuid, to_text};

#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: Uuid,
    pub status: TicketStatus,
    pub business_area_id: Uuid,
    /// None when the ticket was raised by a business-area wide run
    pub program_id: Option<Uuid>,
    pub golden_record_individual_id: Uuid,
    pub possible_duplicates: Vec<Uuid>,
    /// `number|type|country` that raised the ticket
    pub matching_key: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Ticket {
    /// Golden record plus possible duplicates
    pub fn implicated(&self) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(self.possible_duplicates.len() + 1);
        ids.push(self.golden_record_individual_id);
        ids.extend(self.possible_duplicates.iter().copied());
        ids
    }
}

fn from_row(row: &SqliteRow, possible_duplicates: Vec<Uuid>) -> Result<Ticket> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let business_area_id: String = row.get("business_area_id");
    let golden: String = row.get("golden_record_individual_id");
    let created_at: String = row.get("created_at");
    let closed_at: Option<String> = row.get("closed_at");

    Ok(Ticket {
        id: parse_uuid(&id)?,
        status: status.parse()?,
        business_area_id: parse_uuid(&business_area_id)?,
        program_id: parse_opt_uuid(row.get("program_id"))?,
        golden_record_individual_id: parse_uuid(&golden)?,
        possible_duplicates,
        matching_key: row.get("matching_key"),
        created_at: parse_time(&created_at)?,
        closed_at: closed_at.as_deref().map(parse_time).transpose()?,
    })
}

async fn possible_duplicates(conn: &mut SqliteConnection, ticket_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT individual_id FROM ticket_possible_duplicates WHERE ticket_id = ? ORDER BY \
         individual_id",
    )
    .bind(ticket_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    ids.iter().map(|s| parse_uuid(s)).collect()
}

pub async fn load_ticket(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Ticket>> {
    let row = sqlx::query(
        r#"
        SELECT id, status, business_area_id, program_id, golden_record_individual_id,
               matching_key, created_at, closed_at
        FROM grievance_tickets WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let duplicates = possible_duplicates(conn, id).await?;
            Ok(Some(from_row(&row, duplicates)?))
        }
        None => Ok(None),
    }
}

pub async fn insert_ticket(conn: &mut SqliteConnection, ticket: &Ticket) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO grievance_tickets (
            id, category, issue_type, status, business_area_id, program_id,
            golden_record_individual_id, matching_key, created_at, closed_at
        ) VALUES (?, 'NEEDS_ADJUDICATION', 'DOCUMENT', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ticket.id.to_string())
    .bind(ticket.status.as_str())
    .bind(ticket.business_area_id.to_string())
    .bind(opt_text(ticket.program_id))
    .bind(ticket.golden_record_individual_id.to_string())
    .bind(&ticket.matching_key)
    .bind(to_text(ticket.created_at))
    .bind(ticket.closed_at.map(to_text))
    .execute(&mut *conn)
    .await?;

    for individual_id in &ticket.possible_duplicates {
        add_possible_duplicate(conn, ticket.id, *individual_id).await?;
    }
    Ok(())
}

/// Returns false when the individual was already listed
pub async fn add_possible_duplicate(
    conn: &mut SqliteConnection,
    ticket_id: Uuid,
    individual_id: Uuid,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO ticket_possible_duplicates (ticket_id, individual_id) VALUES (?, ?)",
    )
    .bind(ticket_id.to_string())
    .bind(individual_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// OPEN tickets whose golden record or possible duplicates include any of
/// `individual_ids`, oldest first
pub async fn open_tickets_touching(
    conn: &mut SqliteConnection,
    individual_ids: &[Uuid],
) -> Result<Vec<Ticket>> {
    if individual_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT id FROM grievance_tickets t WHERE t.status = 'OPEN' AND \
         (t.golden_record_individual_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in individual_ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(
        ") OR EXISTS (SELECT 1 FROM ticket_possible_duplicates p \
         WHERE p.ticket_id = t.id AND p.individual_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in individual_ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated("))) ORDER BY t.created_at, t.id");

    let ids: Vec<String> = builder.build_query_scalar::<String>().fetch_all(&mut *conn).await?;

    let mut tickets = Vec::with_capacity(ids.len());
    for raw in ids {
        if let Some(ticket) = load_ticket(conn, parse_uuid(&raw)?).await? {
            tickets.push(ticket);
        }
    }
    Ok(tickets)
}

pub async fn record_decision(
    conn: &mut SqliteConnection,
    ticket_id: Uuid,
    individual_id: Uuid,
    decision: AdjudicationDecision,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ticket_decisions (ticket_id, individual_id, decision, decided_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(ticket_id, individual_id)
        DO UPDATE SET decision = excluded.decision, decided_at = excluded.decided_at
        "#,
    )
    .bind(ticket_id.to_string())
    .bind(individual_id.to_string())
    .bind(decision.as_str())
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn decisions(
    conn: &mut SqliteConnection,
    ticket_id: Uuid,
) -> Result<Vec<(Uuid, AdjudicationDecision)>> {
    let rows = sqlx::query(
        "SELECT individual_id, decision FROM ticket_decisions WHERE ticket_id = ? ORDER BY \
         individual_id",
    )
    .bind(ticket_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| {
            let individual_id: String = row.get("individual_id");
            let decision: String = row.get("decision");
            Ok((parse_uuid(&individual_id)?, decision.parse()?))
        })
        .collect()
}

/// OPEN → CLOSED. Returns false if the ticket was not open.
pub async fn close_ticket(conn: &mut SqliteConnection, ticket_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE grievance_tickets SET status = 'CLOSED', closed_at = ? WHERE id = ? AND status = \
         'OPEN'",
    )
    .bind(now_text())
    .bind(ticket_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Tickets that list the individual, any status
pub async fn count_for_individual(conn: &mut SqliteConnection, individual_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM grievance_tickets t
        WHERE t.golden_record_individual_id = ?
           OR EXISTS (SELECT 1 FROM ticket_possible_duplicates p
                      WHERE p.ticket_id = t.id AND p.individual_id = ?)
        "#,
    )
    .bind(individual_id.to_string())
    .bind(individual_id.to_string())
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}
