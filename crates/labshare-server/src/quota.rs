//! The daily budget for unauthenticated variant queries.

use rusqlite::{params, Connection, OptionalExtension, Result};

/// Takes one query from the budget. Returns `false` once it is used up.
///
/// The first call after a fresh database starts the budget at `limit`.
pub fn try_consume(conn: &Connection, limit: u32) -> Result<bool> {
    conn.execute(
        "INSERT OR IGNORE INTO public_quota (id, remaining) VALUES (1, ?1)",
        [limit],
    )?;
    let updated = conn.execute(
        "UPDATE public_quota SET remaining = remaining - 1 WHERE id = 1 AND remaining > 0",
        [],
    )?;
    Ok(updated == 1)
}

/// Restores the full budget.
pub fn reset(conn: &Connection, limit: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO public_quota (id, remaining, reset_at) VALUES (1, ?1, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET remaining = excluded.remaining, reset_at = excluded.reset_at",
        params![limit],
    )?;
    Ok(())
}

pub fn remaining(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row("SELECT remaining FROM public_quota WHERE id = 1", [], |row| {
        row.get(0)
    })
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_runs_out_and_resets() {
        let conn = Connection::open_in_memory().unwrap();
        labshare_db::run_migrations(&conn).unwrap();

        assert_eq!(remaining(&conn).unwrap(), None);
        assert!(try_consume(&conn, 2).unwrap());
        assert!(try_consume(&conn, 2).unwrap());
        assert!(!try_consume(&conn, 2).unwrap());
        assert_eq!(remaining(&conn).unwrap(), Some(0));

        reset(&conn, 2).unwrap();
        assert_eq!(remaining(&conn).unwrap(), Some(2));
        assert!(try_consume(&conn, 2).unwrap());
    }

    #[test]
    fn zero_limit_allows_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        labshare_db::run_migrations(&conn).unwrap();
        assert!(!try_consume(&conn, 0).unwrap());
    }
}
