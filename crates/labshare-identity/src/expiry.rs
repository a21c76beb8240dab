//! The expiry registry.
//!
//! Every write is a single statement so concurrent observers and renewals
//! are serialized by SQLite. All functions take `today` explicitly.

use crate::IdentityError;
use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};

const DATE_FORMAT: &str = "%Y-%m-%d";

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(raw: &str) -> Result<NaiveDate, IdentityError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| IdentityError::InvalidExpiryDate(raw.to_string()))
}

/// Starts tracking `identity` with an expiry of `today + ttl_days`.
///
/// Returns `true` if a new entry was created. Observing an already tracked
/// identity changes nothing.
pub fn register_observation(
    conn: &Connection,
    identity: &str,
    today: NaiveDate,
    ttl_days: i64,
) -> Result<bool, IdentityError> {
    let expires_on = today + Duration::days(ttl_days);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO identity_expiry (identity, expires_on, observed_on)
         VALUES (?1, ?2, ?3)",
        params![identity, format_date(expires_on), format_date(today)],
    )?;
    if inserted > 0 {
        tracing::debug!(identity, expires_on = %expires_on, "identity observed");
    }
    Ok(inserted > 0)
}

/// Issues a fresh window of `ttl_days` starting today.
///
/// # Errors
///
/// [`IdentityError::UnknownIdentity`] if the identity was never observed.
pub fn renew(
    conn: &Connection,
    identity: &str,
    today: NaiveDate,
    ttl_days: i64,
) -> Result<NaiveDate, IdentityError> {
    let expires_on = today + Duration::days(ttl_days);
    let updated = conn.execute(
        "UPDATE identity_expiry SET expires_on = ?2, renewed_on = ?3 WHERE identity = ?1",
        params![identity, format_date(expires_on), format_date(today)],
    )?;
    if updated == 0 {
        return Err(IdentityError::UnknownIdentity(identity.to_string()));
    }
    tracing::info!(identity, expires_on = %expires_on, "identity renewed");
    Ok(expires_on)
}

/// The recorded expiry date, or `None` if the identity is not tracked.
pub fn expiry_date(conn: &Connection, identity: &str) -> Result<Option<NaiveDate>, IdentityError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT expires_on FROM identity_expiry WHERE identity = ?1",
            [identity],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_date).transpose()
}

/// An untracked identity is not expired. A tracked one is valid through its
/// expiry date and expired from the day after.
pub fn is_expired(conn: &Connection, identity: &str, today: NaiveDate) -> Result<bool, IdentityError> {
    Ok(match expiry_date(conn, identity)? {
        Some(expires_on) => today > expires_on,
        None => false,
    })
}

/// Every tracked identity whose expiry date is before `today`.
pub fn expired_identities(conn: &Connection, today: NaiveDate) -> Result<Vec<String>, IdentityError> {
    let mut stmt = conn.prepare(
        "SELECT identity FROM identity_expiry WHERE expires_on < ?1 ORDER BY identity",
    )?;
    let rows = stmt.query_map([format_date(today)], |row| row.get(0))?;
    let mut expired = Vec::new();
    for row in rows {
        expired.push(row?);
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        labshare_db::run_migrations(&conn).unwrap();
        conn
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn untracked_identity_is_not_expired() {
        let conn = setup();
        assert_eq!(expiry_date(&conn, "abc@LabA").unwrap(), None);
        assert!(!is_expired(&conn, "abc@LabA", day("2024-01-01")).unwrap());
    }

    #[test]
    fn expiry_boundary() {
        let conn = setup();
        assert!(register_observation(&conn, "abc@LabA", day("2024-01-01"), 30).unwrap());

        assert_eq!(expiry_date(&conn, "abc@LabA").unwrap(), Some(day("2024-01-31")));
        assert!(!is_expired(&conn, "abc@LabA", day("2024-01-31")).unwrap());
        assert!(is_expired(&conn, "abc@LabA", day("2024-02-01")).unwrap());
    }

    #[test]
    fn observation_is_idempotent() {
        let conn = setup();
        assert!(register_observation(&conn, "abc@LabA", day("2024-01-01"), 30).unwrap());
        assert!(!register_observation(&conn, "abc@LabA", day("2024-01-20"), 30).unwrap());
        assert_eq!(expiry_date(&conn, "abc@LabA").unwrap(), Some(day("2024-01-31")));
    }

    #[test]
    fn renew_requires_prior_observation() {
        let conn = setup();
        assert!(matches!(
            renew(&conn, "abc@LabA", day("2024-01-01"), 30),
            Err(IdentityError::UnknownIdentity(_))
        ));

        register_observation(&conn, "abc@LabA", day("2024-01-01"), 30).unwrap();
        let renewed = renew(&conn, "abc@LabA", day("2024-02-10"), 30).unwrap();
        assert_eq!(renewed, day("2024-03-11"));
        assert!(!is_expired(&conn, "abc@LabA", day("2024-03-01")).unwrap());
    }

    #[test]
    fn lists_expired_identities() {
        let conn = setup();
        register_observation(&conn, "old@LabA", day("2024-01-01"), 30).unwrap();
        register_observation(&conn, "new@LabA", day("2024-02-15"), 30).unwrap();

        let expired = expired_identities(&conn, day("2024-02-20")).unwrap();
        assert_eq!(expired, vec!["old@LabA".to_string()]);
    }
}
