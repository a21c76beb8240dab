use labshare_crypto::SignedMessage;
use labshare_types::NodeAvailability;
use rusqlite::{params, Connection, Result};

/// Replaces the availability snapshot with the result of a sweep.
pub fn replace_availability(conn: &mut Connection, snapshot: &[NodeAvailability]) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM node_availability", [])?;
    for node in snapshot {
        tx.execute(
            "INSERT INTO node_availability (laboratory_name, address, reachable, checked_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![node.laboratory_name, node.address, node.reachable, node.checked_at],
        )?;
    }
    tx.commit()
}

/// The snapshot written by the last sweep, sorted by node name.
pub fn list_availability(conn: &Connection) -> Result<Vec<NodeAvailability>> {
    let mut stmt = conn.prepare(
        "SELECT laboratory_name, address, reachable, checked_at
         FROM node_availability ORDER BY laboratory_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(NodeAvailability {
            laboratory_name: row.get(0)?,
            address: row.get(1)?,
            reachable: row.get(2)?,
            checked_at: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// Queues a signed announcement for later delivery to `node`.
pub fn enqueue_announcement(conn: &Connection, node: &str, message: &SignedMessage) -> Result<i64> {
    let payload = serde_json::to_string(message)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO pending_announcements (laboratory_name, payload_json) VALUES (?1, ?2)",
        params![node, payload],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Announcements queued for `node`, oldest first.
pub fn pending_announcements(conn: &Connection, node: &str) -> Result<Vec<(i64, SignedMessage)>> {
    let mut stmt = conn.prepare(
        "SELECT id, payload_json FROM pending_announcements
         WHERE laboratory_name = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([node], |row| {
        let id: i64 = row.get(0)?;
        let raw: String = row.get(1)?;
        let message = serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok((id, message))
    })?;
    rows.collect()
}

pub fn delete_announcement(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM pending_announcements WHERE id = ?1", [id])?;
    Ok(())
}

/// Total number of queued announcements across all nodes.
pub fn pending_count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM pending_announcements", [], |row| {
        row.get(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        labshare_db::run_migrations(&conn).unwrap();
        conn
    }

    fn availability(name: &str, reachable: bool) -> NodeAvailability {
        NodeAvailability {
            laboratory_name: name.to_string(),
            address: format!("http://{name}"),
            reachable,
            checked_at: "2024-05-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn snapshot_is_replaced_not_merged() {
        let mut conn = setup();
        replace_availability(&mut conn, &[availability("LabB", true), availability("LabC", false)])
            .unwrap();
        replace_availability(&mut conn, &[availability("LabB", false)]).unwrap();

        let snapshot = list_availability(&conn).unwrap();
        assert_eq!(snapshot, vec![availability("LabB", false)]);
    }

    #[test]
    fn announcements_come_back_in_order() {
        let conn = setup();
        let first = SignedMessage::new().with("public_key", json!("k1"));
        let second = SignedMessage::new().with("public_key", json!("k2"));
        enqueue_announcement(&conn, "LabB", &first).unwrap();
        enqueue_announcement(&conn, "LabC", &first).unwrap();
        enqueue_announcement(&conn, "LabB", &second).unwrap();

        let pending = pending_announcements(&conn, "LabB").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1, first);
        assert_eq!(pending[1].1, second);
        assert_eq!(pending_count(&conn).unwrap(), 3);

        delete_announcement(&conn, pending[0].0).unwrap();
        assert_eq!(pending_announcements(&conn, "LabB").unwrap().len(), 1);
    }
}
