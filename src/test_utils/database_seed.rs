/// Clinic database seeding
/// Builds the legacy clinic schema and fixed rows so migration tests start
/// from a reproducible state.
use rusqlite::{params, Connection};

use crate::data_governance::migration::definitions::history_columns;
use crate::data_governance::migration::schema::SchemaApplier;

/// Legacy schema, before `add-history-columns` ran.
pub const LEGACY_CLINIC_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    birth_date TEXT
);

CREATE TABLE IF NOT EXISTS appointments (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER,
    scheduled_at TEXT NOT NULL,
    reason TEXT
);

CREATE TABLE IF NOT EXISTS patient_history_records (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL,
    visit_date TEXT NOT NULL DEFAULT '2026-01-01',
    diagnosis TEXT,
    notes TEXT
);
";

/// Create the legacy schema only.
pub fn seed_legacy_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(LEGACY_CLINIC_SCHEMA)
}

/// Legacy schema plus the columns of `add-history-columns`. A column that
/// cannot be added is returned as an error.
pub fn seed_clinic_database(conn: &Connection) -> rusqlite::Result<()> {
    seed_legacy_schema(conn)?;
    let report = SchemaApplier::new(conn, "main").apply_all(&history_columns());
    if !report.is_success() {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("seeding columns failed: {:?}", report)),
        ));
    }
    Ok(())
}

pub fn insert_patient(conn: &Connection, id: i64, last_name: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO patients (id, first_name, last_name) VALUES (?1, 'Test', ?2)",
        params![id, last_name],
    )?;
    Ok(())
}

pub fn insert_appointment(
    conn: &Connection,
    id: i64,
    patient_id: Option<i64>,
    scheduled_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO appointments (id, patient_id, scheduled_at) VALUES (?1, ?2, ?3)",
        params![id, patient_id, scheduled_at],
    )?;
    Ok(())
}

/// Needs the seeded (not legacy) schema: writes `interview`.
pub fn insert_history(
    conn: &Connection,
    id: i64,
    patient_id: i64,
    diagnosis: Option<&str>,
    interview: Option<&str>,
    notes: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO patient_history_records (id, patient_id, diagnosis, interview, notes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, patient_id, diagnosis, interview, notes],
    )?;
    Ok(())
}

/// (diagnosis, interview) of one history row.
pub fn history_sections(
    conn: &Connection,
    id: i64,
) -> rusqlite::Result<(Option<String>, Option<String>)> {
    conn.query_row(
        "SELECT diagnosis, interview FROM patient_history_records WHERE id = ?1",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

pub fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
        row.get(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_reports_columns_it_cannot_add() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE patient_history_records (id INTEGER PRIMARY KEY);
             CREATE TABLE appointments (id INTEGER PRIMARY KEY);
             CREATE VIEW patients AS SELECT 1 AS id;",
        )
        .unwrap();
        let err = seed_clinic_database(&conn).unwrap_err();
        assert!(err.to_string().contains("seeding columns failed"));
    }
}
