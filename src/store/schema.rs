use rusqlite::{Connection, Result};

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            timezone TEXT NOT NULL,
            retention_offset_days INTEGER,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS event_participants (
            event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            username TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY(event_id, username)
        );

        CREATE TABLE IF NOT EXISTS event_wikis (
            event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            db_name TEXT NOT NULL,
            PRIMARY KEY(event_id, db_name)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id INTEGER NOT NULL UNIQUE REFERENCES events(id) ON DELETE CASCADE,
            submitted_at TEXT NOT NULL,
            started_at TEXT,
            status TEXT NOT NULL CHECK(status IN ('queued','busy'))
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_submitted ON jobs(status, submitted_at, id);

        CREATE TABLE IF NOT EXISTS event_stats (
            event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            metric TEXT NOT NULL,
            value INTEGER NOT NULL,
            offset_days INTEGER,
            PRIMARY KEY(event_id, metric)
        );

        CREATE TABLE IF NOT EXISTS event_wiki_stats (
            event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            db_name TEXT NOT NULL,
            metric TEXT NOT NULL,
            value INTEGER NOT NULL,
            PRIMARY KEY(event_id, db_name, metric)
        );
        ",
    )?;

    Ok(())
}
