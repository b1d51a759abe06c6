use crate::replica::{PageCounts, ReplicaQuery, from_mw_timestamp, to_mw_timestamp};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, params_from_iter};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

const REPLICA_EXTENSION: &str = "sqlite";

/// Creates the reduced MediaWiki schema the replica queries read from.
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS page (
            page_id INTEGER PRIMARY KEY,
            page_namespace INTEGER NOT NULL,
            page_title TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS revision (
            rev_id INTEGER PRIMARY KEY,
            rev_page INTEGER NOT NULL REFERENCES page(page_id),
            rev_parent_id INTEGER NOT NULL DEFAULT 0,
            rev_user_text TEXT NOT NULL,
            rev_timestamp TEXT NOT NULL,
            rev_len INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_revision_user_ts ON revision(rev_user_text, rev_timestamp);
        CREATE INDEX IF NOT EXISTS idx_revision_page ON revision(rev_page);
        ",
    )
}

/// Replica cluster laid out as one SQLite file per wiki: `<dir>/<dbName>.sqlite`.
pub struct SqliteReplicas {
    dir: PathBuf,
}

impl SqliteReplicas {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn replica_path(&self, db_name: &str) -> Result<PathBuf> {
        validate_db_name(db_name)?;
        Ok(self.dir.join(format!("{db_name}.{REPLICA_EXTENSION}")))
    }

    fn open(&self, db_name: &str) -> Result<Connection> {
        let path = self.replica_path(db_name)?;
        if !path.exists() {
            bail!("replica database `{db_name}` not found at {}", path.display());
        }
        Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open replica {}", path.display()))
    }

    fn known_wikis(&self) -> Result<Vec<String>> {
        let mut wikis = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("list replica dir {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REPLICA_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && validate_db_name(stem).is_ok()
            {
                wikis.push(stem.to_string());
            }
        }
        wikis.sort();
        Ok(wikis)
    }
}

fn validate_db_name(db_name: &str) -> Result<()> {
    if db_name.is_empty()
        || !db_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("invalid wiki database name `{db_name}`");
    }
    Ok(())
}

/// `?first, ?first+1, ...` for `count` bound values.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ReplicaQuery for SqliteReplicas {
    fn first_edits(
        &self,
        db_name: &str,
        usernames: &[String],
    ) -> Result<BTreeMap<String, DateTime<Utc>>> {
        if usernames.is_empty() {
            return Ok(BTreeMap::new());
        }
        let conn = self.open(db_name)?;
        let sql = format!(
            "SELECT rev_user_text, MIN(rev_timestamp) FROM revision
             WHERE rev_user_text IN ({}) GROUP BY rev_user_text",
            placeholders(1, usernames.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(usernames), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("query first edits on {db_name}"))?;
        rows.into_iter()
            .map(|(user, ts)| Ok((user, from_mw_timestamp(&ts)?)))
            .collect()
    }

    fn page_counts(
        &self,
        db_name: &str,
        usernames: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PageCounts> {
        if usernames.is_empty() {
            return Ok(PageCounts::default());
        }
        let conn = self.open(db_name)?;
        let users = placeholders(3, usernames.len());
        let sql = format!(
            "SELECT
                (SELECT COUNT(DISTINCT r.rev_page) FROM revision r
                    JOIN page p ON p.page_id = r.rev_page
                    WHERE p.page_namespace = 0 AND r.rev_parent_id = 0
                      AND r.rev_timestamp BETWEEN ?1 AND ?2 AND r.rev_user_text IN ({users})),
                (SELECT COUNT(DISTINCT r.rev_page) FROM revision r
                    JOIN page p ON p.page_id = r.rev_page
                    WHERE p.page_namespace = 0
                      AND r.rev_timestamp BETWEEN ?1 AND ?2 AND r.rev_user_text IN ({users})
                      AND r.rev_page NOT IN (
                        SELECT c.rev_page FROM revision c
                        WHERE c.rev_parent_id = 0
                          AND c.rev_timestamp BETWEEN ?1 AND ?2 AND c.rev_user_text IN ({users}))),
                (SELECT COUNT(*) FROM revision r
                    WHERE r.rev_timestamp BETWEEN ?1 AND ?2 AND r.rev_user_text IN ({users})),
                (SELECT COALESCE(SUM(r.rev_len - COALESCE(parent.rev_len, 0)), 0) FROM revision r
                    JOIN page p ON p.page_id = r.rev_page
                    LEFT JOIN revision parent ON parent.rev_id = r.rev_parent_id
                    WHERE p.page_namespace = 0
                      AND r.rev_timestamp BETWEEN ?1 AND ?2 AND r.rev_user_text IN ({users}))"
        );
        let mut values = vec![to_mw_timestamp(start), to_mw_timestamp(end)];
        values.extend(usernames.iter().cloned());
        conn.query_row(&sql, params_from_iter(values.iter()), |row| {
            Ok(PageCounts {
                created: row.get(0)?,
                improved: row.get(1)?,
                edits: row.get(2)?,
                bytes: row.get(3)?,
            })
        })
        .with_context(|| format!("query page counts on {db_name}"))
    }

    fn edited_since(
        &self,
        db_name: &str,
        usernames: &[String],
        since: DateTime<Utc>,
    ) -> Result<BTreeSet<String>> {
        if usernames.is_empty() {
            return Ok(BTreeSet::new());
        }
        let conn = self.open(db_name)?;
        let sql = format!(
            "SELECT DISTINCT rev_user_text FROM revision
             WHERE rev_timestamp >= ?1 AND rev_user_text IN ({})",
            placeholders(2, usernames.len())
        );
        let mut values = vec![to_mw_timestamp(since)];
        values.extend(usernames.iter().cloned());
        let mut stmt = conn.prepare(&sql)?;
        let users = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()
            .with_context(|| format!("query retained editors on {db_name}"))?;
        Ok(users)
    }

    fn common_wikis(&self, usernames: &[String]) -> Result<Vec<String>> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let distinct = usernames.iter().collect::<BTreeSet<_>>();
        let sql = format!(
            "SELECT COUNT(DISTINCT rev_user_text) FROM revision WHERE rev_user_text IN ({})",
            placeholders(1, distinct.len())
        );
        let mut wikis = Vec::new();
        for db_name in self.known_wikis()? {
            let conn = self.open(&db_name)?;
            let editors: i64 = conn
                .query_row(&sql, params_from_iter(distinct.iter()), |row| row.get(0))
                .with_context(|| format!("count participant editors on {db_name}"))?;
            if editors as usize == distinct.len() {
                wikis.push(db_name);
            }
        }
        Ok(wikis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;
    use rusqlite::params;
    use tempfile::tempdir;

    fn seed(dir: &Path, db_name: &str, revisions: &[(i64, i64, i64, &str, &str, i64)]) {
        let conn = Connection::open(dir.join(format!("{db_name}.sqlite"))).unwrap();
        create_schema(&conn).unwrap();
        for (rev_id, page, parent, user, ts, len) in revisions {
            conn.execute(
                "INSERT OR IGNORE INTO page (page_id, page_namespace, page_title) VALUES (?1, 0, ?2)",
                params![page, format!("Page_{page}")],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO revision (rev_id, rev_page, rev_parent_id, rev_user_text, rev_timestamp, rev_len)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![rev_id, page, parent, user, ts, len],
            )
            .unwrap();
        }
    }

    fn users(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn counts_created_and_improved_pages_in_window() {
        let tmp = tempdir().unwrap();
        seed(
            tmp.path(),
            "enwiki",
            &[
                (1, 10, 0, "Someone", "20140101000000", 100),
                (2, 10, 1, "Alice", "20150101120000", 150),
                (3, 11, 0, "Alice", "20150101130000", 500),
                (4, 11, 3, "Bob", "20150102080000", 450),
                (5, 12, 0, "Carol", "20150101130000", 80),
            ],
        );
        let replicas = SqliteReplicas::new(tmp.path());
        let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2015, 1, 2, 23, 59, 59).unwrap();
        let counts = replicas
            .page_counts("enwiki", &users(&["Alice", "Bob"]), start, end)
            .unwrap();
        assert_eq!(
            counts,
            PageCounts {
                created: 1,
                improved: 1,
                edits: 3,
                bytes: 50 + 500 - 50,
            }
        );
    }

    #[test]
    fn finds_first_edits_and_recent_editors() {
        let tmp = tempdir().unwrap();
        seed(
            tmp.path(),
            "frwiki",
            &[
                (1, 1, 0, "Alice", "20150101120000", 10),
                (2, 1, 1, "Alice", "20150301120000", 20),
                (3, 2, 0, "Bob", "20120101000000", 10),
            ],
        );
        let replicas = SqliteReplicas::new(tmp.path());
        let first = replicas
            .first_edits("frwiki", &users(&["Alice", "Bob", "Nobody"]))
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            first["Alice"],
            Utc.with_ymd_and_hms(2015, 1, 1, 12, 0, 0).unwrap()
        );

        let since = Utc.with_ymd_and_hms(2015, 2, 1, 0, 0, 0).unwrap();
        let retained = replicas
            .edited_since("frwiki", &users(&["Alice", "Bob"]), since)
            .unwrap();
        assert_eq!(retained, BTreeSet::from(["Alice".to_string()]));
    }

    #[test]
    fn common_wikis_are_those_every_participant_edited() {
        let tmp = tempdir().unwrap();
        seed(
            tmp.path(),
            "enwiki",
            &[
                (1, 1, 0, "Alice", "20150101000000", 1),
                (2, 1, 1, "Alice", "20150102000000", 2),
                (3, 1, 2, "Bob", "20150103000000", 3),
            ],
        );
        seed(
            tmp.path(),
            "eswiki",
            &[
                (1, 1, 0, "Bob", "20150101000000", 1),
                (2, 2, 0, "Alice", "20160101000000", 1),
                (3, 2, 2, "Zed", "20160102000000", 2),
            ],
        );
        seed(
            tmp.path(),
            "dewiki",
            &[
                (1, 1, 0, "Bob", "20150101000000", 1),
                (2, 1, 1, "Bob", "20150102000000", 2),
            ],
        );
        seed(tmp.path(), "itwiki", &[(1, 1, 0, "Zed", "20150101000000", 1)]);
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        let replicas = SqliteReplicas::new(tmp.path());
        let wikis = replicas.common_wikis(&users(&["Alice", "Bob"])).unwrap();
        assert_eq!(wikis, vec!["enwiki".to_string(), "eswiki".to_string()]);

        let wikis = replicas.common_wikis(&users(&["Bob", "Bob"])).unwrap();
        assert_eq!(wikis, vec!["dewiki", "enwiki", "eswiki"]);
    }

    #[test]
    fn rejects_path_like_db_names() {
        let replicas = SqliteReplicas::new("/tmp");
        assert!(replicas.replica_path("../etc/passwd").is_err());
        assert!(replicas.replica_path("").is_err());
        assert!(replicas.replica_path("en_wiki2").is_ok());
    }
}
