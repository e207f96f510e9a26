use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::models::{fit_rank, FitScore, JobKey, JobRecord};

/// Bump when adding columns; `migrate` applies the steps for older stores.
const SCHEMA_VERSION: i32 = 1;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Ok(Self { conn, path })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "prospect") {
            Ok(proj_dirs.data_dir().join("prospect.db"))
        } else {
            Ok(PathBuf::from("prospect.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            self.conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_url TEXT NOT NULL,
                    company_name TEXT NOT NULL,
                    job_title TEXT NOT NULL,
                    location TEXT NOT NULL DEFAULT '',
                    location_priority INTEGER NOT NULL DEFAULT 5,
                    job_description TEXT NOT NULL DEFAULT '',
                    company_overview TEXT NOT NULL DEFAULT '',
                    co_fetch_attempted INTEGER NOT NULL DEFAULT 0,
                    jd_crawl_attempted INTEGER NOT NULL DEFAULT 0,
                    sustainable INTEGER,
                    sustainability_keyword_matches TEXT NOT NULL DEFAULT '',
                    fit_score TEXT,
                    fit_score_rank INTEGER NOT NULL DEFAULT 0,
                    bulk_filtered INTEGER NOT NULL DEFAULT 0,
                    job_analysis TEXT NOT NULL DEFAULT '',
                    tailored_resume_ref TEXT NOT NULL DEFAULT '',
                    tailored_resume_payload TEXT NOT NULL DEFAULT '',
                    tailored_cover_letter TEXT NOT NULL DEFAULT '',
                    resume_feedback TEXT NOT NULL DEFAULT '',
                    resume_feedback_addressed INTEGER NOT NULL DEFAULT 0,
                    cl_feedback TEXT NOT NULL DEFAULT '',
                    cl_feedback_addressed INTEGER NOT NULL DEFAULT 0,
                    applied INTEGER NOT NULL DEFAULT 0,
                    bad_analysis INTEGER NOT NULL DEFAULT 0,
                    expired INTEGER NOT NULL DEFAULT 0,
                    last_expiration_check TEXT,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_url, company_name)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_company ON jobs(company_name);
                CREATE INDEX IF NOT EXISTS idx_jobs_sort ON jobs(sort_order);
                "#,
            )?;
        }
        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'prospect init' first."));
        }
        Ok(())
    }

    // --- Reads ---

    pub fn get_all(&self) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM jobs ORDER BY sort_order, id"
        ))?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to read job records")
    }

    pub fn get_by_key(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        let result = self.conn.query_row(
            &format!("SELECT {COLUMNS} FROM jobs WHERE job_url = ?1 AND company_name = ?2"),
            [&key.job_url, &key.company_name],
            Self::row_to_record,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // --- Writes ---

    /// Insert records that are not yet present; duplicates on the natural key
    /// are ignored. Returns the keys that were actually inserted.
    pub fn insert_new_records(&self, records: &[JobRecord]) -> Result<Vec<JobKey>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO jobs ({COLUMNS}) VALUES (\
                 ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            ))?;
            for record in records {
                let changed = stmt.execute(rusqlite::params![
                    record.job_url,
                    record.company_name,
                    record.job_title,
                    record.location,
                    record.location_priority,
                    record.job_description,
                    record.company_overview,
                    record.co_fetch_attempted,
                    record.jd_crawl_attempted,
                    record.sustainable,
                    record.sustainability_keyword_matches,
                    record.fit_score.map(FitScore::as_str),
                    fit_rank(record.fit_score),
                    record.bulk_filtered,
                    record.job_analysis,
                    record.tailored_resume_ref,
                    record.tailored_resume_payload,
                    record.tailored_cover_letter,
                    record.resume_feedback,
                    record.resume_feedback_addressed,
                    record.cl_feedback,
                    record.cl_feedback_addressed,
                    record.applied,
                    record.bad_analysis,
                    record.expired,
                    record.last_expiration_check.map(|t| t.to_rfc3339()),
                ])?;
                if changed > 0 {
                    inserted.push(record.key());
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Update the given fields for the record matching the natural key as a
    /// single statement, so a concurrent reader never sees a partial update.
    /// Returns the number of rows affected.
    pub fn update_by_key(&self, key: &JobKey, update: &JobUpdate) -> Result<usize> {
        let (sets, mut params) = update.to_set_clause();
        if sets.is_empty() {
            return Ok(0);
        }
        let where_url = params.len() + 1;
        let where_company = params.len() + 2;
        let sql = format!(
            "UPDATE jobs SET {}, updated_at = datetime('now') \
             WHERE job_url = ?{where_url} AND company_name = ?{where_company}",
            sets.join(", "),
        );
        params.push(Box::new(key.job_url.clone()));
        params.push(Box::new(key.company_name.clone()));
        let affected = self.conn.execute(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        )?;
        Ok(affected)
    }

    /// Apply many keyed updates in one transaction.
    pub fn bulk_update_by_key(&self, updates: &[(JobKey, JobUpdate)]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut affected = 0;
        for (key, update) in updates {
            affected += self.update_by_key(key, update)?;
        }
        tx.commit()?;
        Ok(affected)
    }

    /// Rewrite the persisted ordering: best fit first, then preferred
    /// locations. Runs once per cycle so readers see records in review order.
    pub fn sort_by_priority(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs ORDER BY fit_score_rank DESC, location_priority ASC, id ASC",
            )?;
            let ids: Vec<i64> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut update = tx.prepare("UPDATE jobs SET sort_order = ?1 WHERE id = ?2")?;
            for (position, id) in ids.iter().enumerate() {
                update.execute(rusqlite::params![position as i64, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let fit_text: Option<String> = row.get(11)?;
        let fit_score = fit_text.as_deref().and_then(FitScore::parse);
        let expiration_text: Option<String> = row.get(25)?;
        let last_expiration_check = expiration_text
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(JobRecord {
            job_url: row.get(0)?,
            company_name: row.get(1)?,
            job_title: row.get(2)?,
            location: row.get(3)?,
            location_priority: row.get(4)?,
            job_description: row.get(5)?,
            company_overview: row.get(6)?,
            co_fetch_attempted: row.get(7)?,
            jd_crawl_attempted: row.get(8)?,
            sustainable: row.get(9)?,
            sustainability_keyword_matches: row.get(10)?,
            fit_score,
            fit_score_rank: row.get(12)?,
            bulk_filtered: row.get(13)?,
            job_analysis: row.get(14)?,
            tailored_resume_ref: row.get(15)?,
            tailored_resume_payload: row.get(16)?,
            tailored_cover_letter: row.get(17)?,
            resume_feedback: row.get(18)?,
            resume_feedback_addressed: row.get(19)?,
            cl_feedback: row.get(20)?,
            cl_feedback_addressed: row.get(21)?,
            applied: row.get(22)?,
            bad_analysis: row.get(23)?,
            expired: row.get(24)?,
            last_expiration_check,
        })
    }
}

const COLUMNS: &str = "job_url, company_name, job_title, location, location_priority, \
    job_description, company_overview, co_fetch_attempted, jd_crawl_attempted, \
    sustainable, sustainability_keyword_matches, fit_score, fit_score_rank, \
    bulk_filtered, job_analysis, tailored_resume_ref, tailored_resume_payload, \
    tailored_cover_letter, resume_feedback, resume_feedback_addressed, cl_feedback, \
    cl_feedback_addressed, applied, bad_analysis, expired, last_expiration_check";

/// A partial update of a job record. Unset fields are left untouched; setting
/// `fit_score` also writes the matching `fit_score_rank` so the two can never
/// drift apart.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub location: Option<String>,
    pub location_priority: Option<i64>,
    pub job_description: Option<String>,
    pub company_overview: Option<String>,
    pub co_fetch_attempted: Option<bool>,
    pub jd_crawl_attempted: Option<bool>,
    pub sustainable: Option<bool>,
    pub sustainability_keyword_matches: Option<String>,
    pub fit_score: Option<FitScore>,
    pub bulk_filtered: Option<bool>,
    pub job_analysis: Option<String>,
    pub tailored_resume_ref: Option<String>,
    pub tailored_resume_payload: Option<String>,
    pub tailored_cover_letter: Option<String>,
    pub resume_feedback_addressed: Option<bool>,
    pub cl_feedback_addressed: Option<bool>,
    pub bad_analysis: Option<bool>,
    pub expired: Option<bool>,
    pub last_expiration_check: Option<DateTime<Utc>>,
}

impl JobUpdate {
    fn to_set_clause(&self) -> (Vec<String>, Vec<Box<dyn ToSql>>) {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        fn push(sets: &mut Vec<String>, params: &mut Vec<Box<dyn ToSql>>, column: &str, value: Box<dyn ToSql>) {
            params.push(value);
            sets.push(format!("{column} = ?{}", params.len()));
        }

        if let Some(v) = &self.location {
            push(&mut sets, &mut params, "location", Box::new(v.clone()));
        }
        if let Some(v) = self.location_priority {
            push(&mut sets, &mut params, "location_priority", Box::new(v));
        }
        if let Some(v) = &self.job_description {
            push(&mut sets, &mut params, "job_description", Box::new(v.clone()));
        }
        if let Some(v) = &self.company_overview {
            push(&mut sets, &mut params, "company_overview", Box::new(v.clone()));
        }
        if let Some(v) = self.co_fetch_attempted {
            push(&mut sets, &mut params, "co_fetch_attempted", Box::new(v));
        }
        if let Some(v) = self.jd_crawl_attempted {
            push(&mut sets, &mut params, "jd_crawl_attempted", Box::new(v));
        }
        if let Some(v) = self.sustainable {
            push(&mut sets, &mut params, "sustainable", Box::new(v));
        }
        if let Some(v) = &self.sustainability_keyword_matches {
            push(
                &mut sets,
                &mut params,
                "sustainability_keyword_matches",
                Box::new(v.clone()),
            );
        }
        if let Some(score) = self.fit_score {
            push(&mut sets, &mut params, "fit_score", Box::new(score.as_str()));
            push(&mut sets, &mut params, "fit_score_rank", Box::new(score.rank()));
        }
        if let Some(v) = self.bulk_filtered {
            push(&mut sets, &mut params, "bulk_filtered", Box::new(v));
        }
        if let Some(v) = &self.job_analysis {
            push(&mut sets, &mut params, "job_analysis", Box::new(v.clone()));
        }
        if let Some(v) = &self.tailored_resume_ref {
            push(&mut sets, &mut params, "tailored_resume_ref", Box::new(v.clone()));
        }
        if let Some(v) = &self.tailored_resume_payload {
            push(
                &mut sets,
                &mut params,
                "tailored_resume_payload",
                Box::new(v.clone()),
            );
        }
        if let Some(v) = &self.tailored_cover_letter {
            push(
                &mut sets,
                &mut params,
                "tailored_cover_letter",
                Box::new(v.clone()),
            );
        }
        if let Some(v) = self.resume_feedback_addressed {
            push(&mut sets, &mut params, "resume_feedback_addressed", Box::new(v));
        }
        if let Some(v) = self.cl_feedback_addressed {
            push(&mut sets, &mut params, "cl_feedback_addressed", Box::new(v));
        }
        if let Some(v) = self.bad_analysis {
            push(&mut sets, &mut params, "bad_analysis", Box::new(v));
        }
        if let Some(v) = self.expired {
            push(&mut sets, &mut params, "expired", Box::new(v));
        }
        if let Some(v) = self.last_expiration_check {
            push(
                &mut sets,
                &mut params,
                "last_expiration_check",
                Box::new(v.to_rfc3339()),
            );
        }

        (sets, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, company: &str, title: &str) -> JobRecord {
        JobRecord::new_collected(url, company, title, "Berlin, Germany", 1, "")
    }

    #[test]
    fn test_insert_ignores_duplicate_natural_key() {
        let db = Database::open_in_memory().unwrap();
        let records = vec![record("u1", "Acme", "Engineer"), record("u2", "Acme", "Analyst")];

        let first = db.insert_new_records(&records).unwrap();
        assert_eq!(first.len(), 2);

        let second = db.insert_new_records(&records).unwrap();
        assert!(second.is_empty());
        assert_eq!(db.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_update_by_key_sets_rank_with_score() {
        let db = Database::open_in_memory().unwrap();
        db.insert_new_records(&[record("u1", "Acme", "Engineer")]).unwrap();

        let key = JobKey::new("u1", "Acme");
        let affected = db
            .update_by_key(
                &key,
                &JobUpdate {
                    fit_score: Some(FitScore::GoodFit),
                    job_analysis: Some("looks promising".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(affected, 1);

        let stored = db.get_by_key(&key).unwrap().unwrap();
        assert_eq!(stored.fit_score, Some(FitScore::GoodFit));
        assert_eq!(stored.fit_score_rank, FitScore::GoodFit.rank());
        assert_eq!(stored.job_analysis, "looks promising");
    }

    #[test]
    fn test_update_unknown_key_affects_no_rows() {
        let db = Database::open_in_memory().unwrap();
        let affected = db
            .update_by_key(
                &JobKey::new("missing", "Nobody"),
                &JobUpdate {
                    bulk_filtered: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn test_empty_update_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        db.insert_new_records(&[record("u1", "Acme", "Engineer")]).unwrap();
        let affected = db
            .update_by_key(&JobKey::new("u1", "Acme"), &JobUpdate::default())
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn test_sort_orders_by_fit_then_location() {
        let db = Database::open_in_memory().unwrap();
        let mut a = record("u1", "Acme", "Engineer");
        a.location_priority = 3;
        let mut b = record("u2", "Beta", "Engineer");
        b.location_priority = 1;
        let mut c = record("u3", "Gamma", "Engineer");
        c.location_priority = 2;
        db.insert_new_records(&[a, b, c]).unwrap();

        db.update_by_key(
            &JobKey::new("u3", "Gamma"),
            &JobUpdate {
                fit_score: Some(FitScore::VeryGoodFit),
                ..Default::default()
            },
        )
        .unwrap();
        db.sort_by_priority().unwrap();

        let urls: Vec<String> = db
            .get_all()
            .unwrap()
            .into_iter()
            .map(|r| r.job_url)
            .collect();
        // Best fit first, then lower location priority.
        assert_eq!(urls, vec!["u3", "u2", "u1"]);
    }

    #[test]
    fn test_bulk_update_applies_all() {
        let db = Database::open_in_memory().unwrap();
        db.insert_new_records(&[record("u1", "Acme", "Engineer"), record("u2", "Beta", "Analyst")])
            .unwrap();

        let updates = vec![
            (
                JobKey::new("u1", "Acme"),
                JobUpdate {
                    bulk_filtered: Some(true),
                    ..Default::default()
                },
            ),
            (
                JobKey::new("u2", "Beta"),
                JobUpdate {
                    sustainable: Some(false),
                    ..Default::default()
                },
            ),
        ];
        assert_eq!(db.bulk_update_by_key(&updates).unwrap(), 2);

        let all = db.get_all().unwrap();
        assert!(all.iter().any(|r| r.job_url == "u1" && r.bulk_filtered));
        assert!(all
            .iter()
            .any(|r| r.job_url == "u2" && r.sustainable == Some(false)));
    }
}
