// 🗄️ Persistence - SQLite + WAL
//
// Every write is an idempotent upsert keyed by the uniqueness invariants:
//   identities     (namespace, external_id)
//   athlete_points (athlete_key, list_key)
//   races          (race_id)
//   race_results   (athlete_key, race_key)
// Row content is compared through a SHA-256 content hash, so re-ingesting
// identical data is a no-op.

use crate::error::Result;
use crate::models::{
    Athlete, AthleteAttrs, AthletePointsRecord, CourseDetails, Discipline, DisciplineScore,
    Gender, PointsListRef, Race, RaceResult, UpsertOutcome,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Persistence collaborator used by the ingestion core.
///
/// Each call is atomic on its own; `atomic` groups all writes of one item
/// (one list or one race) into a single commit.
pub trait Store {
    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
    fn atomic<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
        Self: Sized;

    fn lookup_identity(&self, namespace: &str, external_id: &str) -> Result<Option<String>>;
    fn insert_identity(&self, namespace: &str, external_id: &str, key: &str) -> Result<()>;

    fn get_athlete(&self, key: &str) -> Result<Option<Athlete>>;
    fn upsert_athlete(&self, athlete: &Athlete) -> Result<UpsertOutcome>;

    fn points_list_exists(&self, list: &PointsListRef) -> Result<bool>;
    fn upsert_points_list(&self, key: &str, list: &PointsListRef) -> Result<UpsertOutcome>;
    fn upsert_athlete_points(&self, record: &AthletePointsRecord) -> Result<UpsertOutcome>;

    fn upsert_race(&self, race: &Race) -> Result<UpsertOutcome>;
    /// Record the categories a race was observed under (multi-valued, set semantics)
    fn add_race_categories(&self, race_key: &str, categories: &[String]) -> Result<()>;
    fn upsert_race_result(&self, result: &RaceResult) -> Result<UpsertOutcome>;
    /// Remove result rows for athletes not in `keep`; returns rows deleted
    fn prune_race_results(&self, race_key: &str, keep: &[String]) -> Result<usize>;

    fn insert_event(&self, event: &Event) -> Result<()>;
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for audit trail: one per ingested list or scraped race
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery; in-memory databases keep "memory"
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS identities (
            namespace TEXT NOT NULL,
            external_id TEXT NOT NULL,
            internal_key TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (namespace, external_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS athletes (
            athlete_key TEXT PRIMARY KEY,
            competitor_id TEXT UNIQUE NOT NULL,
            fis_code TEXT,
            name TEXT NOT NULL,
            nation_code TEXT,
            gender TEXT,
            birth_year INTEGER,
            birth_date TEXT,
            ski_club TEXT,
            national_code TEXT,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS points_lists (
            list_key TEXT PRIMARY KEY,
            external_id TEXT UNIQUE NOT NULL,
            sector TEXT NOT NULL,
            season TEXT NOT NULL,
            list_id TEXT NOT NULL,
            name TEXT NOT NULL,
            valid_from TEXT,
            valid_to TEXT,
            ingested_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let discipline_columns: String = Discipline::ALL
        .iter()
        .map(|d| {
            let c = d.code().to_lowercase();
            format!("{c}_points REAL, {c}_rank INTEGER, {c}_status TEXT,")
        })
        .collect::<Vec<_>>()
        .join("\n            ");

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS athlete_points (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            athlete_key TEXT NOT NULL REFERENCES athletes(athlete_key),
            list_key TEXT NOT NULL REFERENCES points_lists(list_key),
            calculation_date TEXT,
            ski_club TEXT,
            {discipline_columns}
            content_hash TEXT NOT NULL,
            UNIQUE (athlete_key, list_key)
        )"
        ),
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS races (
            race_key TEXT PRIMARY KEY,
            race_id TEXT UNIQUE NOT NULL,
            codex TEXT,
            race_date TEXT NOT NULL,
            discipline TEXT NOT NULL,
            gender TEXT,
            category TEXT,
            name TEXT,
            location TEXT,
            nation TEXT,
            win_time REAL,
            penalty REAL,
            total_starters INTEGER,
            total_finishers INTEGER,
            has_results INTEGER NOT NULL,
            start_altitude INTEGER,
            finish_altitude INTEGER,
            length INTEGER,
            homologation TEXT,
            gates1 INTEGER,
            turning_gates1 INTEGER,
            gates2 INTEGER,
            turning_gates2 INTEGER,
            content_hash TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS race_categories (
            race_key TEXT NOT NULL REFERENCES races(race_key),
            category TEXT NOT NULL,
            PRIMARY KEY (race_key, category)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS race_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            athlete_key TEXT NOT NULL REFERENCES athletes(athlete_key),
            race_key TEXT NOT NULL REFERENCES races(race_key),
            rank INTEGER,
            status TEXT,
            run1_time REAL,
            run2_time REAL,
            racer_time REAL,
            points REAL,
            race_points REAL,
            penalty REAL,
            win_time REAL,
            content_hash TEXT NOT NULL,
            UNIQUE (athlete_key, race_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_identities_key ON identities(internal_key)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_races_date ON races(race_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_race_results_race ON race_results(race_key)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Row count of one of the pipeline's tables
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        const TABLES: [&str; 8] = [
            "identities",
            "athletes",
            "points_lists",
            "athlete_points",
            "races",
            "race_categories",
            "race_results",
            "events",
        ];
        if !TABLES.contains(&table) {
            return Err(rusqlite::Error::InvalidParameterName(table.to_string()).into());
        }
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn get_athlete_points(
        &self,
        athlete_key: &str,
        list_key: &str,
    ) -> Result<Option<AthletePointsRecord>> {
        let sql = format!(
            "SELECT athlete_key, list_key, calculation_date, ski_club, {}
             FROM athlete_points WHERE athlete_key = ?1 AND list_key = ?2",
            discipline_column_names().join(", ")
        );
        let record = self
            .conn
            .query_row(&sql, params![athlete_key, list_key], |row| {
                let mut scores = [DisciplineScore::default(); 5];
                for (i, score) in scores.iter_mut().enumerate() {
                    let base = 4 + i * 3;
                    let status: Option<String> = row.get(base + 2)?;
                    *score = DisciplineScore {
                        points: row.get(base)?,
                        rank: row.get(base + 1)?,
                        status: status.and_then(|s| s.chars().next()),
                    };
                }
                let calculation_date: Option<String> = row.get(2)?;
                Ok(AthletePointsRecord {
                    athlete_key: row.get(0)?,
                    list_key: row.get(1)?,
                    calculation_date: date_from_sql(calculation_date),
                    ski_club: row.get(3)?,
                    scores,
                })
            })
            .optional()?;
        Ok(record)
    }

    pub fn get_race_by_external_id(&self, race_id: &str) -> Result<Option<Race>> {
        let race = self
            .conn
            .query_row(
                "SELECT race_key, race_id, codex, race_date, discipline, gender, category,
                        name, location, nation, win_time, penalty, total_starters,
                        total_finishers, has_results, start_altitude, finish_altitude,
                        length, homologation, gates1, turning_gates1, gates2, turning_gates2
                 FROM races WHERE race_id = ?1",
                [race_id],
                race_from_row,
            )
            .optional()?;
        Ok(race)
    }

    pub fn get_race_results(&self, race_key: &str) -> Result<Vec<RaceResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT athlete_key, race_key, rank, status, run1_time, run2_time, racer_time,
                    points, race_points, penalty, win_time
             FROM race_results
             WHERE race_key = ?1
             ORDER BY rank IS NULL, rank, athlete_key",
        )?;

        let results = stmt
            .query_map([race_key], race_result_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(results)
    }

    pub fn get_race_categories(&self, race_key: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT category FROM race_categories WHERE race_key = ?1 ORDER BY category",
        )?;
        let categories = stmt
            .query_map([race_key], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(categories)
    }
}

impl Store for SqliteStore {
    fn atomic<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        match f(self) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            // Dropping the transaction rolls it back
            Err(e) => Err(e),
        }
    }

    fn lookup_identity(&self, namespace: &str, external_id: &str) -> Result<Option<String>> {
        let key = self
            .conn
            .query_row(
                "SELECT internal_key FROM identities WHERE namespace = ?1 AND external_id = ?2",
                params![namespace, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    fn insert_identity(&self, namespace: &str, external_id: &str, key: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO identities (namespace, external_id, internal_key)
             VALUES (?1, ?2, ?3)",
            params![namespace, external_id, key],
        )?;
        Ok(())
    }

    fn get_athlete(&self, key: &str) -> Result<Option<Athlete>> {
        let athlete = self
            .conn
            .query_row(
                "SELECT athlete_key, competitor_id, fis_code, name, nation_code, gender,
                        birth_year, birth_date, ski_club, national_code
                 FROM athletes WHERE athlete_key = ?1",
                [key],
                |row| {
                    let gender: Option<String> = row.get(5)?;
                    let birth_date: Option<String> = row.get(7)?;
                    Ok(Athlete {
                        key: row.get(0)?,
                        attrs: AthleteAttrs {
                            competitor_id: row.get(1)?,
                            fis_code: row.get(2)?,
                            name: row.get(3)?,
                            nation_code: row.get(4)?,
                            gender: gender.as_deref().and_then(Gender::from_code),
                            birth_year: row.get(6)?,
                            birth_date: date_from_sql(birth_date),
                            ski_club: row.get(8)?,
                            national_code: row.get(9)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(athlete)
    }

    fn upsert_athlete(&self, athlete: &Athlete) -> Result<UpsertOutcome> {
        let existing = self.get_athlete(&athlete.key)?;
        if existing.as_ref() == Some(athlete) {
            return Ok(UpsertOutcome::Unchanged);
        }

        let a = &athlete.attrs;
        self.conn.execute(
            "INSERT INTO athletes (
                athlete_key, competitor_id, fis_code, name, nation_code, gender,
                birth_year, birth_date, ski_club, national_code
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(athlete_key) DO UPDATE SET
                fis_code = excluded.fis_code,
                name = excluded.name,
                nation_code = excluded.nation_code,
                gender = excluded.gender,
                birth_year = excluded.birth_year,
                birth_date = excluded.birth_date,
                ski_club = excluded.ski_club,
                national_code = excluded.national_code,
                updated_at = CURRENT_TIMESTAMP",
            params![
                athlete.key,
                a.competitor_id,
                a.fis_code,
                a.name,
                a.nation_code,
                a.gender.map(|g| g.code()),
                a.birth_year,
                date_to_sql(a.birth_date),
                a.ski_club,
                a.national_code,
            ],
        )?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn points_list_exists(&self, list: &PointsListRef) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM points_lists WHERE external_id = ?1",
                [list.external_id()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn upsert_points_list(&self, key: &str, list: &PointsListRef) -> Result<UpsertOutcome> {
        let existing: Option<(String, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT name, valid_from, valid_to FROM points_lists WHERE list_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let incoming = (
            list.name.clone(),
            date_to_sql(list.valid_from),
            date_to_sql(list.valid_to),
        );
        if existing.as_ref() == Some(&incoming) {
            return Ok(UpsertOutcome::Unchanged);
        }

        self.conn.execute(
            "INSERT INTO points_lists (
                list_key, external_id, sector, season, list_id, name, valid_from, valid_to
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(list_key) DO UPDATE SET
                name = excluded.name,
                valid_from = excluded.valid_from,
                valid_to = excluded.valid_to",
            params![
                key,
                list.external_id(),
                list.sector,
                list.season,
                list.list_id,
                incoming.0,
                incoming.1,
                incoming.2,
            ],
        )?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn upsert_athlete_points(&self, record: &AthletePointsRecord) -> Result<UpsertOutcome> {
        let hash = record.content_hash();
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT content_hash FROM athlete_points WHERE athlete_key = ?1 AND list_key = ?2",
                params![record.athlete_key, record.list_key],
                |row| row.get(0),
            )
            .optional()?;

        if existing.as_deref() == Some(hash.as_str()) {
            return Ok(UpsertOutcome::Unchanged);
        }

        let score_columns = discipline_column_names();
        let mut values: Vec<Value> = vec![
            Value::Text(record.athlete_key.clone()),
            Value::Text(record.list_key.clone()),
            opt_text(date_to_sql(record.calculation_date)),
            opt_text(record.ski_club.clone()),
        ];
        for score in &record.scores {
            values.push(score.points.map(Value::Real).unwrap_or(Value::Null));
            values.push(
                score
                    .rank
                    .map(|r| Value::Integer(i64::from(r)))
                    .unwrap_or(Value::Null),
            );
            values.push(opt_text(score.status.map(|c| c.to_string())));
        }
        values.push(Value::Text(hash));

        let columns = [
            vec!["athlete_key", "list_key", "calculation_date", "ski_club"],
            score_columns.iter().map(String::as_str).collect(),
            vec!["content_hash"],
        ]
        .concat();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let updates: Vec<String> = columns[2..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        let sql = format!(
            "INSERT INTO athlete_points ({}) VALUES ({})
             ON CONFLICT(athlete_key, list_key) DO UPDATE SET {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(values))?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn upsert_race(&self, race: &Race) -> Result<UpsertOutcome> {
        let existing: Option<(String, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT race_key, category, content_hash FROM races WHERE race_id = ?1",
                [&race.race_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        // Canonical category: whatever the first ingestion stored
        let mut merged = race.clone();
        if let Some((key, category, _)) = &existing {
            merged.key = key.clone();
            if category.is_some() {
                merged.category = category.clone();
            }
        }
        let hash = merged.content_hash();

        if let Some((_, _, stored_hash)) = &existing {
            if *stored_hash == hash {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let r = &merged;
        self.conn.execute(
            "INSERT INTO races (
                race_key, race_id, codex, race_date, discipline, gender, category, name,
                location, nation, win_time, penalty, total_starters, total_finishers,
                has_results, start_altitude, finish_altitude, length, homologation,
                gates1, turning_gates1, gates2, turning_gates2, content_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            ON CONFLICT(race_id) DO UPDATE SET
                codex = excluded.codex,
                race_date = excluded.race_date,
                discipline = excluded.discipline,
                gender = excluded.gender,
                category = COALESCE(races.category, excluded.category),
                name = excluded.name,
                location = excluded.location,
                nation = excluded.nation,
                win_time = excluded.win_time,
                penalty = excluded.penalty,
                total_starters = excluded.total_starters,
                total_finishers = excluded.total_finishers,
                has_results = excluded.has_results,
                start_altitude = excluded.start_altitude,
                finish_altitude = excluded.finish_altitude,
                length = excluded.length,
                homologation = excluded.homologation,
                gates1 = excluded.gates1,
                turning_gates1 = excluded.turning_gates1,
                gates2 = excluded.gates2,
                turning_gates2 = excluded.turning_gates2,
                content_hash = excluded.content_hash",
            params![
                r.key,
                r.race_id,
                r.codex,
                r.date.format("%Y-%m-%d").to_string(),
                r.discipline.code(),
                r.gender.map(|g| g.code()),
                r.category,
                r.name,
                r.location,
                r.nation,
                r.win_time,
                r.penalty,
                r.total_starters,
                r.total_finishers,
                r.has_results,
                r.course.start_altitude,
                r.course.finish_altitude,
                r.course.length,
                r.course.homologation,
                r.course.gates1,
                r.course.turning_gates1,
                r.course.gates2,
                r.course.turning_gates2,
                hash,
            ],
        )?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn add_race_categories(&self, race_key: &str, categories: &[String]) -> Result<()> {
        for category in categories {
            self.conn.execute(
                "INSERT OR IGNORE INTO race_categories (race_key, category) VALUES (?1, ?2)",
                params![race_key, category],
            )?;
        }
        Ok(())
    }

    fn upsert_race_result(&self, result: &RaceResult) -> Result<UpsertOutcome> {
        let hash = result.content_hash();
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT content_hash FROM race_results WHERE athlete_key = ?1 AND race_key = ?2",
                params![result.athlete_key, result.race_key],
                |row| row.get(0),
            )
            .optional()?;

        if existing.as_deref() == Some(hash.as_str()) {
            return Ok(UpsertOutcome::Unchanged);
        }

        self.conn.execute(
            "INSERT INTO race_results (
                athlete_key, race_key, rank, status, run1_time, run2_time, racer_time,
                points, race_points, penalty, win_time, content_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(athlete_key, race_key) DO UPDATE SET
                rank = excluded.rank,
                status = excluded.status,
                run1_time = excluded.run1_time,
                run2_time = excluded.run2_time,
                racer_time = excluded.racer_time,
                points = excluded.points,
                race_points = excluded.race_points,
                penalty = excluded.penalty,
                win_time = excluded.win_time,
                content_hash = excluded.content_hash",
            params![
                result.athlete_key,
                result.race_key,
                result.rank,
                result.status,
                result.run1_time,
                result.run2_time,
                result.racer_time,
                result.points,
                result.race_points,
                result.penalty,
                result.win_time,
                hash,
            ],
        )?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn prune_race_results(&self, race_key: &str, keep: &[String]) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("SELECT athlete_key FROM race_results WHERE race_key = ?1")?;
        let stored = stmt
            .query_map([race_key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut deleted = 0;
        for athlete_key in stored.iter().filter(|k| !keep.contains(k)) {
            deleted += self.conn.execute(
                "DELETE FROM race_results WHERE race_key = ?1 AND athlete_key = ?2",
                params![race_key, athlete_key],
            )?;
        }
        Ok(deleted)
    }

    fn insert_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        self.conn.execute(
            "INSERT INTO events (
                event_id, timestamp, event_type, entity_type, entity_id, data, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.entity_type,
                event.entity_id,
                data_json,
                event.actor,
            ],
        )?;

        Ok(())
    }
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn discipline_column_names() -> Vec<String> {
    Discipline::ALL
        .iter()
        .flat_map(|d| {
            let c = d.code().to_lowercase();
            [
                format!("{c}_points"),
                format!("{c}_rank"),
                format!("{c}_status"),
            ]
        })
        .collect()
}

fn date_to_sql(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn date_from_sql(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn opt_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

fn race_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Race> {
    let date: String = row.get(3)?;
    let discipline: String = row.get(4)?;
    let gender: Option<String> = row.get(5)?;

    Ok(Race {
        key: row.get(0)?,
        race_id: row.get(1)?,
        codex: row.get(2)?,
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        discipline: Discipline::parse(&discipline).ok_or(rusqlite::Error::InvalidQuery)?,
        gender: gender.as_deref().and_then(Gender::from_code),
        category: row.get(6)?,
        name: row.get(7)?,
        location: row.get(8)?,
        nation: row.get(9)?,
        win_time: row.get(10)?,
        penalty: row.get(11)?,
        total_starters: row.get(12)?,
        total_finishers: row.get(13)?,
        has_results: row.get(14)?,
        course: CourseDetails {
            start_altitude: row.get(15)?,
            finish_altitude: row.get(16)?,
            length: row.get(17)?,
            homologation: row.get(18)?,
            gates1: row.get(19)?,
            turning_gates1: row.get(20)?,
            gates2: row.get(21)?,
            turning_gates2: row.get(22)?,
        },
    })
}

fn race_result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RaceResult> {
    Ok(RaceResult {
        athlete_key: row.get(0)?,
        race_key: row.get(1)?,
        rank: row.get(2)?,
        status: row.get(3)?,
        run1_time: row.get(4)?,
        run2_time: row.get(5)?,
        racer_time: row.get(6)?,
        points: row.get(7)?,
        race_points: row.get(8)?,
        penalty: row.get(9)?,
        win_time: row.get(10)?,
    })
}
