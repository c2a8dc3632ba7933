// 🏔️ Domain model - athletes, points lists, races
//
// Keys are internal durable identifiers handed out by the identity resolver.
// External ids (competitor id, list id, race id) are only join keys.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// DISCIPLINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Discipline {
    Downhill,
    Slalom,
    GiantSlalom,
    SuperG,
    AlpineCombined,
}

impl Discipline {
    /// Column order of the published points lists
    pub const ALL: [Discipline; 5] = [
        Discipline::Downhill,
        Discipline::Slalom,
        Discipline::GiantSlalom,
        Discipline::SuperG,
        Discipline::AlpineCombined,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Discipline::Downhill => "DH",
            Discipline::Slalom => "SL",
            Discipline::GiantSlalom => "GS",
            Discipline::SuperG => "SG",
            Discipline::AlpineCombined => "AC",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Discipline::Downhill => "Downhill",
            Discipline::Slalom => "Slalom",
            Discipline::GiantSlalom => "Giant Slalom",
            Discipline::SuperG => "Super-G",
            Discipline::AlpineCombined => "Alpine Combined",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Discipline::Downhill => 0,
            Discipline::Slalom => 1,
            Discipline::GiantSlalom => 2,
            Discipline::SuperG => 3,
            Discipline::AlpineCombined => 4,
        }
    }

    /// Race points factor (F-value) used to turn a time gap into points
    pub fn f_value(&self) -> f64 {
        match self {
            Discipline::Downhill => 1250.0,
            Discipline::Slalom => 730.0,
            Discipline::GiantSlalom => 1010.0,
            Discipline::SuperG => 1190.0,
            Discipline::AlpineCombined => 1360.0,
        }
    }

    /// Accepts codes ("GS") and published labels ("Giant Slalom", "Downhill Training").
    pub fn parse(label: &str) -> Option<Discipline> {
        let upper = label.trim().to_uppercase();
        let base = upper.strip_suffix(" TRAINING").unwrap_or(&upper).trim();

        match base {
            "DH" | "DOWNHILL" => Some(Discipline::Downhill),
            "SL" | "SLALOM" => Some(Discipline::Slalom),
            "GS" | "GIANT SLALOM" => Some(Discipline::GiantSlalom),
            "SG" | "SUPER-G" | "SUPER G" => Some(Discipline::SuperG),
            "AC" | "ALPINE COMBINED" | "COMBINED" => Some(Discipline::AlpineCombined),
            _ => None,
        }
    }
}

// ============================================================================
// GENDER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn code(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
        }
    }

    pub fn from_code(code: &str) -> Option<Gender> {
        match code.trim() {
            "M" | "m" => Some(Gender::Male),
            "F" | "f" | "W" | "w" => Some(Gender::Female),
            _ => None,
        }
    }

    /// "Men's" / "Women's" as printed on race headers
    pub fn from_label(label: &str) -> Option<Gender> {
        let lower = label.to_lowercase();
        if lower.contains("women") || lower.contains("ladies") {
            Some(Gender::Female)
        } else if lower.contains("men") {
            Some(Gender::Male)
        } else {
            None
        }
    }
}

// ============================================================================
// ATHLETE
// ============================================================================

/// Athlete attributes as published upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AthleteAttrs {
    /// Durable external reference (competitor id)
    pub competitor_id: String,
    pub fis_code: Option<String>,
    pub name: String,
    pub nation_code: Option<String>,
    pub gender: Option<Gender>,
    pub birth_year: Option<i32>,
    pub birth_date: Option<NaiveDate>,
    pub ski_club: Option<String>,
    pub national_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Athlete {
    pub key: String,
    pub attrs: AthleteAttrs,
}

// ============================================================================
// POINTS LIST
// ============================================================================

/// One published ranking snapshot, as listed in the catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsListRef {
    pub sector: String,
    pub season: String,
    /// Empty for a season's base list
    pub list_id: String,
    pub name: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

impl PointsListRef {
    /// Cache key, e.g. `FAL_2025413`
    pub fn cache_key(&self) -> String {
        format!("F{}_{}{}", self.sector, self.season, self.list_id)
    }

    /// Identifier used for identity resolution and reporting
    pub fn external_id(&self) -> String {
        if self.list_id.is_empty() {
            format!("{}-{}-base", self.sector, self.season)
        } else {
            self.list_id.clone()
        }
    }

    pub fn is_base_list(&self) -> bool {
        self.valid_from.is_none() || self.valid_to.is_none()
    }

    /// True when the list is valid on any day of `[start, end]`
    pub fn overlaps(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
        let (Some(from), Some(to)) = (self.valid_from, self.valid_to) else {
            return false;
        };
        if let Some(start) = start {
            if to < start {
                return false;
            }
        }
        if let Some(end) = end {
            if from > end {
                return false;
            }
        }
        true
    }
}

/// Points, world rank and status code for one discipline
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DisciplineScore {
    pub points: Option<f64>,
    pub rank: Option<u32>,
    /// Opaque single-character status code, stored verbatim
    pub status: Option<char>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthletePointsRecord {
    pub athlete_key: String,
    pub list_key: String,
    pub calculation_date: Option<NaiveDate>,
    pub ski_club: Option<String>,
    /// Indexed by `Discipline::index()`
    pub scores: [DisciplineScore; 5],
}

impl AthletePointsRecord {
    pub fn score(&self, discipline: Discipline) -> &DisciplineScore {
        &self.scores[discipline.index()]
    }

    pub fn content_hash(&self) -> String {
        content_hash(self)
    }
}

// ============================================================================
// RACE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseDetails {
    pub start_altitude: Option<i32>,
    pub finish_altitude: Option<i32>,
    pub length: Option<i32>,
    pub homologation: Option<String>,
    /// Gates and turning gates for run 1 (the only run in speed events) and run 2
    pub gates1: Option<i32>,
    pub turning_gates1: Option<i32>,
    pub gates2: Option<i32>,
    pub turning_gates2: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub key: String,
    /// External race identifier, globally unique
    pub race_id: String,
    pub codex: Option<String>,
    pub date: NaiveDate,
    pub discipline: Discipline,
    pub gender: Option<Gender>,
    /// Canonical category; first ingestion wins on later upserts
    pub category: Option<String>,
    pub name: Option<String>,
    pub location: Option<String>,
    pub nation: Option<String>,
    pub win_time: Option<f64>,
    pub penalty: Option<f64>,
    pub total_starters: Option<u32>,
    pub total_finishers: Option<u32>,
    /// False for cancelled / empty result pages
    pub has_results: bool,
    pub course: CourseDetails,
}

impl Race {
    pub fn content_hash(&self) -> String {
        content_hash(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceResult {
    pub athlete_key: String,
    pub race_key: String,
    pub rank: Option<u32>,
    /// DNF1, DSQ2, ... for non-finishers
    pub status: Option<String>,
    pub run1_time: Option<f64>,
    pub run2_time: Option<f64>,
    pub racer_time: Option<f64>,
    /// Points as published on the result page
    pub points: Option<f64>,
    /// Points for the finishing position, computed from the time gap
    pub race_points: Option<f64>,
    pub penalty: Option<f64>,
    pub win_time: Option<f64>,
}

impl RaceResult {
    pub fn content_hash(&self) -> String {
        content_hash(self)
    }
}

// ============================================================================
// UPSERT OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

fn content_hash<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    // Serializing plain data structs cannot fail
    hasher.update(serde_json::to_vec(value).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}
