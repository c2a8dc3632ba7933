// 🏗️ Points List Parser
//
// Turns one CSV snapshot into per-athlete records. Parsing is a pure function
// of the bytes: it can be re-run from the cached artifact at any time.
//
// Row-level problems (wrong field count, unparsable number) are yielded as
// `Err(ParseError)` items and do not stop the iterator. Only a document that
// cannot be read at all is rejected up front.

use crate::error::ParseError;
use crate::models::{AthleteAttrs, Discipline, DisciplineScore, Gender};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use std::collections::HashMap;

/// Columns every list must carry
const REQUIRED_COLUMNS: [&str; 1] = ["Competitorid"];

/// One parsed athlete row
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// 1-based line in the source
    pub line: u64,
    pub athlete: AthleteAttrs,
    pub calculation_date: Option<NaiveDate>,
    /// Indexed by `Discipline::index()`
    pub scores: [DisciplineScore; 5],
}

/// Lazy iterator over the rows of one points list
pub struct PointsListRows<'a> {
    records: StringRecordsIntoIter<&'a [u8]>,
    columns: HashMap<String, usize>,
    width: usize,
}

/// Validate the document header and return a row iterator.
pub fn parse_points_list(bytes: &[u8]) -> Result<PointsListRows<'_>, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::document(format!("not valid UTF-8: {}", e)))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(ParseError::document("empty document"));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::document(format!("unreadable header: {}", e)))?
        .clone();

    let columns: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_string(), i))
        .collect();

    for required in REQUIRED_COLUMNS {
        if !columns.contains_key(required) {
            return Err(ParseError::document(format!("missing column {}", required)));
        }
    }

    Ok(PointsListRows {
        records: reader.into_records(),
        columns,
        width: headers.len(),
    })
}

impl<'a> Iterator for PointsListRows<'a> {
    type Item = Result<ParsedRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                return Some(Err(ParseError::row(line, e.to_string())));
            }
        };

        Some(self.parse_row(&record))
    }
}

impl<'a> PointsListRows<'a> {
    fn parse_row(&self, record: &StringRecord) -> Result<ParsedRow, ParseError> {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if record.len() != self.width {
            return Err(ParseError::row(
                line,
                format!("expected {} fields, found {}", self.width, record.len()),
            ));
        }

        let row = Row {
            record,
            columns: &self.columns,
            line,
        };

        let competitor_id = row
            .text("Competitorid")
            .ok_or_else(|| ParseError::row(line, "missing Competitorid"))?;

        let name = row.text("Competitorname").unwrap_or_else(|| {
            [row.text("Lastname"), row.text("Firstname")]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ")
        });

        let athlete = AthleteAttrs {
            competitor_id,
            fis_code: row.text("Fiscode"),
            name,
            nation_code: row.text("Nationcode"),
            gender: row.text("Gender").as_deref().and_then(Gender::from_code),
            birth_year: row.integer("Birthyear")?,
            birth_date: row.date("Birthdate"),
            ski_club: row.text("Skiclub"),
            national_code: row.text("Nationalcode"),
        };

        let mut scores = [DisciplineScore::default(); 5];
        for discipline in Discipline::ALL {
            let code = discipline.code();
            scores[discipline.index()] = DisciplineScore {
                points: row.decimal(&format!("{code}points"))?,
                rank: row
                    .integer(&format!("{code}pos"))?
                    .map(|r| u32::try_from(r).map_err(|_| row.invalid(&format!("{code}pos"))))
                    .transpose()?,
                status: row.status(&format!("{code}Sta"))?,
            };
        }

        Ok(ParsedRow {
            line,
            athlete,
            calculation_date: row.date("Calculationdate"),
            scores,
        })
    }
}

/// Field accessors for one record. Absent columns and empty cells are `None`.
struct Row<'r> {
    record: &'r StringRecord,
    columns: &'r HashMap<String, usize>,
    line: u64,
}

impl<'r> Row<'r> {
    fn text(&self, column: &str) -> Option<String> {
        let index = *self.columns.get(column)?;
        let value = self.record.get(index)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn invalid(&self, column: &str) -> ParseError {
        ParseError::row(
            self.line,
            format!(
                "{} is not a valid number: {}",
                column,
                self.text(column).unwrap_or_default()
            ),
        )
    }

    fn decimal(&self, column: &str) -> Result<Option<f64>, ParseError> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
                .ok_or_else(|| self.invalid(column)),
        }
    }

    /// Integers may be exported as "12" or "12.0"
    fn integer(&self, column: &str) -> Result<Option<i32>, ParseError> {
        match self.text(column) {
            None => Ok(None),
            Some(raw) => {
                if let Ok(v) = raw.parse::<i32>() {
                    return Ok(Some(v));
                }
                match raw.parse::<f64>() {
                    Ok(v) if v.fract() == 0.0 && v.abs() <= f64::from(i32::MAX) => {
                        Ok(Some(v as i32))
                    }
                    _ => Err(self.invalid(column)),
                }
            }
        }
    }

    fn status(&self, column: &str) -> Result<Option<char>, ParseError> {
        let Some(raw) = self.text(column) else {
            return Ok(None);
        };
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(Some(c)),
            _ => Err(ParseError::row(
                self.line,
                format!("{} is not a single-character status: {}", column, raw),
            )),
        }
    }

    /// Dates come as `2025-04-30` or `30-04-2025`; anything else is dropped.
    fn date(&self, column: &str) -> Option<NaiveDate> {
        let raw = self.text(column)?;
        let raw = raw.split_whitespace().next().unwrap_or_default();
        ["%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
    }
}
