// 🪪 Identity Resolver
//
// Maps (namespace, external id) to an internal durable key. The key is
// created on first sight and reused forever after. This is the only place
// where contradictory immutable attributes are detected.

use crate::db::Store;
use crate::error::{IngestError, Result};
use crate::models::{Athlete, AthleteAttrs, UpsertOutcome};
use tracing::debug;

pub const COMPETITOR: &str = "competitor";
pub const FIS_CODE: &str = "fis_code";
pub const RACE: &str = "race";
pub const POINTS_LIST: &str = "points_list";

pub struct IdentityResolver<'a, S: Store> {
    store: &'a S,
}

impl<'a, S: Store> IdentityResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Return the key for `(namespace, external_id)`, creating it if absent.
    ///
    /// The flag is true when the identity was created by this call.
    pub fn resolve(&self, namespace: &str, external_id: &str) -> Result<(String, bool)> {
        if let Some(key) = self.store.lookup_identity(namespace, external_id)? {
            return Ok((key, false));
        }

        let key = uuid::Uuid::new_v4().to_string();
        self.store.insert_identity(namespace, external_id, &key)?;
        debug!(namespace, external_id, key = %key, "new identity");
        Ok((key, true))
    }

    /// Resolve an athlete by competitor id and reconcile its attributes.
    pub fn resolve_athlete(&self, attrs: &AthleteAttrs) -> Result<(String, UpsertOutcome)> {
        let (key, _) = self.resolve(COMPETITOR, &attrs.competitor_id)?;

        if let Some(fis_code) = attrs.fis_code.as_deref().filter(|c| !c.is_empty()) {
            match self.store.lookup_identity(FIS_CODE, fis_code)? {
                Some(owner) if owner != key => {
                    return Err(conflict(
                        attrs,
                        "fis_code",
                        format!("owned by {}", owner),
                        fis_code.to_string(),
                    ));
                }
                Some(_) => {}
                None => self.store.insert_identity(FIS_CODE, fis_code, &key)?,
            }
        }

        let merged = match self.store.get_athlete(&key)? {
            Some(stored) => reconcile(&stored.attrs, attrs)?,
            None => attrs.clone(),
        };

        let outcome = self.store.upsert_athlete(&Athlete {
            key: key.clone(),
            attrs: merged,
        })?;
        Ok((key, outcome))
    }
}

/// Merge incoming attributes into stored ones.
///
/// Immutable fields (gender, birth year, birth date) may be filled in but
/// never changed. Mutable fields take the incoming value when one is present.
fn reconcile(stored: &AthleteAttrs, incoming: &AthleteAttrs) -> Result<AthleteAttrs> {
    check_immutable(incoming, "gender", stored.gender, incoming.gender)?;
    check_immutable(incoming, "birth_year", stored.birth_year, incoming.birth_year)?;
    check_immutable(incoming, "birth_date", stored.birth_date, incoming.birth_date)?;

    Ok(AthleteAttrs {
        competitor_id: stored.competitor_id.clone(),
        fis_code: incoming.fis_code.clone().or_else(|| stored.fis_code.clone()),
        name: if incoming.name.trim().is_empty() {
            stored.name.clone()
        } else {
            incoming.name.clone()
        },
        nation_code: incoming
            .nation_code
            .clone()
            .or_else(|| stored.nation_code.clone()),
        gender: stored.gender.or(incoming.gender),
        birth_year: stored.birth_year.or(incoming.birth_year),
        birth_date: stored.birth_date.or(incoming.birth_date),
        ski_club: incoming.ski_club.clone().or_else(|| stored.ski_club.clone()),
        national_code: incoming
            .national_code
            .clone()
            .or_else(|| stored.national_code.clone()),
    })
}

fn check_immutable<T: PartialEq + std::fmt::Debug>(
    attrs: &AthleteAttrs,
    field: &str,
    stored: Option<T>,
    received: Option<T>,
) -> Result<()> {
    match (stored, received) {
        (Some(s), Some(r)) if s != r => Err(conflict(
            attrs,
            field,
            format!("{:?}", s),
            format!("{:?}", r),
        )),
        _ => Ok(()),
    }
}

fn conflict(attrs: &AthleteAttrs, field: &str, stored: String, received: String) -> IngestError {
    IngestError::IdentityConflict {
        namespace: COMPETITOR.to_string(),
        external_id: attrs.competitor_id.clone(),
        field: field.to_string(),
        stored,
        received,
    }
}
