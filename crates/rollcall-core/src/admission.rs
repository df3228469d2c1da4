//! Once-per-calendar-day attendance admission.

use crate::ledger::{AttendanceLedger, AttendanceRecord, MarkKind, PersistenceError};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Admitted,
    AlreadyMarkedToday,
}

/// Admit each recognised label for the date of `now`, as an automatic mark.
///
/// See [`admit_with_kind`].
pub fn admit<'a, I, L>(
    labels: I,
    now: NaiveDateTime,
    ledger: &mut L,
) -> Result<BTreeMap<String, AdmissionOutcome>, PersistenceError>
where
    I: IntoIterator<Item = &'a str>,
    L: AttendanceLedger + ?Sized,
{
    admit_with_kind(labels, now, MarkKind::Auto, ledger)
}

/// Admit each label at most once per calendar day.
///
/// Duplicate labels collapse. Only the date part of `now` is compared.
/// A write failure aborts the call; labels already admitted stay admitted,
/// and calling again with the same labels and date is safe.
pub fn admit_with_kind<'a, I, L>(
    labels: I,
    now: NaiveDateTime,
    kind: MarkKind,
    ledger: &mut L,
) -> Result<BTreeMap<String, AdmissionOutcome>, PersistenceError>
where
    I: IntoIterator<Item = &'a str>,
    L: AttendanceLedger + ?Sized,
{
    let labels: BTreeSet<&str> = labels.into_iter().collect();
    let today = now.date();
    let mut outcomes = BTreeMap::new();

    for label in labels {
        let outcome = if ledger.has_record(label, today)? {
            AdmissionOutcome::AlreadyMarkedToday
        } else {
            let record = AttendanceRecord {
                label: label.to_string(),
                timestamp: now,
                kind,
            };
            // The ledger may still refuse if another writer got there first.
            if ledger.append_record(&record)? {
                AdmissionOutcome::Admitted
            } else {
                AdmissionOutcome::AlreadyMarkedToday
            }
        };

        match outcome {
            AdmissionOutcome::Admitted => {
                tracing::info!(label, %now, %kind, "attendance marked")
            }
            AdmissionOutcome::AlreadyMarkedToday => {
                tracing::debug!(label, date = %today, "attendance already marked today")
            }
        }
        outcomes.insert(label.to_string(), outcome);
    }

    Ok(outcomes)
}
