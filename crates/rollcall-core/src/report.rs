//! Attendance statistics and the plain-text report built from them.

use crate::ledger::AttendanceRecord;
use chrono::{Days, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Number of trailing records listed in a report.
const RECENT_RECORDS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub days: u32,
    pub total_attendances: usize,
    pub unique_people: usize,
    pub daily_average: f64,
    /// Person with the most attendances in the window; ties go to the smallest label.
    pub most_regular: Option<String>,
    pub by_person: BTreeMap<String, usize>,
    pub by_date: BTreeMap<NaiveDate, usize>,
}

impl AttendanceStats {
    /// First calendar date included in a window of `days` ending at `today`.
    pub fn window_start(today: NaiveDate, days: u32) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Summarise the records dated on or after `today - days`.
    pub fn compute(records: &[AttendanceRecord], today: NaiveDate, days: u32) -> Self {
        let cutoff = Self::window_start(today, days);
        let mut by_person: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_date: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        let mut total = 0;

        for record in records.iter().filter(|r| r.date() >= cutoff) {
            total += 1;
            *by_person.entry(record.label.clone()).or_default() += 1;
            *by_date.entry(record.date()).or_default() += 1;
        }

        let mut most_regular: Option<(&String, usize)> = None;
        for (label, &count) in &by_person {
            if most_regular.map_or(true, |(_, best)| count > best) {
                most_regular = Some((label, count));
            }
        }
        let most_regular = most_regular.map(|(label, _)| label.clone());

        let daily_average = if days == 0 {
            total as f64
        } else {
            total as f64 / f64::from(days)
        };

        Self {
            days,
            total_attendances: total,
            unique_people: by_person.len(),
            daily_average,
            most_regular,
            by_person,
            by_date,
        }
    }
}

/// Render the human-readable attendance report.
///
/// `recent` is the full history; only the last few entries are listed.
pub fn render_report(
    stats: &AttendanceStats,
    recent: &[AttendanceRecord],
    generated_at: NaiveDateTime,
) -> String {
    if recent.is_empty() && stats.total_attendances == 0 {
        return "No attendance data available.\n".to_string();
    }

    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(out, "ATTENDANCE REPORT");
    let _ = writeln!(out, "=================");
    let _ = writeln!(out, "Generated on: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out);
    let _ = writeln!(out, "SUMMARY (last {} days):", stats.days);
    let _ = writeln!(out, "- Total attendances: {}", stats.total_attendances);
    let _ = writeln!(out, "- Unique people: {}", stats.unique_people);
    let _ = writeln!(out, "- Daily average: {:.1}", stats.daily_average);
    let _ = writeln!(
        out,
        "- Most regular: {}",
        stats.most_regular.as_deref().unwrap_or("-")
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "ATTENDANCE BY PERSON:");
    for (label, count) in &stats.by_person {
        let unit = if *count == 1 { "day" } else { "days" };
        let _ = writeln!(out, "- {label}: {count} {unit}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "RECENT ATTENDANCE:");
    let skip = recent.len().saturating_sub(RECENT_RECORDS);
    for record in &recent[skip..] {
        let _ = writeln!(
            out,
            "- {}: {} ({})",
            record.label,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.kind
        );
    }
    out
}
