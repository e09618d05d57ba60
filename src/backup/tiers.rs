// pgrotate/src/backup/tiers.rs
//! Tier classification and retention buckets.
//!
//! A weekly (monthly) artifact is due once per ISO week (calendar month): on
//! the first run whose bucket differs from the newest one already on disk for
//! the same series. There is no backfill across gaps.

use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::naming::{ArtifactSeries, BackupArtifact, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsoWeekKey {
    pub iso_year: i32,
    pub week: u32,
}

impl IsoWeekKey {
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        IsoWeekKey {
            iso_year: iso.year(),
            week: iso.week(),
        }
    }
}

impl fmt::Display for IsoWeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.iso_year, self.week)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(date: NaiveDate) -> Self {
        MonthKey {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Retention bucket of an artifact within its tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Day(NaiveDate),
    Week(IsoWeekKey),
    Month(MonthKey),
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Day(date) => write!(f, "{}", date),
            Bucket::Week(week) => write!(f, "{}", week),
            Bucket::Month(month) => write!(f, "{}", month),
        }
    }
}

pub fn bucket(tier: Tier, date: NaiveDate) -> Bucket {
    match tier {
        Tier::Daily => Bucket::Day(date),
        Tier::Weekly => Bucket::Week(IsoWeekKey::of(date)),
        Tier::Monthly => Bucket::Month(MonthKey::of(date)),
    }
}

/// Newest date seen on disk for each tier of one series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastSeen {
    pub daily: Option<NaiveDate>,
    pub weekly: Option<NaiveDate>,
    pub monthly: Option<NaiveDate>,
}

impl LastSeen {
    pub fn get(&self, tier: Tier) -> Option<NaiveDate> {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }

    fn observe(&mut self, tier: Tier, date: NaiveDate) {
        let slot = match tier {
            Tier::Daily => &mut self.daily,
            Tier::Weekly => &mut self.weekly,
            Tier::Monthly => &mut self.monthly,
        };
        if slot.map_or(true, |seen| date > seen) {
            *slot = Some(date);
        }
    }
}

/// Re-derives the last bucket seen per series from the artifacts on disk.
pub fn last_seen_by_series<'a>(
    artifacts: impl IntoIterator<Item = &'a BackupArtifact>,
) -> HashMap<ArtifactSeries, LastSeen> {
    let mut seen: HashMap<ArtifactSeries, LastSeen> = HashMap::new();
    for artifact in artifacts {
        seen.entry(artifact.series.clone())
            .or_default()
            .observe(artifact.tier, artifact.date);
    }
    seen
}

/// Tiers a backup taken on `date` must populate. Daily is always due.
pub fn tiers_for(date: NaiveDate, last_seen: &LastSeen) -> BTreeSet<Tier> {
    let mut due = BTreeSet::from([Tier::Daily]);
    for tier in [Tier::Weekly, Tier::Monthly] {
        let is_new_bucket = last_seen
            .get(tier)
            .map_or(true, |seen| bucket(tier, seen) != bucket(tier, date));
        if is_new_bucket {
            due.insert(tier);
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::naming::{ArtifactKind, SchemaSelector};
    use std::path::Path;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seen(daily: NaiveDate, weekly: NaiveDate, monthly: NaiveDate) -> LastSeen {
        LastSeen {
            daily: Some(daily),
            weekly: Some(weekly),
            monthly: Some(monthly),
        }
    }

    #[test]
    fn test_first_run_populates_every_tier() {
        let due = tiers_for(date(2024, 1, 1), &LastSeen::default());
        assert_eq!(due, BTreeSet::from([Tier::Daily, Tier::Weekly, Tier::Monthly]));
    }

    #[test]
    fn test_same_iso_week_excludes_weekly() {
        // 2024-01-01 (Mon) through 2024-01-07 (Sun) are all 2024-W01
        let first = date(2024, 1, 1);
        for day in 2..=7 {
            let due = tiers_for(date(2024, 1, day), &seen(first, first, first));
            assert!(!due.contains(&Tier::Weekly), "day {} should not be weekly", day);
            assert!(due.contains(&Tier::Daily));
        }
        let due = tiers_for(date(2024, 1, 8), &seen(first, first, first));
        assert!(due.contains(&Tier::Weekly));
        assert!(!due.contains(&Tier::Monthly));
    }

    #[test]
    fn test_iso_week_crosses_calendar_year() {
        // 2024-12-30 already belongs to 2025-W01
        assert_eq!(IsoWeekKey::of(date(2024, 12, 30)), IsoWeekKey { iso_year: 2025, week: 1 });
        let last = date(2024, 12, 30);
        let due = tiers_for(date(2025, 1, 2), &seen(last, last, last));
        assert!(!due.contains(&Tier::Weekly));
        assert!(due.contains(&Tier::Monthly));
    }

    #[test]
    fn test_gap_over_month_boundary_yields_one_monthly() {
        let mut last = seen(date(2024, 1, 29), date(2024, 1, 29), date(2024, 1, 1));
        let mut monthly_runs = Vec::new();
        // no runs between Jan 30 and Feb 2, then daily runs resume
        for run in [date(2024, 2, 3), date(2024, 2, 4), date(2024, 2, 5)] {
            let due = tiers_for(run, &last);
            if due.contains(&Tier::Monthly) {
                monthly_runs.push(run);
            }
            for tier in due {
                last.observe(tier, run);
            }
        }
        assert_eq!(monthly_runs, vec![date(2024, 2, 3)]);
    }

    #[test]
    fn test_last_seen_is_per_series_and_newest() {
        let dir = Path::new("/backups");
        let series = |db: &str| ArtifactSeries {
            host: "localhost".into(),
            port: 5432,
            database: db.into(),
            selector: SchemaSelector::AllSchemas,
            kind: ArtifactKind::PgDumpCustom,
        };
        let artifacts = vec![
            BackupArtifact::new(dir, series("app"), date(2024, 1, 1), Tier::Weekly),
            BackupArtifact::new(dir, series("app"), date(2024, 1, 8), Tier::Weekly),
            BackupArtifact::new(dir, series("app"), date(2024, 1, 9), Tier::Daily),
            BackupArtifact::new(dir, series("crm"), date(2024, 1, 2), Tier::Monthly),
        ];
        let by_series = last_seen_by_series(&artifacts);
        assert_eq!(
            by_series[&series("app")],
            LastSeen {
                daily: Some(date(2024, 1, 9)),
                weekly: Some(date(2024, 1, 8)),
                monthly: None,
            }
        );
        assert_eq!(by_series[&series("crm")].monthly, Some(date(2024, 1, 2)));
        assert!(!by_series.contains_key(&series("billing")));
    }

    #[test]
    fn test_bucket_labels() {
        assert_eq!(bucket(Tier::Weekly, date(2024, 1, 8)).to_string(), "2024-W02");
        assert_eq!(bucket(Tier::Monthly, date(2024, 1, 8)).to_string(), "2024-01");
        assert_eq!(bucket(Tier::Daily, date(2024, 1, 8)).to_string(), "2024-01-08");
    }
}
