//! When a schedule may run, and when it runs next.

use chrono::{DateTime, Datelike, Duration, Utc};
use rrule::RRuleSet;
use tracing::warn;

use leadgen_common::ScrapeSchedule;

/// Whether `now` falls on an allowed weekday and inside `[start_time, end_time]`.
/// A window whose end is before its start wraps past midnight; equal bounds
/// mean the whole day. An empty weekday list allows every day.
pub fn in_window(schedule: &ScrapeSchedule, now: DateTime<Utc>) -> bool {
    if !schedule.allowed_weekdays.is_empty()
        && !schedule.allowed_weekdays.contains(&now.weekday())
    {
        return false;
    }
    let t = now.time();
    let (start, end) = (schedule.start_time, schedule.end_time);
    if start == end {
        true
    } else if start < end {
        start <= t && t <= end
    } else {
        t >= start || t <= end
    }
}

/// Next `next_run_at`, always strictly after `now`.
///
/// A recurrence rule wins when it parses and yields a future occurrence.
/// Otherwise the previous slot plus `frequency_hours`, or `now` plus the
/// frequency when the schedule has fallen behind.
pub fn next_run_at(schedule: &ScrapeSchedule, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(rule) = schedule.recurrence.as_deref() {
        match next_occurrence(rule, now) {
            Some(next) => return next,
            None => warn!(
                schedule_id = %schedule.id,
                recurrence = rule,
                "Recurrence rule yielded no future run, falling back to frequency_hours"
            ),
        }
    }
    let every = Duration::hours(i64::from(schedule.frequency_hours.max(1)));
    let slot = schedule.next_run_at + every;
    if slot > now {
        slot
    } else {
        now + every
    }
}

fn next_occurrence(rule: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let set: RRuleSet = rule.parse().ok()?;
    set.after(now.with_timezone(&rrule::Tz::UTC))
        .all(2)
        .dates
        .into_iter()
        .map(|d| d.with_timezone(&Utc))
        .find(|d| *d > now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use leadgen_common::{SelectionStrategy, SourceType, TargetSelector};
    use uuid::Uuid;

    fn schedule(at: DateTime<Utc>) -> ScrapeSchedule {
        ScrapeSchedule {
            id: Uuid::new_v4(),
            name: "tx plumbers".into(),
            enabled: true,
            source_type: SourceType::GoogleMaps,
            profession: "plumber".into(),
            target: TargetSelector::default(),
            strategy: SelectionStrategy::All,
            zip_limit_per_run: 10,
            frequency_hours: 24,
            recurrence: None,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            allowed_weekdays: vec![],
            max_concurrent: 2,
            delay_between_requests_ms: 0,
            priority: 0,
            next_run_at: at,
            last_run_at: None,
            last_run_enqueued: 0,
            last_error: None,
            version: 0,
        }
    }

    #[test]
    fn window_and_weekdays() {
        // 2026-03-04 is a Wednesday
        let wed_noon = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        let mut s = schedule(wed_noon);
        assert!(in_window(&s, wed_noon));
        assert!(!in_window(&s, Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0).unwrap()));

        s.allowed_weekdays = vec![Weekday::Mon, Weekday::Tue];
        assert!(!in_window(&s, wed_noon));
    }

    #[test]
    fn overnight_window_wraps() {
        let t = Utc.with_ymd_and_hms(2026, 3, 4, 23, 30, 0).unwrap();
        let mut s = schedule(t);
        s.start_time = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        s.end_time = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
        assert!(in_window(&s, t));
        assert!(in_window(&s, Utc.with_ymd_and_hms(2026, 3, 5, 3, 0, 0).unwrap()));
        assert!(!in_window(&s, Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap()));
    }

    #[test]
    fn frequency_keeps_cadence_or_catches_up() {
        let slot = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
        let s = schedule(slot);
        let on_time = slot + Duration::minutes(5);
        assert_eq!(next_run_at(&s, on_time), slot + Duration::hours(24));

        let very_late = slot + Duration::days(3);
        assert_eq!(next_run_at(&s, very_late), very_late + Duration::hours(24));
    }

    #[test]
    fn recurrence_rule_overrides_frequency() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        let mut s = schedule(now);
        s.recurrence = Some("DTSTART:20260302T090000Z\nRRULE:FREQ=WEEKLY;BYDAY=MO,TH".into());
        assert_eq!(
            next_run_at(&s, now),
            Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap()
        );

        s.recurrence = Some("NOT_A_VALID_RRULE".into());
        assert_eq!(next_run_at(&s, now), now + Duration::hours(24));
    }
}
