use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::clock::local_instant;
use crate::limits::MAX_CANDIDATES_PER_RANGE;
use crate::model::*;

use super::conflict::ConflictIndex;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Valid slot starts inside one `[range_start, range_end)` window, ascending.
///
/// Candidates sit on a grid anchored at `range_start` with a step of
/// `settings.effective_spacing()`. The first candidate is the first grid point
/// at or after `now + min_notice`. A candidate is kept when the whole slot
/// fits inside the range and no probed boundary of it is occupied.
pub fn generate_slots(
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    settings: &JobSettings,
    now: DateTime<Utc>,
    index: &ConflictIndex,
) -> Vec<DateTime<Utc>> {
    let step_minutes = settings.effective_spacing();
    if settings.duration <= 0 || step_minutes <= 0 {
        return Vec::new();
    }
    // Out-of-range settings produce no slots rather than overflowing.
    let (Some(duration), Some(step), Some(notice)) = (
        Duration::try_minutes(settings.duration),
        Duration::try_minutes(step_minutes),
        Duration::try_minutes(settings.min_notice.max(0)),
    ) else {
        return Vec::new();
    };
    let Some(earliest) = now.checked_add_signed(notice) else {
        return Vec::new();
    };

    let mut candidate = range_start;
    if earliest > range_start {
        let gap = (earliest - range_start).num_seconds();
        let step_secs = step.num_seconds();
        let steps = (gap + step_secs - 1) / step_secs;
        let Some(first) = steps
            .checked_mul(step_secs)
            .and_then(Duration::try_seconds)
            .and_then(|offset| range_start.checked_add_signed(offset))
        else {
            return Vec::new();
        };
        if first > range_end {
            return Vec::new();
        }
        candidate = first;
    }

    let mut slots = Vec::new();
    for _ in 0..MAX_CANDIDATES_PER_RANGE {
        let Some(slot_end) = candidate.checked_add_signed(duration) else {
            break;
        };
        if slot_end > range_end {
            break;
        }
        if index.span_is_free(candidate, slot_end) {
            slots.push(candidate);
        }
        let Some(next) = candidate.checked_add_signed(step) else {
            break;
        };
        candidate = next;
    }
    slots
}

/// Run [`generate_slots`] over each wall-clock range of `date`, in template
/// order. Ranges are not merged or interleaved.
pub fn slots_for_day(
    tz: Tz,
    date: NaiveDate,
    ranges: &[TimeRange],
    settings: &JobSettings,
    now: DateTime<Utc>,
    index: &ConflictIndex,
) -> Vec<DateTime<Utc>> {
    let mut slots = Vec::new();
    for range in ranges {
        let start = local_instant(tz, date, range.start);
        let end = local_instant(tz, date, range.end);
        slots.extend(generate_slots(start, end, settings, now, index));
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Timelike};

    use crate::limits::MAX_JOB_MINUTES;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn utc() -> Tz {
        "UTC".parse().unwrap()
    }

    fn free_day() -> ConflictIndex {
        ConflictIndex::empty(at(0, 0), at(0, 0) + Duration::days(1))
    }

    fn busy_day(events: &[(DateTime<Utc>, DateTime<Utc>)]) -> ConflictIndex {
        let events: Vec<BusyEvent> = events
            .iter()
            .map(|&(start, end)| BusyEvent { start, end, title: String::new() })
            .collect();
        ConflictIndex::build(at(0, 0), at(0, 0) + Duration::days(1), &events)
    }

    fn settings(duration: Minutes, spacing: Minutes, min_notice: Minutes) -> JobSettings {
        JobSettings { duration, spacing, min_notice, ..Default::default() }
    }

    fn hhmm(slots: &[DateTime<Utc>]) -> Vec<String> {
        slots
            .iter()
            .map(|s| format!("{}:{:02}", s.hour(), s.minute()))
            .collect()
    }

    fn full_template() -> Vec<TimeRange> {
        vec![TimeRange::hm((7, 30), (12, 45)), TimeRange::hm((12, 45), (15, 30))]
    }

    // A "now" far enough back that notice never bites.
    fn long_ago() -> DateTime<Utc> {
        at(0, 0) - Duration::days(30)
    }

    #[test]
    fn oversized_settings_yield_nothing() {
        let day = &full_template()[0];
        let start = local_instant(utc(), date(), day.start);
        let end = local_instant(utc(), date(), day.end);
        let huge = settings(i64::MAX, i64::MAX, 0);
        assert!(generate_slots(start, end, &huge, long_ago(), &free_day()).is_empty());
        let far_notice = settings(30, 0, i64::MAX);
        assert!(generate_slots(start, end, &far_notice, long_ago(), &free_day()).is_empty());
        let interval = JobSettings { start_interval: MAX_JOB_MINUTES, ..settings(30, 0, 0) };
        assert_eq!(hhmm(&generate_slots(start, end, &interval, long_ago(), &free_day())), ["7:30"]);
    }

    #[test]
    fn full_template_without_conflicts() {
        let slots = slots_for_day(utc(), date(), &full_template(), &settings(30, 0, 0), long_ago(), &free_day());
        assert_eq!(
            hhmm(&slots),
            [
                "7:30", "8:00", "8:30", "9:00", "9:30", "10:00", "10:30", "11:00", "11:30", "12:00",
                "12:45", "13:15", "13:45", "14:15", "14:45",
            ]
        );
    }

    #[test]
    fn ten_minute_busy_removes_only_the_overlapping_slot() {
        let index = busy_day(&[(at(9, 0), at(9, 10))]);
        let slots = slots_for_day(utc(), date(), &full_template(), &settings(30, 0, 0), long_ago(), &index);
        let labels = hhmm(&slots);
        assert!(!labels.contains(&"9:00".to_string()));
        assert!(labels.contains(&"8:30".to_string()));
        assert!(labels.contains(&"9:30".to_string()));
        assert_eq!(labels.len(), 14);
    }

    #[test]
    fn min_notice_aligns_to_range_grid() {
        // now 09:00 + 60 min notice = 10:00, which is on the 7:30 grid
        let range = [TimeRange::hm((7, 30), (12, 45))];
        let slots = slots_for_day(utc(), date(), &range, &settings(30, 0, 60), at(9, 0), &free_day());
        assert_eq!(hhmm(&slots)[0], "10:00");
    }

    #[test]
    fn min_notice_off_grid_rounds_up() {
        // earliest 10:10 → next grid point 10:30
        let range = [TimeRange::hm((7, 30), (12, 45))];
        let slots = slots_for_day(utc(), date(), &range, &settings(30, 0, 70), at(9, 0), &free_day());
        assert_eq!(hhmm(&slots)[0], "10:30");
        assert!(slots.iter().all(|s| *s >= at(10, 10)));
    }

    #[test]
    fn notice_past_range_end_yields_nothing() {
        let range = [TimeRange::hm((7, 30), (12, 45))];
        let slots = slots_for_day(utc(), date(), &range, &settings(30, 0, 0), at(13, 0), &free_day());
        assert!(slots.is_empty());
    }

    #[test]
    fn notice_lands_exactly_on_range_end_yields_nothing() {
        let range = [TimeRange::hm((9, 0), (10, 0))];
        let slots = slots_for_day(utc(), date(), &range, &settings(30, 0, 0), at(10, 0), &free_day());
        assert!(slots.is_empty());
    }

    #[test]
    fn default_notice_pushes_today_out() {
        // 1440 minutes of notice from 06:00 today leaves nothing today
        let slots = slots_for_day(utc(), date(), &full_template(), &JobSettings { duration: 30, ..Default::default() }, at(6, 0), &free_day());
        assert!(slots.is_empty());
    }

    #[test]
    fn spacing_adds_to_duration() {
        let range = [TimeRange::hm((9, 0), (12, 0))];
        let slots = slots_for_day(utc(), date(), &range, &settings(45, 15, 0), long_ago(), &free_day());
        assert_eq!(hhmm(&slots), ["9:00", "10:00", "11:00"]);
    }

    #[test]
    fn start_interval_overrides_spacing() {
        let range = [TimeRange::hm((9, 0), (10, 30))];
        let s = JobSettings { duration: 60, spacing: 60, start_interval: 15, min_notice: 0, ..Default::default() };
        let slots = slots_for_day(utc(), date(), &range, &s, long_ago(), &free_day());
        assert_eq!(hhmm(&slots), ["9:00", "9:15", "9:30"]);
    }

    #[test]
    fn zero_duration_yields_nothing() {
        let slots = slots_for_day(utc(), date(), &full_template(), &settings(0, 30, 0), long_ago(), &free_day());
        assert!(slots.is_empty());
    }

    #[test]
    fn slot_longer_than_range_yields_nothing() {
        let range = [TimeRange::hm((9, 0), (9, 45))];
        let slots = slots_for_day(utc(), date(), &range, &settings(60, 0, 0), long_ago(), &free_day());
        assert!(slots.is_empty());
    }

    #[test]
    fn ranges_are_processed_in_template_order() {
        let ranges = [TimeRange::hm((14, 0), (15, 0)), TimeRange::hm((9, 0), (10, 0))];
        let slots = slots_for_day(utc(), date(), &ranges, &settings(30, 0, 0), long_ago(), &free_day());
        assert_eq!(hhmm(&slots), ["14:00", "14:30", "9:00", "9:30"]);
    }

    #[test]
    fn slots_respect_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let (start, end) = crate::clock::day_bounds(tz, date());
        let index = ConflictIndex::empty(start, end);
        let range = [TimeRange::hm((9, 0), (10, 0))];
        let slots = slots_for_day(tz, date(), &range, &settings(60, 0, 0), long_ago(), &index);
        assert_eq!(slots, vec![at(13, 0)]);
    }

    #[test]
    fn generated_slots_hold_range_and_conflict_invariants() {
        let busy = [(at(8, 12), at(8, 47)), (at(10, 0), at(10, 1)), (at(13, 58), at(14, 33))];
        let index = busy_day(&busy);
        let now = at(7, 0);
        let s = JobSettings { duration: 25, spacing: 5, min_notice: 40, ..Default::default() };
        let ranges = full_template();
        let slots = slots_for_day(utc(), date(), &ranges, &s, now, &index);
        assert!(!slots.is_empty());
        let earliest = now + Duration::minutes(s.min_notice);
        for slot in &slots {
            let end = *slot + Duration::minutes(s.duration);
            assert!(*slot >= earliest);
            let within = ranges.iter().any(|r| {
                let (rs, re) = (local_instant(utc(), date(), r.start), local_instant(utc(), date(), r.end));
                *slot >= rs && end <= re
            });
            assert!(within, "slot {slot} escapes its range");
            let mut probe = *slot;
            while probe < end {
                for (bs, be) in &busy {
                    assert!(!(probe >= *bs && probe < *be), "slot {slot} probes busy time at {probe}");
                }
                probe += Duration::minutes(5);
            }
        }
    }

    #[test]
    fn dst_gap_range_start_shifts_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let gap_day = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
        let (start, end) = crate::clock::day_bounds(tz, gap_day);
        let index = ConflictIndex::empty(start, end);
        let range = [TimeRange::new(
            NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        )];
        let slots = slots_for_day(tz, gap_day, &range, &settings(30, 0, 0), start - Duration::days(2), &index);
        let first = crate::clock::format_slot(tz, slots[0]);
        assert_eq!(first, "2026-03-08T03:00:00-04:00");
        assert_eq!(slots.len(), 2);
    }
}
