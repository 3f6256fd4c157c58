use ulid::Ulid;

use crate::model::*;

// ── Overlap test ──────────────────────────────────────────────────

/// First reservation of `cottage_id` among `existing` whose stay overlaps `stay`,
/// ignoring `exclude` (the reservation being edited in place).
///
/// Reservations of other cottages never conflict.
pub fn find_conflict<'a>(
    cottage_id: Ulid,
    stay: &Stay,
    existing: impl IntoIterator<Item = &'a Reservation>,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    existing.into_iter().find(|r| {
        r.cottage_id == cottage_id && Some(r.id) != exclude && r.stay.overlaps(stay)
    })
}

pub fn is_free<'a>(
    cottage_id: Ulid,
    stay: &Stay,
    existing: impl IntoIterator<Item = &'a Reservation>,
    exclude: Option<Ulid>,
) -> bool {
    find_conflict(cottage_id, stay, existing, exclude).is_none()
}

/// Same test against a cottage's own ledger, only scanning reservations the
/// sorted index says can overlap.
pub fn cottage_conflict<'a>(
    cottage: &'a CottageState,
    stay: &Stay,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    find_conflict(cottage.id, stay, cottage.overlapping(stay), exclude)
}

// ── Vacancy calendar ──────────────────────────────────────────────

/// Maximal free stays inside `window`: the window minus every reservation.
pub fn vacancies(cottage: &CottageState, window: &Stay) -> Vec<Stay> {
    let mut booked: Vec<Stay> = cottage
        .overlapping(window)
        .map(|r| {
            Stay::new(
                r.stay.check_in.max(window.check_in),
                r.stay.check_out.min(window.check_out),
            )
        })
        .collect();
    booked.sort_by_key(|s| s.check_in);
    let booked = merge_overlapping(&booked);
    subtract_stays(&[*window], &booked)
}

/// Merge sorted overlapping/adjacent stays into disjoint stays.
pub fn merge_overlapping(sorted: &[Stay]) -> Vec<Stay> {
    let mut merged: Vec<Stay> = Vec::new();
    for &stay in sorted {
        if let Some(last) = merged.last_mut()
            && stay.check_in <= last.check_out {
                last.check_out = last.check_out.max(stay.check_out);
                continue;
            }
        merged.push(stay);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` stays from sorted `base` stays.
pub fn subtract_stays(base: &[Stay], to_remove: &[Stay]) -> Vec<Stay> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.check_in;
        let current_end = b.check_out;

        while ri < to_remove.len() && to_remove[ri].check_out <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].check_in < current_end {
            let r = &to_remove[j];
            if r.check_in > current_start {
                result.push(Stay::new(current_start, r.check_in));
            }
            current_start = current_start.max(r.check_out);
            j += 1;
        }

        if current_start < current_end {
            result.push(Stay::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn d(s: &str) -> Day {
        s.parse().unwrap()
    }

    fn stay(a: &str, b: &str) -> Stay {
        Stay::new(d(a), d(b))
    }

    fn cottage_with(stays: &[(&str, &str)]) -> CottageState {
        let mut cs = CottageState::new(Ulid::new(), "Birch".into(), Category::Standard, 2, Decimal::ZERO);
        for (a, b) in stays {
            cs.insert_reservation(Reservation {
                id: Ulid::new(),
                cottage_id: cs.id,
                owner: CallerId::new("owner"),
                stay: stay(a, b),
                customer_name: "Guest".into(),
                customer_email: "guest@example.com".into(),
                confirmed: true,
            });
        }
        cs
    }

    // ── overlap ───────────────────────────────────────────

    #[test]
    fn identical_range_conflicts() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05")]);
        assert!(cottage_conflict(&cs, &stay("2024-10-01", "2024-10-05"), None).is_some());
    }

    #[test]
    fn containing_and_contained_conflict() {
        let cs = cottage_with(&[("2024-10-03", "2024-10-05")]);
        assert!(cottage_conflict(&cs, &stay("2024-10-01", "2024-10-10"), None).is_some());

        let cs = cottage_with(&[("2024-10-01", "2024-10-10")]);
        assert!(cottage_conflict(&cs, &stay("2024-10-03", "2024-10-05"), None).is_some());
    }

    #[test]
    fn turnover_day_is_free() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05")]);
        assert!(cottage_conflict(&cs, &stay("2024-10-05", "2024-10-08"), None).is_none());
        assert!(cottage_conflict(&cs, &stay("2024-09-28", "2024-10-01"), None).is_none());
    }

    #[test]
    fn single_night_overlap_conflicts() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05")]);
        assert!(cottage_conflict(&cs, &stay("2024-10-04", "2024-10-06"), None).is_some());
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05")]);
        let own = cs.reservations[0].id;
        assert!(cottage_conflict(&cs, &stay("2024-10-02", "2024-10-06"), Some(own)).is_none());
    }

    #[test]
    fn excluding_one_still_sees_siblings() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05"), ("2024-10-06", "2024-10-09")]);
        let first = cs.reservations[0].id;
        let hit = cottage_conflict(&cs, &stay("2024-10-02", "2024-10-07"), Some(first)).unwrap();
        assert_eq!(hit.id, cs.reservations[1].id);
    }

    #[test]
    fn other_cottages_never_conflict() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05")]);
        let elsewhere = Ulid::new();
        assert!(is_free(elsewhere, &stay("2024-10-01", "2024-10-05"), &cs.reservations, None));
        assert!(!is_free(cs.id, &stay("2024-10-01", "2024-10-05"), &cs.reservations, None));
    }

    #[test]
    fn empty_ledger_is_free() {
        let cs = cottage_with(&[]);
        assert!(is_free(cs.id, &stay("2024-10-01", "2024-10-05"), &cs.reservations, None));
    }

    // ── vacancies ─────────────────────────────────────────

    #[test]
    fn vacancies_around_reservations() {
        let cs = cottage_with(&[("2024-10-03", "2024-10-05"), ("2024-10-08", "2024-10-10")]);
        let free = vacancies(&cs, &stay("2024-10-01", "2024-10-15"));
        assert_eq!(
            free,
            vec![
                stay("2024-10-01", "2024-10-03"),
                stay("2024-10-05", "2024-10-08"),
                stay("2024-10-10", "2024-10-15"),
            ]
        );
    }

    #[test]
    fn vacancies_back_to_back_bookings_leave_no_gap() {
        let cs = cottage_with(&[("2024-10-01", "2024-10-05"), ("2024-10-05", "2024-10-08")]);
        let free = vacancies(&cs, &stay("2024-10-01", "2024-10-10"));
        assert_eq!(free, vec![stay("2024-10-08", "2024-10-10")]);
    }

    #[test]
    fn vacancies_clamped_to_window() {
        let cs = cottage_with(&[("2024-09-25", "2024-10-03")]);
        let free = vacancies(&cs, &stay("2024-10-01", "2024-10-05"));
        assert_eq!(free, vec![stay("2024-10-03", "2024-10-05")]);
    }

    #[test]
    fn vacancies_fully_booked() {
        let cs = cottage_with(&[("2024-09-01", "2024-11-01")]);
        assert!(vacancies(&cs, &stay("2024-10-01", "2024-10-05")).is_empty());
    }

    // ── merge / subtract ──────────────────────────────────

    #[test]
    fn merge_overlapping_and_adjacent() {
        let merged = merge_overlapping(&[
            stay("2024-10-01", "2024-10-04"),
            stay("2024-10-03", "2024-10-06"),
            stay("2024-10-06", "2024-10-07"),
            stay("2024-10-09", "2024-10-10"),
        ]);
        assert_eq!(merged, vec![stay("2024-10-01", "2024-10-07"), stay("2024-10-09", "2024-10-10")]);
    }

    #[test]
    fn merge_empty() {
        assert!(merge_overlapping(&[]).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_stays(&[stay("2024-10-01", "2024-10-10")], &[stay("2024-10-04", "2024-10-06")]);
        assert_eq!(result, vec![stay("2024-10-01", "2024-10-04"), stay("2024-10-06", "2024-10-10")]);
    }

    #[test]
    fn subtract_empty_removals() {
        let base = vec![stay("2024-10-01", "2024-10-10")];
        assert_eq!(subtract_stays(&base, &[]), base);
    }
}
