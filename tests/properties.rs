use std::sync::Arc;

use chrono::{Days, NaiveDate, NaiveTime, Utc};
use proptest::prelude::*;
use ulid::Ulid;

use slotkeep::engine::{
    Engine, EngineError, allowed_transitions, can_transition, day_of_week, generate_slots, resolve_local_or_next,
};
use slotkeep::model::*;
use slotkeep::notify::NotifyHub;

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2031, 3, 3).unwrap()
}

fn minutes_to_time(m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(m / 60, m % 60, 0).unwrap()
}

fn rule(service_type_id: Ulid, start_min: u32, len_min: u32) -> AvailabilityRule {
    rule_on(1, service_type_id, start_min, len_min)
}

fn rule_on(day_of_week: u8, service_type_id: Ulid, start_min: u32, len_min: u32) -> AvailabilityRule {
    AvailabilityRule {
        id: Ulid::new(),
        service_type_id,
        day_of_week,
        start_time: minutes_to_time(start_min),
        end_time: minutes_to_time((start_min + len_min).min(23 * 60 + 59)),
        resource: None,
    }
}

fn local_ms(date: NaiveDate, t: NaiveTime) -> Ms {
    date.and_time(t).and_utc().timestamp_millis()
}

proptest! {
    #[test]
    fn slots_fit_rules_and_never_overlap(
        windows in prop::collection::vec((0u32..22 * 60, 1u32..240), 0..6),
        duration in 5u32..120,
    ) {
        let svc = Ulid::new();
        let rules: Vec<_> = windows.iter().map(|&(s, l)| rule(svc, s, l)).collect();
        let date = monday();
        let slots = generate_slots(&rules, date, chrono_tz::UTC, duration, 0);

        for slot in &slots {
            prop_assert_eq!(slot.duration_ms(), i64::from(duration) * 60_000);
            let inside = rules.iter().any(|r| {
                slot.start >= local_ms(date, r.start_time) && slot.end <= local_ms(date, r.end_time)
            });
            prop_assert!(inside, "slot {:?} outside every rule", slot);
        }
        for pair in slots.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn slots_fit_rules_across_dst_transitions(
        windows in prop::collection::vec((0u32..6 * 60, 1u32..240), 1..6),
        duration in 5u32..120,
        date in prop::sample::select(vec![
            NaiveDate::from_ymd_opt(2031, 3, 9).unwrap(),
            NaiveDate::from_ymd_opt(2031, 11, 2).unwrap(),
        ]),
    ) {
        // Both dates are Sundays on which New York changes its clocks at 02:00.
        let tz = chrono_tz::America::New_York;
        let svc = Ulid::new();
        let rules: Vec<_> = windows.iter().map(|&(s, l)| rule_on(0, svc, s, l)).collect();
        let slots = generate_slots(&rules, date, tz, duration, 0);

        for slot in &slots {
            prop_assert_eq!(slot.duration_ms(), i64::from(duration) * 60_000);
            let inside = rules.iter().any(|r| {
                let open = resolve_local_or_next(tz, date.and_time(r.start_time)).unwrap();
                let close = resolve_local_or_next(tz, date.and_time(r.end_time)).unwrap();
                slot.start >= open && slot.end <= close
            });
            prop_assert!(inside, "slot {:?} overruns every rule", slot);
        }
        for pair in slots.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn other_weekdays_yield_nothing(offset in 1u64..7, duration in 5u32..120) {
        let svc = Ulid::new();
        let date = monday() + Days::new(offset);
        prop_assume!(day_of_week(date) != 1);
        let rules = vec![rule(svc, 8 * 60, 600)];
        prop_assert!(generate_slots(&rules, date, chrono_tz::UTC, duration, 0).is_empty());
    }

    #[test]
    fn transitions_never_leave_terminal_states(
        from in prop::sample::select(BookingStatus::ALL.to_vec()),
        to in prop::sample::select(BookingStatus::ALL.to_vec()),
    ) {
        if from.is_terminal() {
            prop_assert!(!can_transition(from, to));
        }
        if can_transition(from, to) {
            prop_assert_ne!(from, to);
            prop_assert!(allowed_transitions(from).contains(&to));
        }
        if from == BookingStatus::Pending {
            let expected = matches!(
                to,
                BookingStatus::Confirmed | BookingStatus::Cancelled | BookingStatus::NoShow
            );
            prop_assert_eq!(can_transition(from, to), expected);
        }
    }
}

/// One step of a random booking workload: book slot `n`, or cancel the
/// `n`-th booking made so far.
#[derive(Debug, Clone)]
enum Op {
    Book(usize),
    Cancel(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..20).prop_map(Op::Book),
        1 => (0usize..20).prop_map(Op::Cancel),
    ]
}

fn future_monday() -> NaiveDate {
    let mut date = Utc::now().date_naive() + Days::new(14);
    while day_of_week(date) != 1 {
        date = date.succ_opt().unwrap();
    }
    date
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn committed_bookings_never_overlap(ops in prop::collection::vec(op(), 1..40), duration in prop::sample::select(vec![15u32, 30, 45])) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let bookings = rt.block_on(async {
            let dir = std::env::temp_dir().join(format!("slotkeep_prop_{}", Ulid::new()));
            std::fs::create_dir_all(&dir).unwrap();
            let engine = Engine::new(dir.join("slotkeep.wal"), Arc::new(NotifyHub::new())).unwrap();

            let ws = Ulid::new();
            let svc = Ulid::new();
            engine.create_workspace(ws, "Prop", "UTC").await.unwrap();
            engine.create_service_type(svc, ws, "Svc", duration, None, None).await.unwrap();
            engine
                .add_rule(Ulid::new(), svc, 1, minutes_to_time(8 * 60), minutes_to_time(18 * 60), None)
                .await
                .unwrap();

            let date = future_monday();
            let day_start = local_ms(date, minutes_to_time(8 * 60));
            let step = 15 * 60_000;
            let mut made = Vec::new();
            for op in ops {
                match op {
                    Op::Book(n) => {
                        let at = day_start + n as Ms * step;
                        let email = format!("p{n}@example.com");
                        let contact = ContactInput { name: "Prop".into(), email, phone: None };
                        match engine.create_booking(BookingRequest::new(ws, svc, at, contact)).await {
                            Ok(b) => made.push(b.id),
                            Err(EngineError::SlotUnavailable { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    Op::Cancel(n) => {
                        if let Some(id) = made.get(n) {
                            // Already cancelled is an InvalidTransition, which is fine here.
                            let _ = engine.update_booking_status(*id, BookingStatus::Cancelled).await;
                        }
                    }
                }
            }
            engine.list_bookings(ws, &BookingFilter::default()).await.unwrap()
        });

        let occupying: Vec<_> = bookings.iter().filter(|b| b.status.occupies()).collect();
        for (i, a) in occupying.iter().enumerate() {
            for b in &occupying[i + 1..] {
                prop_assert!(!a.span().overlaps(&b.span()), "{:?} overlaps {:?}", a, b);
            }
        }
    }
}
