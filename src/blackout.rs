//! Operating-system update blackout windows
//!
//! Cache hosts install monthly updates a fixed number of days after the
//! second Tuesday of the month. Runs that start inside those windows are
//! skipped so that a reboot does not interrupt a download.
//!
//! | Hosts        | Day            | Window                   | Expected update |
//! |--------------|----------------|--------------------------|-----------------|
//! | Workstations | Tuesday + 2    | 00:00 - 06:00            | 03:00           |
//! | Servers      | Tuesday + 5    | 02:00 - 04:00, 09:00 - 11:00 | 03:00 or 10:00 |

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// Describe the pending update if `now` (local time) is inside a blackout window
pub fn updates_are_pending(now: NaiveDateTime) -> Option<String> {
    let tuesday = second_tuesday(now.year(), now.month())?;

    let workstation_day = tuesday + Duration::days(2);
    if in_window(now, workstation_day, 0, 6) {
        let update = at(workstation_day, 3)?;
        return Some(if now < update {
            format!(
                "Processing boxes are expected to install operating-system updates around {}",
                clock(update)
            )
        } else {
            format!(
                "Processing boxes should have installed operating-system updates at {}",
                clock(update)
            )
        });
    }

    let server_day = tuesday + Duration::days(5);
    if in_window(now, server_day, 2, 4) || in_window(now, server_day, 9, 11) {
        let first = at(server_day, 3)?;
        let second = at(server_day, 10)?;
        let times = format!("{} or {}", clock(first), clock(second));
        return Some(if now < second {
            format!("Servers are expected to install operating-system updates around {}", times)
        } else {
            format!("Servers should have installed operating-system updates around {}", times)
        });
    }

    None
}

/// Second Tuesday of the given month
pub fn second_tuesday(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Tue, 2)
}

fn at(day: NaiveDate, hour: u32) -> Option<NaiveDateTime> {
    NaiveTime::from_hms_opt(hour, 0, 0).map(|time| day.and_time(time))
}

fn in_window(now: NaiveDateTime, day: NaiveDate, start_hour: u32, end_hour: u32) -> bool {
    match (at(day, start_hour), at(day, end_hour)) {
        (Some(start), Some(end)) => now >= start && now < end,
        _ => false,
    }
}

fn clock(time: NaiveDateTime) -> String {
    time.format("%I:%M:%S %p").to_string()
}
