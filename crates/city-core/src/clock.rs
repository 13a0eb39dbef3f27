//! ISO-8601 UTC timestamps for move records.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn utc_timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    format_utc_timestamp(since_epoch)
}

/// Formats as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_utc_timestamp(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let millis = since_epoch.subsec_millis();
    let time_of_day = secs % 86_400;
    let (year, month, day) = days_to_ymd(secs / 86_400);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        year,
        month,
        day,
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60,
        millis
    )
}

/// Days since the Unix epoch to a civil (year, month, day), after Howard
/// Hinnant's `civil_from_days`.
fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_formats_as_1970() {
        assert_eq!(days_to_ymd(0), (1970, 1, 1));
        assert_eq!(
            format_utc_timestamp(Duration::ZERO),
            "1970-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn known_instants_format_correctly() {
        assert_eq!(
            format_utc_timestamp(Duration::from_secs(1_704_067_200)),
            "2024-01-01T00:00:00.000Z"
        );
        assert_eq!(
            format_utc_timestamp(Duration::from_millis(1_709_164_800_250 + 3_723_000)),
            "2024-02-29T01:02:03.250Z"
        );
    }

    #[test]
    fn now_has_iso_shape() {
        let stamp = utc_timestamp_now();
        assert_eq!(stamp.len(), 24);
        assert_eq!(&stamp[10..11], "T");
        assert!(stamp.ends_with('Z'));
    }
}
