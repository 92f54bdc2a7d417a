//! Human-readable duration formatting for status and history output

/// Format selection thresholds (seconds)
const SHORT_FORMAT_MAX: f64 = 100.0; // < 100s → X.XXs
const MEDIUM_FORMAT_MAX: f64 = 6000.0; // < 100m → M:SS.Xs
                                       // otherwise H:MM:SS

/// Format a stage duration in seconds.
///
/// ```
/// use classics_common::human_time::format_duration_secs;
///
/// assert_eq!(format_duration_secs(4.5), "4.50s");
/// assert_eq!(format_duration_secs(330.0), "5:30.0s");
/// assert_eq!(format_duration_secs(7322.0), "2:02:02");
/// ```
pub fn format_duration_secs(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "-".to_string();
    }

    // Thresholds apply to the value as displayed, so 99.999 is not "100.00s"
    // and 119.96 carries into the minute instead of showing "1:60.0s"
    if (seconds * 100.0).round() / 100.0 < SHORT_FORMAT_MAX {
        format!("{:.2}s", seconds)
    } else if (seconds * 10.0).round() / 10.0 < MEDIUM_FORMAT_MAX {
        let tenths = (seconds * 10.0).round() as u64;
        format!("{}:{:02}.{}s", tenths / 600, (tenths % 600) / 10, tenths % 10)
    } else {
        let whole = seconds.round() as u64;
        format!("{}:{:02}:{:02}", whole / 3600, (whole % 3600) / 60, whole % 60)
    }
}

/// Format a USD amount with cents
pub fn format_usd(amount: f64) -> String {
    format!("${:.2}", amount)
}
