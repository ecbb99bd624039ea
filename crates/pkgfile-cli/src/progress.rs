//! Download progress rendering.
//!
//! The column layout is inherited from the original tool: a fixed-width
//! repo name, a bracketed size/rate block whose width feeds back into the
//! padding of the trailing "N remaining" column, and a 42-column summary
//! footer. Rates show two decimals below 9.995, one below 99.95 and none
//! above.

use std::time::Duration;

const LABELS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// Scales a byte count into the largest unit that keeps the value within
/// +/-2048, returning the scaled value and its label.
pub fn humanize(bytes: f64) -> (f64, &'static str) {
    let mut val = bytes;
    let mut index = 0;

    while index < LABELS.len() - 1 && !(-2048.0..=2048.0).contains(&val) {
        val /= 1024.0;
        index += 1;
    }

    (val, LABELS[index])
}

/// `1.62M/s` and `11.6M/s`, but `116K/s` and `1116K/s`.
pub fn format_rate(xfered: f64, xfered_label: &str, rate: f64, rate_label: char) -> String {
    if rate < 9.995 {
        format!("{xfered:8.1} {xfered_label:>3}  {rate:4.2}{rate_label}/s")
    } else if rate < 99.95 {
        format!("{xfered:8.1} {xfered_label:>3}  {rate:4.1}{rate_label}/s")
    } else {
        format!("{xfered:8.1} {xfered_label:>3}  {rate:4.0}{rate_label}/s")
    }
}

fn rate_block(size: u64, duration: Duration) -> String {
    #[allow(clippy::cast_precision_loss)]
    let size = size as f64;
    let rate = size / duration.as_secs_f64();
    let (xfered, xfered_label) = humanize(size);

    if rate.is_finite() {
        let (rate, rate_label) = humanize(rate);
        format_rate(
            xfered,
            xfered_label,
            rate,
            rate_label.chars().next().unwrap_or('B'),
        )
    } else {
        format!(" [{xfered:6.1} {xfered_label:>3}  {:>7} ", "----")
    }
}

/// One per-repo line after a successful transfer.
pub fn print_download_success(repo: &str, size: u64, duration: Duration, remaining: usize) {
    let block = rate_block(size, duration);
    let pad = 23_usize.saturating_sub(block.chars().count());
    println!("  download complete: {repo:<20} [{block} {remaining:>pad$} remaining]");
}

/// The summary footer, printed when at least one transfer happened.
pub fn print_total_download_stats(count: usize, duration: Duration, total_bytes: u64) {
    #[allow(clippy::cast_precision_loss)]
    let total = total_bytes as f64;
    let secs = duration.as_secs_f64();
    let rate = total / secs;
    let (xfered, xfered_label) = humanize(total);
    let (rate, rate_label) = humanize(rate);

    let head = format!(":: download complete in {secs:.2}s");
    let pad = 42_usize.saturating_sub(head.chars().count());
    let block = format_rate(
        xfered,
        xfered_label,
        rate,
        rate_label.chars().next().unwrap_or('B'),
    );
    let plural = if count == 1 { ' ' } else { 's' };
    println!("{head}{:>pad$}<{block} {count:2} file{plural}    >", "");
}
