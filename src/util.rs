//! Utility functions for `StreamHerald`.
//!
//! This module contains reusable helper functions used across the codebase.

/// Truncate a string to at most `max_chars` characters, replacing the final
/// character with `…` when truncation happens.
///
/// Operates on character boundaries, so multi-byte UTF-8 (emoji, CJK) is safe.
/// The result never exceeds `max_chars` characters, ellipsis included — this
/// matters because callers count the output against a message budget.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

/// Escape the five HTML-special characters for Telegram `parse_mode: HTML`.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn number_of_digits(n: f64) -> i64 {
    let d = n.abs().log10().floor();
    if d.is_finite() && d > 0.0 {
        d as i64 + 1
    } else {
        1
    }
}

/// Format a number compactly with thousands-group units (`k`, `M`, `B`, `T`),
/// keeping at most `max_decimal_places` decimals and trimming trailing zeros.
///
/// `compact_number(1_234_567.0, 1)` → `"1.2M"`.
pub fn compact_number(value: f64, max_decimal_places: i64) -> String {
    const UNITS: [&str; 5] = ["", "k", "M", "B", "T"];
    const GROUPING: i64 = 3;

    let mut n = value;
    let mut unit = 0usize;
    while number_of_digits(n) > GROUPING && unit + 1 < UNITS.len() {
        n /= 1000.0;
        unit += 1;
    }

    let decimal_places = (GROUPING - number_of_digits(n))
        .min(GROUPING - 1)
        .min(max_decimal_places)
        .max(0);
    let scale = 10f64.powi(decimal_places as i32);
    n = (n * scale).round() / scale;

    format!("{}{}", n, UNITS[unit])
}

/// Render a number as keycap emoji digits (`12` → `1️⃣2️⃣`), with the single
/// keycap-ten emoji for exactly 10.
pub fn keycap_number(n: usize) -> String {
    if n == 10 {
        return "🔟".to_string();
    }
    n.to_string()
        .chars()
        .map(|c| format!("{c}\u{fe0f}\u{20e3}"))
        .collect()
}

/// Human-readable relative age of a past timestamp ("just now", "5m ago", …).
pub fn time_ago(t: chrono::DateTime<chrono::Utc>) -> String {
    let secs = (chrono::Utc::now() - t).num_seconds().max(0);
    match secs {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Evaluate at `x` the line through `p1` and `p2`.
///
/// Used by the chat flow controller to interpolate a correction delay from the
/// trailing average send interval.
pub fn linear_y_from_x(p1: (f64, f64), p2: (f64, f64), x: f64) -> f64 {
    let gradient = (p2.1 - p1.1) / (p2.0 - p1.0);
    let intercept = p1.1 - gradient * p1.0;
    gradient * x + intercept
}

/// Infinite Fibonacci sequence of retry delays in seconds, capped at
/// `cap_secs`: 1, 1, 2, 3, 5, 8, … , cap, cap, …
pub fn fibonacci_delays(cap_secs: u64) -> impl Iterator<Item = u64> {
    let mut a: u64 = 1;
    let mut b: u64 = 1;
    std::iter::from_fn(move || {
        let current = a.min(cap_secs);
        let next = (a.saturating_add(b)).min(cap_secs);
        a = b;
        b = next;
        Some(current)
    })
}
