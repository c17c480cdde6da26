/// SI decimal prefixes, smallest first.
const SI_PREFIXES: [(&str, f64); 11] = [
    ("", 1e0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("Z", 1e21),
    ("Y", 1e24),
    ("R", 1e27),
    ("Q", 1e30),
];

pub const DEFAULT_PRECISION: u32 = 2;

/// Render `value` with the largest SI prefix that keeps it below 1000.
///
/// The scaled value is rounded up (never to nearest) at `precision` decimal
/// digits, so `999.001` prints as `999.01`. Values beyond the last prefix keep
/// the last prefix.
#[must_use]
pub fn format_si(value: f64, unit: &str, precision: u32) -> String {
    let mut size = value;
    let mut prefix = "";
    for (candidate, divisor) in SI_PREFIXES {
        size = value / divisor;
        prefix = candidate;
        if size < 1000.0 {
            break;
        }
    }

    let scale = 10f64.powi(precision as i32);
    let rounded = snap_to_integer(size * scale).ceil() / scale;
    format!("{rounded}{prefix}{unit}")
}

// Binary floats turn exact decimals like 1.1 * 100 into 110.00000000000001;
// pull such values back onto the integer before taking the ceiling.
fn snap_to_integer(scaled: f64) -> f64 {
    let nearest = scaled.round();
    if (scaled - nearest).abs() <= scaled.abs() * 1e-12 {
        nearest
    } else {
        scaled
    }
}

#[must_use]
pub fn format_si_default(value: f64, unit: &str) -> String {
    format_si(value, unit, DEFAULT_PRECISION)
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format_si_default(bytes_per_sec, "B/s")
}

/// Compute upload progress as a fraction in `0.0..=1.0`.
#[must_use]
pub fn progress_fraction(loaded: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(total) if total > 0 => Some((loaded as f32 / total as f32).clamp(0.0, 1.0)),
        Some(_) => Some(1.0),
        None => None,
    }
}
