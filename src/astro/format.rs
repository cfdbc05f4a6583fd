use super::error::CoordinateError;

/// Formats RA as `HH:MM:SS.s`.
pub fn format_ra(ra_hours: f64) -> String {
    let mut tenths = (ra_hours.rem_euclid(24.0) * 36_000.0).round() as u64;
    if tenths >= 24 * 36_000 {
        tenths = 0;
    }
    let h = tenths / 36_000;
    let m = (tenths % 36_000) / 600;
    let s = (tenths % 600) as f64 / 10.0;
    format!("{:02}:{:02}:{:04.1}", h, m, s)
}

/// Formats Dec as `DD:MM:SS`, with a leading `-` south of the equator.
pub fn format_dec(dec_deg: f64) -> String {
    let (sign, d, m, s) = split_arcsec(dec_deg);
    format!("{}{:02}:{:02}:{:02}", sign, d, m, s)
}

pub fn format_coordinates(ra_hours: f64, dec_deg: f64) -> (String, String) {
    (format_ra(ra_hours), format_dec(dec_deg))
}

/// Formats an angle as `DD° MM' SS"`.
pub fn format_dms(deg: f64) -> String {
    let (sign, d, m, s) = split_arcsec(deg);
    format!("{}{:02}° {:02}' {:02}\"", sign, d, m, s)
}

fn split_arcsec(deg: f64) -> (&'static str, u64, u64, u64) {
    let total = (deg.abs() * 3600.0).round() as u64;
    let sign = if deg < 0.0 && total > 0 { "-" } else { "" };
    (sign, total / 3600, (total % 3600) / 60, total % 60)
}

/// Parses hours given as `HH:MM:SS`, `HH MM SS`, `05h12m30s` or decimal hours.
pub fn parse_hms(s: &str) -> Result<f64, CoordinateError> {
    parse_sexagesimal(s)
}

/// Parses degrees given as `DD:MM:SS`, `-DD MM SS`, `12°30'15"` or decimal degrees.
pub fn parse_dms(s: &str) -> Result<f64, CoordinateError> {
    parse_sexagesimal(s)
}

fn parse_sexagesimal(s: &str) -> Result<f64, CoordinateError> {
    let err = || CoordinateError::Parse(s.to_string());
    let trimmed = s.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let cleaned: String = body
        .chars()
        .map(|c| match c {
            ':' | 'h' | 'm' | 's' | 'd' | '°' | '\'' | '"' => ' ',
            other => other,
        })
        .collect();

    let parts = cleaned
        .split_whitespace()
        .map(|p| p.parse::<f64>().map_err(|_| err()))
        .collect::<Result<Vec<_>, _>>()?;

    let value = match parts.as_slice() {
        [v] => *v,
        [a, b] if (0.0..60.0).contains(b) => a + b / 60.0,
        [a, b, c] if (0.0..60.0).contains(b) && (0.0..60.0).contains(c) => {
            a + b / 60.0 + c / 3600.0
        }
        _ => return Err(err()),
    };

    if value < 0.0 {
        return Err(err());
    }
    Ok(if negative { -value } else { value })
}
