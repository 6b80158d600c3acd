use std::fmt;

/// Money value rendered with 2 decimal places and grouped thousands
/// (`100,000.00`).
///
/// Only used for presentation: ledger calls and requests carry plain `f64` amounts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Amount(f64);

impl Amount {
    pub fn from_float(value: f64) -> Self {
        Amount(value)
    }
}

/// Insert a comma between every group of three digits.
fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.is_finite() {
            return write!(f, "{}", self.0);
        }
        let rounded = format!("{:.2}", self.0.abs());
        let (whole, frac) = rounded.split_once('.').unwrap_or((&rounded, "00"));
        let sign = if self.0 < 0.0 && rounded != "0.00" { "-" } else { "" };
        write!(f, "{sign}{}.{frac}", group_thousands(whole))
    }
}
