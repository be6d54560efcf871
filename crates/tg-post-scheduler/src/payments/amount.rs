use std::fmt;
use std::str::FromStr;

/// Non-negative amount of US dollars with cent precision.
/// Stored in the database as its display string, e.g. `5.00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct UsdAmount {
    cents: u64,
}

impl UsdAmount {
    pub(crate) const fn from_cents(cents: u64) -> Self {
        Self { cents }
    }

    /// Some APIs want a JSON number. Cents are well within the range
    /// where `f64` is exact.
    pub(crate) fn as_f64(self) -> f64 {
        self.cents as f64 / 100.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid USD amount `{input}`, expected a number with at most two decimal places")]
pub(crate) struct ParseUsdAmountError {
    input: String,
}

impl FromStr for UsdAmount {
    type Err = ParseUsdAmountError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseUsdAmountError {
            input: input.to_owned(),
        };

        let (dollars, fraction) = input.trim().split_once('.').unwrap_or((input.trim(), ""));

        let is_digits = |s: &str| s.bytes().all(|byte| byte.is_ascii_digit());

        if dollars.is_empty() || !is_digits(dollars) || !is_digits(fraction) || fraction.len() > 2
        {
            return Err(invalid());
        }

        let dollars: u64 = dollars.parse().map_err(|_| invalid())?;

        let cents = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse::<u64>().map_err(|_| invalid())?,
        };

        dollars
            .checked_mul(100)
            .and_then(|total| total.checked_add(cents))
            .map(Self::from_cents)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}
