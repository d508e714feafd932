use chrono::{Datelike, Days, Local, Months, NaiveDate};
use lazy_static::lazy_static;
use log::debug;
use regex::{Captures, Regex};
use thiserror::Error;

// Matches `{{ name }}` and `{{ name (arg) }}`, the argument part is validated
// separately so that broken brackets end up as an error instead of being
// left in place.
lazy_static! {
    static ref EXPRESSION_RE: Regex = Regex::new(
        r"\{\{\s*(energomera_prev_month|energomera_prev_day)\b\s*(.*?)\s*\}\}"
    ).expect("expression regex must compile");
}

#[derive(Error, Debug, PartialEq)]
pub enum ExpressionError {
    #[error("Malformed argument '{arg}' to expression '{name}'")]
    MalformedArgument { name: String, arg: String },
    #[error("Non-numeric argument '{arg}' to expression '{name}'")]
    NonNumericArgument { name: String, arg: String },
    #[error("Argument {arg} to expression '{name}' goes beyond supported dates")]
    OutOfRange { name: String, arg: u32 },
}

/// Supported expressions, all resolve relative to a given day.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Expression {
    /// `energomera_prev_month`: N months before the current one, `MM.YY`
    PrevMonth,
    /// `energomera_prev_day`: N days before today, `DD.MM.YY`
    PrevDay,
}

impl Expression {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "energomera_prev_month" => Some(Expression::PrevMonth),
            "energomera_prev_day" => Some(Expression::PrevDay),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Expression::PrevMonth => "energomera_prev_month",
            Expression::PrevDay => "energomera_prev_day",
        }
    }

    fn evaluate(&self, today: NaiveDate, count: u32) -> Result<String, ExpressionError> {
        let out_of_range = || ExpressionError::OutOfRange { name: self.name().to_string(), arg: count };

        match self {
            Expression::PrevMonth => {
                let first = today.with_day(1).ok_or_else(out_of_range)?;
                let date = first.checked_sub_months(Months::new(count)).ok_or_else(out_of_range)?;
                return Ok(date.format("%m.%y").to_string());
            }
            Expression::PrevDay => {
                let date = today.checked_sub_days(Days::new(count as u64)).ok_or_else(out_of_range)?;
                return Ok(date.format("%d.%m.%y").to_string());
            }
        }
    }
}

/// Parses the optional `(N)` part following the expression name. Missing or
/// empty argument means 1.
fn parse_argument(expression: Expression, raw: &str) -> Result<u32, ExpressionError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(1);
    }

    let inner = raw.strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| ExpressionError::MalformedArgument {
            name: expression.name().to_string(),
            arg: raw.to_string(),
        })?;

    let inner = inner.trim();
    if inner.is_empty() {
        return Ok(1);
    }

    // Nested or stray brackets, e.g. `((2)` or `(2))`
    if inner.contains('(') || inner.contains(')') {
        return Err(ExpressionError::MalformedArgument {
            name: expression.name().to_string(),
            arg: raw.to_string(),
        });
    }

    inner.parse::<u32>().map_err(|_| ExpressionError::NonNumericArgument {
        name: expression.name().to_string(),
        arg: inner.to_string(),
    })
}

/// Replaces every recognized expression in `text` using `today` as the
/// reference date. Nothing is substituted if any expression fails.
pub fn interpolate_at(text: &str, today: NaiveDate) -> Result<String, ExpressionError> {
    let mut failure: Option<ExpressionError> = None;

    let result = EXPRESSION_RE.replace_all(text, |caps: &Captures| {
        if failure.is_some() {
            return String::new();
        }

        // The regex only captures known names
        let expression = match Expression::from_name(&caps[1]) {
            Some(e) => e,
            None => return caps[0].to_string(),
        };

        match parse_argument(expression, &caps[2]).and_then(|count| expression.evaluate(today, count)) {
            Ok(value) => value,
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    });

    if let Some(e) = failure {
        return Err(e);
    }

    if result != text {
        debug!("Interpolated '{text}' into '{result}'");
    }

    return Ok(result.into_owned());
}

/// Same as [`interpolate_at`] against the local calendar date.
pub fn interpolate(text: &str) -> Result<String, ExpressionError> {
    interpolate_at(text, Local::now().date_naive())
}
