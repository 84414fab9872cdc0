use std::fmt;

/// Fee amounts are integer cents so sums over many fee rows stay exact.
/// 1 unit = 100 cents, so a tuition fee of 1250.00 is 125000 cents.
pub type Cents = i64;

/// Render cents as a decimal amount.
/// Example: 125000 -> "1250.00", -1234 -> "-12.34"
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs_cents = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs_cents / 100, abs_cents % 100)
}

/// Parse a decimal amount typed by a bursar into cents.
/// Example: "1250.00" -> 125000, "12.5" -> 1250, "300" -> 30000
pub fn parse_cents(input: &str) -> Result<Cents, ParseCentsError> {
    let input = input.trim();
    let (negative, digits) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };

    let (grouped_units, decimal_str) = match digits.split_once('.') {
        Some((units, decimals)) => {
            if decimals.contains('.') {
                return Err(ParseCentsError::InvalidFormat);
            }
            (units, decimals)
        }
        None => (digits, ""),
    };
    let units_str = strip_group_separators(grouped_units)?;
    let units_str = units_str.as_str();

    if units_str.is_empty() && decimal_str.is_empty() {
        return Err(ParseCentsError::InvalidFormat);
    }

    if !units_str.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseCentsError::InvalidFormat);
    }

    let units: i64 = if units_str.is_empty() {
        0
    } else {
        units_str
            .parse()
            .map_err(|_| ParseCentsError::InvalidFormat)?
    };

    if !decimal_str.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseCentsError::InvalidFormat);
    }

    // Sub-cent digits are dropped
    let decimal_cents: i64 = match decimal_str.len() {
        0 => 0,
        1 => decimal_str.parse::<i64>().map_err(|_| ParseCentsError::InvalidFormat)? * 10,
        _ => decimal_str[..2]
            .parse()
            .map_err(|_| ParseCentsError::InvalidFormat)?,
    };

    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(decimal_cents))
        .ok_or(ParseCentsError::Overflow)?;
    Ok(if negative { -cents } else { cents })
}

/// Commas are only accepted between groups of three digits ("1,250,000").
fn strip_group_separators(units: &str) -> Result<String, ParseCentsError> {
    if !units.contains(',') {
        return Ok(units.to_string());
    }

    let mut groups = units.split(',');
    let leading = groups.next().unwrap_or_default();
    if leading.is_empty() || leading.len() > 3 {
        return Err(ParseCentsError::InvalidFormat);
    }

    let mut plain = leading.to_string();
    for group in groups {
        if group.len() != 3 || !group.chars().all(|c| c.is_ascii_digit()) {
            return Err(ParseCentsError::InvalidFormat);
        }
        plain.push_str(group);
    }
    Ok(plain)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseCentsError {
    InvalidFormat,
    Overflow,
}

impl fmt::Display for ParseCentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseCentsError::InvalidFormat => write!(f, "invalid money format"),
            ParseCentsError::Overflow => write!(f, "amount is too large"),
        }
    }
}

impl std::error::Error for ParseCentsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(125000), "1250.00");
        assert_eq!(format_cents(1234), "12.34");
        assert_eq!(format_cents(1), "0.01");
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(-1), "-0.01");
        assert_eq!(format_cents(-5000), "-50.00");
    }

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("1250.00"), Ok(125000));
        assert_eq!(parse_cents("1,250.00"), Ok(125000));
        assert_eq!(parse_cents("1,250,000"), Ok(125000000));
        assert_eq!(parse_cents("300"), Ok(30000));
        assert_eq!(parse_cents("12.5"), Ok(1250));
        assert_eq!(parse_cents(".75"), Ok(75));
        assert_eq!(parse_cents("-20"), Ok(-2000));
        assert_eq!(parse_cents("10.999"), Ok(1099));
    }

    #[test]
    fn test_parse_cents_invalid() {
        assert_eq!(parse_cents("fees"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("1.2.3"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("."), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("1.x0"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("--5"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("-+5"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("1,0.00"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents(",500"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(parse_cents("1250.0,0"), Err(ParseCentsError::InvalidFormat));
        assert_eq!(
            parse_cents("99999999999999999999"),
            Err(ParseCentsError::InvalidFormat)
        );
        assert_eq!(
            parse_cents("92233720368547759"),
            Err(ParseCentsError::Overflow)
        );
    }
}
