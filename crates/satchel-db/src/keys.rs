//! Canonical index key forms and the string utilities behind them.

use satchel_document::Value;
use unicode_normalization::UnicodeNormalization;

/// Width of the integer part of a number key, in decimal digits.
const INT_DIGITS: usize = 16;
/// Width of the fraction part.
const FRAC_DIGITS: usize = 8;

/// Sortable decimal ASCII form of a number: sign byte, fixed-width
/// integer digits, fixed-width fraction digits. Negative values use
/// nines-complement digits so plain byte comparison is numeric order.
pub fn number_key(v: f64) -> Vec<u8> {
    let negative = v.is_sign_negative() && v != 0.0;
    let magnitude = v.abs();
    let int_max = 10f64.powi(INT_DIGITS as i32) - 1.0;
    let clamped = magnitude.min(int_max);
    let int_part = clamped.trunc() as u64;
    let frac_part = ((clamped - clamped.trunc()) * 10f64.powi(FRAC_DIGITS as i32)).round() as u64;
    let frac_max = 10u64.pow(FRAC_DIGITS as u32) - 1;
    let frac_part = frac_part.min(frac_max);

    let mut key = Vec::with_capacity(1 + INT_DIGITS + FRAC_DIGITS);
    key.push(if negative { b'0' } else { b'1' });
    key.extend_from_slice(format!("{int_part:016}").as_bytes());
    key.extend_from_slice(format!("{frac_part:08}").as_bytes());
    if negative {
        for digit in &mut key[1..] {
            *digit = b'9' - (*digit - b'0');
        }
    }
    key
}

/// Unicode case-fold then NFC-normalize, the canonical form behind
/// `$icase` comparisons and istring index keys.
pub fn fold_case(s: &str) -> String {
    s.chars()
        .flat_map(char::to_lowercase)
        .nfc()
        .collect()
}

/// Numeric view of a value for number-index purposes; strings that
/// parse as decimal numbers coerce.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    }
}

/// Tokens of a value for array-token indexing and `$strand`/`$stror`:
/// array elements, or whitespace-split words of a string.
pub fn tokenize(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Int32(_) | Value::Int64(_) | Value::Double(_) => {
                    item.as_f64().map(format_number)
                }
                _ => None,
            })
            .collect(),
        Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_keys_order_like_numbers() {
        let values = [
            -1_000_000.5,
            -100.0,
            -2.0,
            -0.5,
            0.0,
            0.25,
            2.0,
            100.0,
            99999.75,
        ];
        for pair in values.windows(2) {
            assert!(
                number_key(pair[0]) < number_key(pair[1]),
                "{} should order below {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn number_keys_are_fixed_width_and_equal_for_equal_values() {
        assert_eq!(number_key(5.0).len(), 1 + INT_DIGITS + FRAC_DIGITS);
        assert_eq!(number_key(5.0), number_key(5.0));
        assert_eq!(number_key(0.0), number_key(-0.0));
    }

    #[test]
    fn fold_case_lowers_and_normalizes() {
        assert_eq!(fold_case("HeLLo"), "hello");
        assert_eq!(fold_case("ÅNGSTRÖM"), fold_case("ångström"));
    }

    #[test]
    fn tokenize_arrays_and_strings() {
        let arr = Value::Array(vec![
            Value::String("rust".into()),
            Value::Int32(7),
            Value::Null,
        ]);
        assert_eq!(tokenize(&arr), vec!["rust".to_string(), "7".to_string()]);
        let s = Value::String("alpha  beta\tgamma".into());
        assert_eq!(tokenize(&s), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn coerce_number_accepts_numeric_strings() {
        assert_eq!(coerce_number(&Value::String(" 42.5 ".into())), Some(42.5));
        assert_eq!(coerce_number(&Value::Int64(7)), Some(7.0));
        assert_eq!(coerce_number(&Value::String("nope".into())), None);
    }
}
