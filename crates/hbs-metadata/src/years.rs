//! Year specifications and table availability.

use hbs_model::{HbsError, Result};
use serde::{Deserialize, Serialize};

use crate::context::MetadataContext;
use crate::number_set::{NumberSet, RangeOptions};
use crate::value::MetaValue;

/// First and last survey year, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveySpan {
    pub first_year: i64,
    pub last_year: i64,
}

impl SurveySpan {
    pub fn new(first_year: i64, last_year: i64) -> Self {
        Self {
            first_year,
            last_year,
        }
    }

    pub fn contains(&self, year: i64) -> bool {
        (self.first_year..=self.last_year).contains(&year)
    }

    pub fn years(&self) -> Vec<i64> {
        (self.first_year..=self.last_year).collect()
    }

    fn check(&self, year: i64) -> Result<i64> {
        if self.contains(year) {
            Ok(year)
        } else {
            Err(HbsError::YearOutOfRange {
                year,
                first: self.first_year,
                last: self.last_year,
            })
        }
    }
}

/// A caller's year selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YearSpec {
    Single(i64),
    List(Vec<i64>),
    /// Comma separated years and `start-end` ranges, e.g. `"1365, 80-83, 99"`.
    Text(String),
    All,
    Last,
}

impl YearSpec {
    /// Reads a `years` entry of a schema node.
    pub fn from_meta(value: &MetaValue) -> Result<Self> {
        match value {
            MetaValue::Int(year) => Ok(Self::Single(*year)),
            MetaValue::Str(text) => Ok(Self::from(text.as_str())),
            MetaValue::Seq(items) => items
                .iter()
                .map(|item| {
                    item.as_i64().ok_or_else(|| HbsError::InvalidYear {
                        value: format!("{item:?}"),
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            other => Err(HbsError::InvalidYear {
                value: format!("{other:?}"),
            }),
        }
    }
}

impl From<i64> for YearSpec {
    fn from(value: i64) -> Self {
        Self::Single(value)
    }
}

impl From<i32> for YearSpec {
    fn from(value: i32) -> Self {
        Self::Single(i64::from(value))
    }
}

impl From<Vec<i64>> for YearSpec {
    fn from(value: Vec<i64>) -> Self {
        Self::List(value)
    }
}

impl From<&[i64]> for YearSpec {
    fn from(value: &[i64]) -> Self {
        Self::List(value.to_vec())
    }
}

impl<const N: usize> From<[i64; N]> for YearSpec {
    fn from(value: [i64; N]) -> Self {
        Self::List(value.to_vec())
    }
}

impl From<&str> for YearSpec {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Self::All,
            "last" => Self::Last,
            _ => Self::Text(value.to_string()),
        }
    }
}

impl From<String> for YearSpec {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

/// Expands two- and three-digit shorthand to a full year.
///
/// `<= 60` is read as 14xx, `< 100` as 13xx, `< 1000` as 1xxx.
pub fn normalize_year(value: i64) -> i64 {
    if value <= 60 {
        value + 1400
    } else if value < 100 {
        value + 1300
    } else if value < 1000 {
        value + 1000
    } else {
        value
    }
}

/// Expands a year specification into concrete, validated years.
pub fn parse_years(spec: &YearSpec, span: &SurveySpan) -> Result<Vec<i64>> {
    match spec {
        YearSpec::Single(year) => Ok(vec![span.check(normalize_year(*year))?]),
        YearSpec::List(years) => years
            .iter()
            .map(|year| span.check(normalize_year(*year)))
            .collect(),
        YearSpec::Text(text) => parse_text(text, span),
        YearSpec::All => Ok(span.years()),
        YearSpec::Last => Ok(vec![span.last_year]),
    }
}

fn parse_text(text: &str, span: &SurveySpan) -> Result<Vec<i64>> {
    let mut years = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        match part.to_ascii_lowercase().as_str() {
            "all" => {
                years.extend(span.years());
                continue;
            }
            "last" => {
                years.push(span.last_year);
                continue;
            }
            _ => {}
        }
        if let Some((start, end)) = part.split_once('-') {
            let start = span.check(parse_part(start, text)?)?;
            let end = span.check(parse_part(end, text)?)?;
            if start > end {
                return Err(HbsError::InvalidYear {
                    value: part.to_string(),
                });
            }
            years.extend(start..=end);
        } else {
            years.push(span.check(parse_part(part, text)?)?);
        }
    }
    Ok(years)
}

fn parse_part(part: &str, whole: &str) -> Result<i64> {
    part.trim()
        .parse::<i64>()
        .map(normalize_year)
        .map_err(|_| HbsError::InvalidYear {
            value: whole.to_string(),
        })
}

/// Pairs every table with every year in which it is published.
///
/// Availability comes from `tables.yearly_table_availability`; tables
/// without an entry are available in every survey year.
pub fn construct_table_year_pairs<S: AsRef<str>>(
    table_names: &[S],
    years: &[i64],
    ctx: &MetadataContext,
) -> Result<Vec<(String, i64)>> {
    let span = ctx.span();
    let options = RangeOptions::new()
        .with_default_start(span.first_year)
        .with_default_end(span.last_year + 1);
    let availability = ctx.tables().get("yearly_table_availability");

    let mut pairs = Vec::new();
    for name in table_names {
        let name = name.as_ref();
        let available = availability
            .and_then(|entries| entries.get(name))
            .map(|spec| NumberSet::parse_with(spec, &options))
            .transpose()?;
        for &year in years {
            let keep = available.as_ref().is_none_or(|set| set.contains(year));
            if keep {
                pairs.push((name.to_string(), year));
            }
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPAN: SurveySpan = SurveySpan {
        first_year: 1363,
        last_year: 1401,
    };

    #[test]
    fn range_text_is_inclusive() {
        let years = parse_years(&YearSpec::from("1390-1400"), &SPAN).unwrap();
        assert_eq!(years.len(), 11);
        assert_eq!(years.first(), Some(&1390));
        assert_eq!(years.last(), Some(&1400));
    }

    #[test]
    fn shorthand_years_normalize() {
        assert_eq!(normalize_year(98), 1398);
        assert_eq!(normalize_year(1), 1401);
        assert_eq!(normalize_year(60), 1460);
        assert_eq!(normalize_year(399), 1399);
        assert_eq!(normalize_year(1380), 1380);
        assert_eq!(
            parse_years(&YearSpec::from("1365, 80-83, 99"), &SPAN).unwrap(),
            vec![1365, 1380, 1381, 1382, 1383, 1399]
        );
        assert_eq!(
            parse_years(&YearSpec::from(vec![98, 99, 1400]), &SPAN).unwrap(),
            vec![1398, 1399, 1400]
        );
    }

    #[test]
    fn out_of_span_years_fail() {
        let err = parse_years(&YearSpec::Single(1350), &SPAN).unwrap_err();
        assert!(matches!(
            err,
            HbsError::YearOutOfRange {
                year: 1350,
                first: 1363,
                last: 1401
            }
        ));
        assert!(parse_years(&YearSpec::from("1399-1405"), &SPAN).is_err());
    }

    #[test]
    fn malformed_text_fails() {
        for text in ["13a9", "1390-1392-1394", "1395-1390", ""] {
            let err = parse_years(&YearSpec::from(text), &SPAN).unwrap_err();
            assert!(matches!(err, HbsError::InvalidYear { .. }), "{text}");
        }
    }

    #[test]
    fn reversed_interval_is_an_error() {
        let err = parse_years(&YearSpec::from("1399-1390"), &SPAN).unwrap_err();
        assert!(matches!(err, HbsError::InvalidYear { .. }), "{err}");
        assert!(parse_years(&YearSpec::from("1390-1390"), &SPAN).is_ok());
    }

    #[test]
    fn keywords_all_and_last() {
        assert_eq!(parse_years(&YearSpec::All, &SPAN).unwrap().len(), 39);
        assert_eq!(parse_years(&YearSpec::from("last"), &SPAN).unwrap(), vec![1401]);
    }

    #[test]
    fn schema_years_from_meta() {
        let value = MetaValue::from_yaml_str("[1396, 1397]", "test").unwrap();
        assert_eq!(
            YearSpec::from_meta(&value).unwrap(),
            YearSpec::List(vec![1396, 1397])
        );
    }
}
