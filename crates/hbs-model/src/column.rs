use std::str::FromStr;

use crate::error::HbsError;

/// Semantic type of a cleaned survey column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Unsigned,
    Integer,
    Float,
    Category,
    String,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Unsigned => "unsigned",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Category => "category",
            Self::String => "string",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Unsigned | Self::Integer | Self::Float)
    }
}

impl FromStr for ColumnType {
    type Err = HbsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            // older metadata files spell it "boolian"
            "boolean" | "boolian" | "bool" => Ok(Self::Boolean),
            "unsigned" => Ok(Self::Unsigned),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "category" => Ok(Self::Category),
            "string" => Ok(Self::String),
            other => Err(HbsError::metadata(
                "type",
                format!("unknown column type '{other}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_spelling() {
        assert_eq!("boolian".parse::<ColumnType>().unwrap(), ColumnType::Boolean);
        assert_eq!("float".parse::<ColumnType>().unwrap(), ColumnType::Float);
        assert!("decimal".parse::<ColumnType>().is_err());
    }
}
