// amounts are exact decimals with two fractional digits, plain JSON numbers on the wire

use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, Signed, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serializer};

pub const SCALE: i64 = 2;

// rounds half away from zero to minor units
pub fn normalize(value: BigDecimal) -> BigDecimal {
    value.with_scale_round(SCALE, RoundingMode::HalfUp)
}

pub fn zero() -> BigDecimal {
    BigDecimal::zero().with_scale(SCALE)
}

pub fn is_positive(value: &BigDecimal) -> bool {
    value.is_positive()
}

pub fn parse(raw: &str) -> Option<BigDecimal> {
    BigDecimal::from_str(raw).ok().map(normalize)
}

pub fn serialize<S: Serializer>(value: &BigDecimal, serializer: S) -> Result<S::Ok, S::Error> {
    match value.to_f64() {
        Some(f) => serializer.serialize_f64(f),
        None => Err(serde::ser::Error::custom(format!("amount {value} is out of range"))),
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigDecimal, D::Error> {
    let number = serde_json::Number::deserialize(deserializer)?;
    parse(&number.to_string()).ok_or_else(|| serde::de::Error::custom(format!("invalid amount {number}")))
}

pub mod option {
    use bigdecimal::BigDecimal;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<BigDecimal>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<BigDecimal>, D::Error> {
        let number = Option::<serde_json::Number>::deserialize(deserializer)?;
        match number {
            Some(number) => super::parse(&number.to_string())
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid amount {number}"))),
            None => Ok(None),
        }
    }
}
