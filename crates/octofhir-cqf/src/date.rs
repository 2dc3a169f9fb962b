//! Partial-precision FHIR date handling.
//!
//! A FHIR date may carry year, month, day or full instant precision. Used as a
//! range boundary it resolves to the first instant it covers (lower bound) or
//! the last one (upper bound): `2024` as an upper bound is
//! `2024-12-31T23:59:59.999Z`.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime};

use crate::error::{CqfError, CqfResult};

/// Which end of a range a boundary value stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
}

/// Resolves textual dates to concrete instants for range filters.
pub trait DateBoundaryResolver: Send + Sync {
    fn resolve(&self, value: &str, boundary: Boundary) -> CqfResult<OffsetDateTime>;
}

/// Default resolver for FHIR `date`, `dateTime` and `instant` strings.
/// Values without an offset are taken as UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct FhirDateResolver;

impl DateBoundaryResolver for FhirDateResolver {
    fn resolve(&self, value: &str, boundary: Boundary) -> CqfResult<OffsetDateTime> {
        let value = value.trim();
        let invalid = || CqfError::InvalidArgument(format!("Invalid date value: '{value}'"));

        if value.contains('T') {
            if let Ok(instant) = OffsetDateTime::parse(value, &Rfc3339) {
                return Ok(instant);
            }
            return PrimitiveDateTime::parse(
                value,
                format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
            )
            .map(PrimitiveDateTime::assume_utc)
            .map_err(|_| invalid());
        }

        let (first, last) = match value.len() {
            4 => {
                let year: i32 = value.parse().map_err(|_| invalid())?;
                let first = Date::from_calendar_date(year, Month::January, 1).map_err(|_| invalid())?;
                let last = Date::from_calendar_date(year, Month::December, 31).map_err(|_| invalid())?;
                (first, last)
            }
            7 => {
                let (year, month) = value.split_once('-').ok_or_else(invalid)?;
                let year: i32 = year.parse().map_err(|_| invalid())?;
                let month: u8 = month.parse().map_err(|_| invalid())?;
                let month = Month::try_from(month).map_err(|_| invalid())?;
                let first = Date::from_calendar_date(year, month, 1).map_err(|_| invalid())?;
                (first, last_day_of_month(first).ok_or_else(invalid)?)
            }
            10 => {
                let day = Date::parse(value, format_description!("[year]-[month]-[day]"))
                    .map_err(|_| invalid())?;
                (day, day)
            }
            _ => return Err(invalid()),
        };

        match boundary {
            Boundary::Start => Ok(first.midnight().assume_utc()),
            Boundary::End => last
                .with_hms_milli(23, 59, 59, 999)
                .map(PrimitiveDateTime::assume_utc)
                .map_err(|_| invalid()),
        }
    }
}

fn last_day_of_month(first: Date) -> Option<Date> {
    let (year, month) = match first.month() {
        Month::December => (first.year() + 1, Month::January),
        month => (first.year(), month.next()),
    };
    Date::from_calendar_date(year, month, 1).ok()?.previous_day()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_year_precision() {
        let resolver = FhirDateResolver;
        assert_eq!(
            resolver.resolve("2024", Boundary::Start).unwrap(),
            datetime!(2024-01-01 00:00:00 UTC)
        );
        assert_eq!(
            resolver.resolve("2024", Boundary::End).unwrap(),
            datetime!(2024-12-31 23:59:59.999 UTC)
        );
    }

    #[test]
    fn test_month_precision_handles_leap_years() {
        let resolver = FhirDateResolver;
        assert_eq!(
            resolver.resolve("2024-02", Boundary::End).unwrap(),
            datetime!(2024-02-29 23:59:59.999 UTC)
        );
        assert_eq!(
            resolver.resolve("2023-12", Boundary::End).unwrap(),
            datetime!(2023-12-31 23:59:59.999 UTC)
        );
    }

    #[test]
    fn test_day_and_instant_precision() {
        let resolver = FhirDateResolver;
        assert_eq!(
            resolver.resolve("2024-03-15", Boundary::Start).unwrap(),
            datetime!(2024-03-15 00:00:00 UTC)
        );
        assert_eq!(
            resolver
                .resolve("2024-03-15T10:30:00+02:00", Boundary::End)
                .unwrap(),
            datetime!(2024-03-15 08:30:00 UTC)
        );
        assert_eq!(
            resolver.resolve("2024-03-15T10:30:00", Boundary::Start).unwrap(),
            datetime!(2024-03-15 10:30:00 UTC)
        );
    }

    #[test]
    fn test_invalid_values() {
        let resolver = FhirDateResolver;
        for value in ["", "20", "2024-13", "2024-02-30", "not-a-date", "2024-01-01Tnoon"] {
            let err = resolver.resolve(value, Boundary::Start).unwrap_err();
            assert!(matches!(err, CqfError::InvalidArgument(_)), "{value}");
        }
    }
}
