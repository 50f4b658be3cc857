//! Columns of the weather analytics table.
//!
//! Partition columns are projected from object paths, so they cost nothing
//! to read. Payload columns are addressed by dot path into the validated
//! payload; a path not listed here does not exist.

use std::fmt;

use chrono::SecondsFormat;
use fitted_weather::partition::{DATE_COLUMN, DIMENSION_COLUMN};
use fitted_weather::{StoredRecord, WeatherPayload};

use crate::value::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Date,
    Text,
    Timestamp,
    Integer,
    Float,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// A leaf field of the payload schema
pub struct PayloadField {
    pub path: &'static str,
    pub ty: ColumnType,
    read: fn(&WeatherPayload) -> Scalar,
}

impl PartialEq for PayloadField {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl fmt::Debug for PayloadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

static PAYLOAD_FIELDS: &[PayloadField] = &[
    // location
    PayloadField {
        path: "payload.location.name",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.location.name),
    },
    PayloadField {
        path: "payload.location.region",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.location.region),
    },
    PayloadField {
        path: "payload.location.country",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.location.country),
    },
    PayloadField {
        path: "payload.location.lat",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.location.lat),
    },
    PayloadField {
        path: "payload.location.lon",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.location.lon),
    },
    PayloadField {
        path: "payload.location.tz_id",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.location.tz_id),
    },
    PayloadField {
        path: "payload.location.localtime_epoch",
        ty: ColumnType::Integer,
        read: |p| Scalar::Int(p.location.localtime_epoch),
    },
    PayloadField {
        path: "payload.location.localtime",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.location.localtime),
    },
    // current
    PayloadField {
        path: "payload.current.last_updated_epoch",
        ty: ColumnType::Integer,
        read: |p| Scalar::Int(p.current.last_updated_epoch),
    },
    PayloadField {
        path: "payload.current.last_updated",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.current.last_updated),
    },
    PayloadField {
        path: "payload.current.temp_c",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.temp_c),
    },
    PayloadField {
        path: "payload.current.temp_f",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.temp_f),
    },
    PayloadField {
        path: "payload.current.is_day",
        ty: ColumnType::Integer,
        read: |p| Scalar::Int(p.current.is_day.into()),
    },
    PayloadField {
        path: "payload.current.wind_mph",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.wind_mph),
    },
    PayloadField {
        path: "payload.current.wind_kph",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.wind_kph),
    },
    PayloadField {
        path: "payload.current.humidity",
        ty: ColumnType::Integer,
        read: |p| Scalar::Int(p.current.humidity.into()),
    },
    PayloadField {
        path: "payload.current.cloud",
        ty: ColumnType::Integer,
        read: |p| Scalar::Int(p.current.cloud.into()),
    },
    PayloadField {
        path: "payload.current.feelslike_c",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.feelslike_c),
    },
    PayloadField {
        path: "payload.current.feelslike_f",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.feelslike_f),
    },
    PayloadField {
        path: "payload.current.uv",
        ty: ColumnType::Float,
        read: |p| Scalar::Float(p.current.uv),
    },
    // current.condition
    PayloadField {
        path: "payload.current.condition.text",
        ty: ColumnType::Text,
        read: |p| Scalar::text(&p.current.condition.text),
    },
    PayloadField {
        path: "payload.current.condition.icon",
        ty: ColumnType::Text,
        read: |p| p.current.condition.icon.as_deref().map_or(Scalar::Null, Scalar::text),
    },
    PayloadField {
        path: "payload.current.condition.code",
        ty: ColumnType::Integer,
        read: |p| Scalar::Int(p.current.condition.code.into()),
    },
];

/// Friendlier names for common fields
const ALIASES: &[(&str, &str)] = &[
    ("payload.current.temperature", "payload.current.temp_c"),
    ("payload.current.feels_like", "payload.current.feelslike_c"),
];

const KIND_COLUMN: &str = "kind";
const FETCHED_AT_COLUMN: &str = "fetched_at";
const OBSERVED_AT_COLUMN: &str = "observed_at";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    /// Partition date
    Dt,
    /// Partition dimension (normalized location key)
    Location,
    /// Partition type: `current` or `forecast-{N}d`
    Kind,
    FetchedAt,
    ObservedAt,
    Payload(&'static PayloadField),
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::Dt => DATE_COLUMN,
            Field::Location => DIMENSION_COLUMN,
            Field::Kind => KIND_COLUMN,
            Field::FetchedAt => FETCHED_AT_COLUMN,
            Field::ObservedAt => OBSERVED_AT_COLUMN,
            Field::Payload(field) => field.path,
        }
    }

    pub fn ty(&self) -> ColumnType {
        match self {
            Field::Dt => ColumnType::Date,
            Field::Location | Field::Kind => ColumnType::Text,
            Field::FetchedAt | Field::ObservedAt => ColumnType::Timestamp,
            Field::Payload(field) => field.ty,
        }
    }

    /// Whether the value comes from the object path alone
    pub fn is_partition_column(&self) -> bool {
        matches!(self, Field::Dt | Field::Location | Field::Kind)
    }

    pub fn read(&self, row: &StoredRecord) -> Scalar {
        match self {
            Field::Dt => Scalar::Text(row.partition.dt.to_string()),
            Field::Location => Scalar::text(&row.partition.location),
            Field::Kind => Scalar::Text(row.partition.kind.to_string()),
            Field::FetchedAt => {
                Scalar::Text(row.record.fetched_at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Field::ObservedAt => {
                Scalar::Text(row.record.observed_at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Field::Payload(field) => (field.read)(&row.record.payload),
        }
    }
}

/// Resolve a lowercase dot path to a column.
pub fn lookup(path: &str) -> Option<Field> {
    let path = ALIASES
        .iter()
        .find(|(alias, _)| *alias == path)
        .map_or(path, |(_, target)| *target);

    match path {
        DATE_COLUMN => Some(Field::Dt),
        DIMENSION_COLUMN | "dimension" => Some(Field::Location),
        KIND_COLUMN => Some(Field::Kind),
        FETCHED_AT_COLUMN => Some(Field::FetchedAt),
        OBSERVED_AT_COLUMN => Some(Field::ObservedAt),
        _ => PAYLOAD_FIELDS
            .iter()
            .find(|field| field.path == path)
            .map(Field::Payload),
    }
}

/// Columns produced by `SELECT *`: partition and record columns followed by
/// the flattened current conditions.
pub fn wildcard_columns() -> Vec<Field> {
    let mut columns = vec![
        Field::Dt,
        Field::Location,
        Field::Kind,
        Field::FetchedAt,
        Field::ObservedAt,
    ];
    columns.extend(
        PAYLOAD_FIELDS
            .iter()
            .filter(|field| field.path.starts_with("payload.current."))
            .map(Field::Payload),
    );
    columns
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn test_partition_columns() {
        assert_eq!(lookup("dt"), Some(Field::Dt));
        assert_eq!(lookup("location"), Some(Field::Location));
        assert_eq!(lookup("dimension"), Some(Field::Location));
        assert!(lookup("dt").unwrap().is_partition_column());
        assert!(!lookup("fetched_at").unwrap().is_partition_column());
    }

    #[test]
    fn test_aliases_resolve_to_canonical_fields() {
        let field = lookup("payload.current.temperature").unwrap();
        assert_eq!(field.name(), "payload.current.temp_c");
        assert!(field.ty().is_numeric());
        assert_eq!(
            lookup("payload.current.feels_like").unwrap().name(),
            "payload.current.feelslike_c"
        );
    }

    #[test]
    fn test_unknown_paths_do_not_resolve() {
        assert_eq!(lookup("payload.current.temprature"), None);
        assert_eq!(lookup("payload.current"), None);
        assert_eq!(lookup("payload.forecast.forecastday"), None);
        assert_eq!(lookup("temp_c"), None);
    }

    #[test]
    fn test_wildcard_columns() {
        let columns = wildcard_columns();
        assert_eq!(columns[0], Field::Dt);
        assert!(columns.iter().any(|c| c.name() == "payload.current.condition.text"));
        assert!(!columns.iter().any(|c| c.name().starts_with("payload.location.")));
    }
}
