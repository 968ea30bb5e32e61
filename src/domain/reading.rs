use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use super::validation::{round_kw, ReadingValidator, ValidationError};
use crate::simulation::pv_profile;

/// Meter sample as it travels over the broker.
///
/// Wire form: `{"timestamp": "2023-01-01T12:00:00", "meter": 5.5}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    #[serde(with = "iso_timestamp")]
    pub timestamp: NaiveDateTime,
    /// Household consumption in kW
    pub meter: f64,
}

impl MeterReading {
    /// Build a validated reading. The meter value is rounded to two decimals.
    pub fn new(timestamp: NaiveDateTime, meter: f64) -> Result<Self, ValidationError> {
        let meter = ReadingValidator::validate_meter(meter)?;
        Ok(Self { timestamp, meter })
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a reading from a message body. The result is NOT validated.
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Derived PV/net record, the unit of persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PVRecord {
    #[serde(with = "iso_timestamp")]
    pub timestamp: NaiveDateTime,
    pub meter: f64,
    pub pv: f64,
    /// PV production minus consumption. Positive is surplus fed back to the grid.
    pub net: f64,
}

impl PVRecord {
    /// Derive the record for a received reading.
    ///
    /// PV comes from the wall-clock hour and minute of the reading's
    /// timestamp. Meter, PV and net are all re-validated here.
    pub fn derive(reading: &MeterReading) -> Result<Self, ValidationError> {
        let meter = ReadingValidator::validate_meter(reading.meter)?;
        let pv = round_kw(pv_profile(reading.timestamp.hour(), reading.timestamp.minute()));
        let net = round_kw(pv - meter);
        let (pv, net) = ReadingValidator::validate_pv_net(pv, net)?;
        Ok(Self {
            timestamp: reading.timestamp,
            meter,
            pv,
            net,
        })
    }

    /// True when `net == pv - meter` within the 0.01 kW rounding tolerance.
    pub fn is_net_consistent(&self) -> bool {
        (self.net - round_kw(self.pv - self.meter)).abs() <= 0.01 + 1e-9
    }
}

/// ISO-8601 timestamps without a zone designator, as produced by the meter.
///
/// Offset-qualified timestamps are accepted on input and reduced to their
/// local wall-clock time.
pub mod iso_timestamp {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn format(ts: &NaiveDateTime) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn parse(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        NaiveDateTime::parse_from_str(raw, FORMAT)
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.naive_local()))
    }

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_wire_format() {
        let reading = MeterReading::new(at(12, 0), 5.5).unwrap();
        let json = String::from_utf8(reading.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"timestamp":"2023-01-01T12:00:00","meter":5.5}"#);
    }

    #[test]
    fn test_decode_microsecond_timestamp() {
        let reading =
            MeterReading::from_json(br#"{"timestamp":"2024-06-21T08:15:30.123456","meter":3.21}"#)
                .unwrap();
        assert_eq!(reading.timestamp.hour(), 8);
        assert_eq!(reading.timestamp.minute(), 15);
        assert_eq!(reading.meter, 3.21);
    }

    #[test]
    fn test_decode_offset_timestamp_keeps_wall_clock() {
        let reading =
            MeterReading::from_json(br#"{"timestamp":"2024-06-21T14:45:00+02:00","meter":1.0}"#)
                .unwrap();
        assert_eq!(reading.timestamp.hour(), 14);
        assert_eq!(reading.timestamp.minute(), 45);
    }

    #[test]
    fn test_decode_rejects_missing_meter() {
        assert!(MeterReading::from_json(br#"{"timestamp":"2023-01-01T12:00:00"}"#).is_err());
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(MeterReading::new(at(12, 0), 25.0).is_err());
    }

    #[test]
    fn test_derive_at_noon() {
        let reading = MeterReading { timestamp: at(12, 0), meter: 5.5 };
        let record = PVRecord::derive(&reading).unwrap();
        assert_eq!(record.pv, 8.0);
        assert_eq!(record.net, 2.5);
        assert!(record.is_net_consistent());
    }

    #[test]
    fn test_derive_at_night_is_all_consumption() {
        let reading = MeterReading { timestamp: at(0, 0), meter: 4.2 };
        let record = PVRecord::derive(&reading).unwrap();
        assert_eq!(record.pv, 0.0);
        assert_eq!(record.net, -4.2);
    }

    #[test]
    fn test_derive_revalidates_meter() {
        // decoded readings bypass MeterReading::new
        let reading = MeterReading { timestamp: at(12, 0), meter: 25.0 };
        assert!(matches!(
            PVRecord::derive(&reading),
            Err(ValidationError::MeterOutOfRange { .. })
        ));
    }
}
