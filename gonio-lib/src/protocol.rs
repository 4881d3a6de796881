//! # Goniophotometer serial protocol
//!
//! The rig speaks a plain-text protocol: every token is followed by a single
//! separator character. The host sends a command (`START`, `CALIBRATE` or
//! `STOP`), the measurement start being followed by four configuration tokens.
//! The device acknowledges with `ACK`, then streams `DATA` records and closes
//! the stream with `END`. Reserved words compare case-insensitively.
//!
//! ```text
//! host   -> START,0.5,0.5,1,1,
//! device <- ACK,
//! device <- DATA,0,0,1.02,DATA,0.5,0,1.01,...,END,
//! ```

use crate::constants::{DEFAULT_SEPARATOR, FIRMWARE_SEPARATOR};
use crate::geometry::SphericalSample;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The separator and reserved words of one firmware dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub separator: char,
    pub ack: String,
    pub data: String,
    pub end: String,
    pub start: String,
    pub stop: String,
    pub calibrate: String,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR,
            ack: "ACK".to_string(),
            data: "DATA".to_string(),
            end: "END".to_string(),
            start: "START".to_string(),
            stop: "STOP".to_string(),
            calibrate: "CALIBRATE".to_string(),
        }
    }
}

impl Vocabulary {
    /// Dialect of the Arduino firmware shipped with the rig.
    pub fn firmware() -> Self {
        Self {
            separator: FIRMWARE_SEPARATOR,
            ack: "ACK".to_string(),
            data: "DAT".to_string(),
            end: "END".to_string(),
            start: "STR".to_string(),
            stop: "STP".to_string(),
            calibrate: "CAL".to_string(),
        }
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Classifies an inbound token.
    pub fn classify<'a>(&self, token: &'a str) -> Token<'a> {
        if token.eq_ignore_ascii_case(&self.ack) {
            Token::Ack
        } else if token.eq_ignore_ascii_case(&self.data) {
            Token::Data
        } else if token.eq_ignore_ascii_case(&self.end) {
            Token::End
        } else {
            Token::Field(token)
        }
    }

    pub fn is_ack(&self, token: &str) -> bool {
        matches!(self.classify(token), Token::Ack)
    }

    /// Wire spelling of an outbound command.
    pub fn command(&self, command: Command) -> &str {
        match command {
            Command::Start => &self.start,
            Command::Calibrate => &self.calibrate,
            Command::Stop => &self.stop,
        }
    }
}

/// An inbound token after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Ack,
    Data,
    End,
    /// Numeric payload or anything unrecognised
    Field(&'a str),
}

/// Outbound commands.
///
/// The spelling on the wire comes from [`Vocabulary::command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Calibrate,
    Stop,
}

/// Stepper configuration sent after `START`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Polar sampling resolution, degrees per sample
    pub res_theta: f32,
    /// Azimuth sampling resolution, degrees per sample
    pub res_phi: f32,
    /// Polar motor, degrees per step
    pub dps_theta: f32,
    /// Azimuth motor, degrees per step
    pub dps_phi: f32,
}

impl ScanConfig {
    /// Motor steps between two polar samples, truncated.
    pub fn steps_per_sample_theta(&self) -> i64 {
        (self.res_theta / self.dps_theta) as i64
    }

    /// Motor steps between two azimuth samples, truncated.
    pub fn steps_per_sample_phi(&self) -> i64 {
        (self.res_phi / self.dps_phi) as i64
    }

    /// The four configuration tokens in firmware order.
    pub fn tokens(&self) -> [String; 4] {
        [
            self.dps_theta.to_string(),
            self.dps_phi.to_string(),
            self.steps_per_sample_theta().to_string(),
            self.steps_per_sample_phi().to_string(),
        ]
    }
}

/// Converts raw sensor readings (volts) into luminous intensity (candela).
///
/// `I = max(raw − offset, 0) · volts_to_lux · distance²`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityConversion {
    /// Dark offset measured by calibration, volts
    pub offset_v: f64,
    /// Sensor gain, lux per volt
    pub volts_to_lux: f64,
    /// Source-to-sensor distance, metres
    pub distance_m: f64,
}

impl Default for IntensityConversion {
    fn default() -> Self {
        Self {
            offset_v: 0.0,
            volts_to_lux: 1.0,
            distance_m: 1.0,
        }
    }
}

impl IntensityConversion {
    pub fn apply(&self, raw: f64) -> f64 {
        (raw - self.offset_v).max(0.0) * self.volts_to_lux * self.distance_m * self.distance_m
    }
}

/// A complete record decoded from the stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Record {
    Sample(SphericalSample),
    Offset(f64),
}

/// Why a record was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    /// Index of the DATA token that opened the record
    pub position: usize,
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record at token {}: {}", self.position, self.reason)
    }
}

/// Result of feeding one token to the [`RecordParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Token consumed, nothing complete yet
    Pending,
    Record(Record),
    Malformed(MalformedRecord),
    Ack,
    End,
    /// A payload token outside any record
    Stray,
}

/// Record layout expected after `DATA`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordLayout {
    /// polar, azimuth, raw value
    Measurement(IntensityConversion),
    /// dark offset
    Calibration,
}

impl RecordLayout {
    pub fn fields(&self) -> usize {
        match self {
            RecordLayout::Measurement(_) => crate::constants::MEASURE_RECORD_FIELDS,
            RecordLayout::Calibration => crate::constants::CALIBRATION_RECORD_FIELDS,
        }
    }
}

/// Incremental decoder for `DATA` records.
///
/// Records may straddle frame boundaries, so the parser keeps the fields of
/// the open record between calls. A reserved word arriving before the record
/// is complete closes it as malformed and is then processed normally.
#[derive(Debug)]
pub struct RecordParser {
    vocabulary: Vocabulary,
    layout: RecordLayout,
    position: usize,
    open: Option<OpenRecord>,
}

#[derive(Debug)]
struct OpenRecord {
    position: usize,
    fields: Vec<String>,
}

impl RecordParser {
    pub fn new(vocabulary: Vocabulary, layout: RecordLayout) -> Self {
        Self {
            vocabulary,
            layout,
            position: 0,
            open: None,
        }
    }

    /// Feeds one token, returning what it completed.
    ///
    /// When a reserved word interrupts an open record both outcomes matter,
    /// so they are returned in order.
    pub fn push(&mut self, token: &str) -> Vec<Parsed> {
        let position = self.position;
        self.position += 1;

        let kind = self.vocabulary.classify(token);
        if let Token::Field(value) = kind {
            let Some(open) = self.open.as_mut() else {
                return vec![Parsed::Stray];
            };
            open.fields.push(value.to_string());
            if open.fields.len() < self.layout.fields() {
                return vec![Parsed::Pending];
            }
            return match self.open.take() {
                Some(open) => vec![self.decode(open)],
                None => vec![Parsed::Pending],
            };
        }

        let mut out = Vec::with_capacity(2);
        if let Some(open) = self.open.take() {
            out.push(Parsed::Malformed(MalformedRecord {
                position: open.position,
                reason: format!(
                    "expected {} fields, got {} before '{}'",
                    self.layout.fields(),
                    open.fields.len(),
                    token
                ),
            }));
        }
        match kind {
            Token::Data => {
                self.open = Some(OpenRecord {
                    position,
                    fields: Vec::with_capacity(self.layout.fields()),
                });
                out.push(Parsed::Pending);
            }
            Token::Ack => out.push(Parsed::Ack),
            Token::End => out.push(Parsed::End),
            Token::Field(_) => out.push(Parsed::Stray),
        }
        out
    }

    /// Closes the stream; an unfinished record is reported as malformed.
    pub fn finish(&mut self) -> Option<MalformedRecord> {
        self.open.take().map(|open| MalformedRecord {
            position: open.position,
            reason: format!(
                "stream ended after {} of {} fields",
                open.fields.len(),
                self.layout.fields()
            ),
        })
    }

    fn decode(&self, open: OpenRecord) -> Parsed {
        let mut values = Vec::with_capacity(open.fields.len());
        for field in &open.fields {
            match field.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => values.push(v),
                _ => {
                    return Parsed::Malformed(MalformedRecord {
                        position: open.position,
                        reason: format!("non-numeric field '{}'", field),
                    });
                }
            }
        }
        match (self.layout, values.as_slice()) {
            (RecordLayout::Measurement(conversion), &[polar, azimuth, raw]) => {
                Parsed::Record(Record::Sample(SphericalSample::new(
                    polar as f32,
                    azimuth as f32,
                    conversion.apply(raw),
                )))
            }
            (RecordLayout::Calibration, &[offset]) => Parsed::Record(Record::Offset(offset)),
            _ => Parsed::Malformed(MalformedRecord {
                position: open.position,
                reason: format!("unexpected field count {}", values.len()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut RecordParser, stream: &str) -> Vec<Parsed> {
        stream
            .split(',')
            .filter(|t| !t.is_empty())
            .flat_map(|t| parser.push(t))
            .filter(|p| *p != Parsed::Pending)
            .collect()
    }

    #[test]
    fn classify_is_case_insensitive() {
        let vocab = Vocabulary::default();
        assert_eq!(vocab.classify("ack"), Token::Ack);
        assert_eq!(vocab.classify("Data"), Token::Data);
        assert_eq!(vocab.classify("END"), Token::End);
        assert_eq!(vocab.classify("12.5"), Token::Field("12.5"));
    }

    #[test]
    fn firmware_dialect_uses_short_words() {
        let vocab = Vocabulary::firmware();
        assert_eq!(vocab.separator, ';');
        assert_eq!(vocab.classify("dat"), Token::Data);
        assert_eq!(vocab.command(Command::Start), "STR");
        assert_eq!(vocab.command(Command::Stop), "STP");
    }

    #[test]
    fn scan_config_truncates_steps() {
        let scan = ScanConfig {
            res_theta: 1.0,
            res_phi: 2.0,
            dps_theta: 0.3,
            dps_phi: 0.5,
        };
        assert_eq!(scan.tokens(), ["0.3", "0.5", "3", "4"].map(String::from));
    }

    #[test]
    fn conversion_clamps_below_offset() {
        let conversion = IntensityConversion {
            offset_v: 0.2,
            volts_to_lux: 10.0,
            distance_m: 2.0,
        };
        assert_eq!(conversion.apply(0.1), 0.0);
        assert!((conversion.apply(1.2) - 40.0).abs() < 1e-12);
    }

    #[test]
    fn parses_measurement_records() {
        let mut parser = RecordParser::new(
            Vocabulary::default(),
            RecordLayout::Measurement(IntensityConversion::default()),
        );
        let parsed = feed(&mut parser, "DATA,10,0,5.0,DATA,10,90,5.0,END,");
        assert_eq!(
            parsed,
            vec![
                Parsed::Record(Record::Sample(SphericalSample::new(10.0, 0.0, 5.0))),
                Parsed::Record(Record::Sample(SphericalSample::new(10.0, 90.0, 5.0))),
                Parsed::End,
            ]
        );
        assert!(parser.finish().is_none());
    }

    #[test]
    fn records_survive_split_frames() {
        let mut parser = RecordParser::new(
            Vocabulary::default(),
            RecordLayout::Measurement(IntensityConversion::default()),
        );
        assert!(feed(&mut parser, "DATA,10,").is_empty());
        let parsed = feed(&mut parser, "0,5.0,");
        assert_eq!(
            parsed,
            vec![Parsed::Record(Record::Sample(SphericalSample::new(10.0, 0.0, 5.0)))]
        );
    }

    #[test]
    fn short_record_is_malformed_and_next_one_parses() {
        let mut parser = RecordParser::new(
            Vocabulary::default(),
            RecordLayout::Measurement(IntensityConversion::default()),
        );
        let parsed = feed(&mut parser, "DATA,10,0,DATA,20,0,1.5,");
        assert!(matches!(&parsed[0], Parsed::Malformed(m) if m.position == 0));
        assert_eq!(
            parsed[1],
            Parsed::Record(Record::Sample(SphericalSample::new(20.0, 0.0, 1.5)))
        );
    }

    #[test]
    fn non_numeric_field_is_malformed() {
        let mut parser = RecordParser::new(
            Vocabulary::default(),
            RecordLayout::Measurement(IntensityConversion::default()),
        );
        let parsed = feed(&mut parser, "DATA,ten,0,5.0,");
        assert!(matches!(&parsed[0], Parsed::Malformed(m) if m.reason.contains("ten")));
    }

    #[test]
    fn unfinished_record_reported_on_finish() {
        let mut parser = RecordParser::new(Vocabulary::default(), RecordLayout::Calibration);
        assert!(feed(&mut parser, "DATA,").is_empty());
        assert!(parser.finish().is_some());
    }

    #[test]
    fn calibration_records_carry_one_offset() {
        let mut parser = RecordParser::new(Vocabulary::default(), RecordLayout::Calibration);
        let parsed = feed(&mut parser, "DATA,0.042,END,");
        assert_eq!(parsed, vec![Parsed::Record(Record::Offset(0.042)), Parsed::End]);
    }
}
