use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, path::PathBuf, str::FromStr};
use uuid::Uuid;

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod scheduler;
pub mod scratch;
pub mod server;
pub mod stages;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

/// Pipeline position of an image, stored in `image.status`.
///
/// Codes count down from the first stage towards `Done`. `Uploading` is stored as
/// NULL. `Done` (1) and `Failed` (0) are fixed; the codes in between belong to
/// individual stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageStatus {
    Uploading,
    Contour,
    Sharding,
    Cutting,
    DecodingBubble,
    DecodingNumber,
    Annotation,
    Done,
    Failed,
}

impl ImageStatus {
    pub const ALL: [ImageStatus; 9] = [
        ImageStatus::Uploading,
        ImageStatus::Contour,
        ImageStatus::Sharding,
        ImageStatus::Cutting,
        ImageStatus::DecodingBubble,
        ImageStatus::DecodingNumber,
        ImageStatus::Annotation,
        ImageStatus::Done,
        ImageStatus::Failed,
    ];

    pub fn code(self) -> Option<i32> {
        match self {
            ImageStatus::Uploading => None,
            ImageStatus::Contour => Some(7),
            ImageStatus::Sharding => Some(6),
            ImageStatus::Cutting => Some(5),
            ImageStatus::DecodingBubble => Some(4),
            ImageStatus::DecodingNumber => Some(3),
            ImageStatus::Annotation => Some(2),
            ImageStatus::Done => Some(1),
            ImageStatus::Failed => Some(0),
        }
    }

    pub fn from_code(code: Option<i32>) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageStatus::Uploading => "uploading",
            ImageStatus::Contour => "contour",
            ImageStatus::Sharding => "sharding",
            ImageStatus::Cutting => "cutting",
            ImageStatus::DecodingBubble => "decoding-bubble",
            ImageStatus::DecodingNumber => "decoding-number",
            ImageStatus::Annotation => "annotation",
            ImageStatus::Done => "done",
            ImageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{} ({})", self.name(), code),
            None => write!(f, "{} (null)", self.name()),
        }
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    /// Accepts a stage name, a numeric code, or `null`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("null") {
            return Ok(ImageStatus::Uploading);
        }
        if let Ok(code) = s.parse::<i32>() {
            return Self::from_code(Some(code)).ok_or_else(|| format!("unknown status code {code}"));
        }
        Self::ALL
            .into_iter()
            .find(|status| status.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

/// The pipeline's view of an `image` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Image {
    pub id: Uuid,
    pub status: Option<i32>,
    pub rotation: i32,
    pub table_template_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn pipeline_status(&self) -> Option<ImageStatus> {
        ImageStatus::from_code(self.status)
    }
}

/// Corner points of a detected cell, in image pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Quad {
    pub tl_x: i32,
    pub tl_y: i32,
    pub tr_x: i32,
    pub tr_y: i32,
    pub br_x: i32,
    pub br_y: i32,
    pub bl_x: i32,
    pub bl_y: i32,
}

/// A cell as produced by the contour stage, before it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCell {
    pub rect_id: i32,
    pub data_type: String,
    pub opts: Option<String>,
    pub quad: Quad,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Cell {
    pub image_id: Uuid,
    pub rect_id: i32,
    pub data_type: String,
    pub opts: Option<String>,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub quad: Quad,
    pub value: Option<String>,
    pub confidence: Option<f64>,
}

/// A decoded value for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellValue {
    pub rect_id: i32,
    pub value: Option<String>,
    pub confidence: Option<f64>,
}

/// What a worker carries for one image through one stage cycle.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub image_id: Uuid,
    pub local_path: PathBuf,
    pub remote_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_count_down_to_done() {
        let codes: Vec<_> = ImageStatus::ALL.iter().map(|s| s.code()).collect();
        assert_eq!(
            codes,
            vec![None, Some(7), Some(6), Some(5), Some(4), Some(3), Some(2), Some(1), Some(0)]
        );
    }

    #[test]
    fn status_parses_names_codes_and_null() {
        assert_eq!("contour".parse::<ImageStatus>(), Ok(ImageStatus::Contour));
        assert_eq!("Decoding-Number".parse::<ImageStatus>(), Ok(ImageStatus::DecodingNumber));
        assert_eq!("0".parse::<ImageStatus>(), Ok(ImageStatus::Failed));
        assert_eq!("NULL".parse::<ImageStatus>(), Ok(ImageStatus::Uploading));
        assert!("42".parse::<ImageStatus>().is_err());
        assert!("shredding".parse::<ImageStatus>().is_err());
    }

    #[test]
    fn unknown_code_has_no_status() {
        assert_eq!(ImageStatus::from_code(Some(9)), None);
        assert_eq!(ImageStatus::from_code(None), Some(ImageStatus::Uploading));
    }
}
