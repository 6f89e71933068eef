//! Print job submission.
//!
//! The page assembler's output is handed to a [`JobSink`]; the default sink
//! writes the page as a lossless PNG plus a JSON sidecar record. A real
//! deployment may substitute a sink that forwards to an OS print spooler.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::SinkError;
use crate::pixel::Raster;

/// Everything the sink needs to know about the job besides the page itself.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    pub association_id: String,
    pub film_session_uid: String,
    pub film_box_uid: String,
    pub number_of_copies: u16,
    pub print_priority: String,
    pub medium_type: String,
    pub film_destination: String,
}

/// The sidecar record written next to each page.
#[derive(Debug, Serialize)]
struct JobRecord<'a> {
    association_id: &'a str,
    film_session_uid: &'a str,
    film_box_uid: &'a str,
    number_of_copies: u16,
    print_priority: &'a str,
    medium_type: &'a str,
    film_destination: &'a str,
    page_mode: &'static str,
    page_width: u32,
    page_height: u32,
    output_file: String,
    submitted_at: DateTime<Utc>,
}

/// Destination for assembled pages.
///
/// Submission is synchronous; the association worker bounds it with the
/// print-action timeout.
pub trait JobSink: Send + Sync {
    /// Deliver one page. Returns the path of the produced artifact.
    fn submit(&self, page: &Raster, meta: &JobMetadata) -> Result<PathBuf, SinkError>;
}

/// Writes pages under `<root>/<association-id>/<film-box-uid>.png` with a
/// JSON sidecar.
#[derive(Debug)]
pub struct FileJobSink {
    root: PathBuf,
}

impl FileJobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl JobSink for FileJobSink {
    fn submit(&self, page: &Raster, meta: &JobMetadata) -> Result<PathBuf, SinkError> {
        let dir = self.root.join(&meta.association_id);
        std::fs::create_dir_all(&dir)?;

        let page_path = dir.join(format!("{}.png", meta.film_box_uid));
        match page {
            Raster::Gray(img) => img.save(&page_path)?,
            Raster::Rgb(img) => img.save(&page_path)?,
        }

        let record = JobRecord {
            association_id: &meta.association_id,
            film_session_uid: &meta.film_session_uid,
            film_box_uid: &meta.film_box_uid,
            number_of_copies: meta.number_of_copies,
            print_priority: &meta.print_priority,
            medium_type: &meta.medium_type,
            film_destination: &meta.film_destination,
            page_mode: if page.is_gray() { "L" } else { "RGB" },
            page_width: page.width(),
            page_height: page.height(),
            output_file: page_path.display().to_string(),
            submitted_at: Utc::now(),
        };
        let record_path = dir.join(format!("{}.json", meta.film_box_uid));
        std::fs::write(&record_path, serde_json::to_vec_pretty(&record)?)?;

        info!(
            association_id = %meta.association_id,
            film_box = %meta.film_box_uid,
            page = %page_path.display(),
            "page submitted to print sink"
        );
        Ok(page_path)
    }
}
