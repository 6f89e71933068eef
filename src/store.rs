//! Per-association print object store.
//!
//! Holds the Film Session / Film Box / Image Box hierarchy (plus Print
//! Jobs) for one association. Every association owns exactly one store;
//! dropping the store when the association ends is what implements the
//! cascade on release and abort. Nothing here is shared across
//! associations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dicom_core::Tag;
use dicom_core::value::{PrimitiveValue, Value};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::layout::ImageDisplayFormat;
use crate::pixel::{ImageAttributes, PaletteLut, PhotometricInterpretation};

/// Generate a fresh SOP Instance UID in the UUID-derived `2.25.` root.
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

fn clean_uid(uid: &str) -> &str {
    uid.trim_end_matches('\0').trim()
}

// ---------------------------------------------------------------------------
// attribute enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintPriority {
    High,
    Med,
    Low,
}

impl PrintPriority {
    fn parse(value: &str) -> Result<Self, ServiceError> {
        match value {
            "HIGH" => Ok(Self::High),
            // some SCUs spell the middle priority out
            "MED" | "MEDIUM" => Ok(Self::Med),
            "LOW" => Ok(Self::Low),
            other => Err(ServiceError::InvalidAttributeValue(format!(
                "print priority {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Med => "MED",
            Self::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilmOrientation {
    Portrait,
    Landscape,
}

impl FilmOrientation {
    fn parse(value: &str) -> Result<Self, ServiceError> {
        match value {
            "PORTRAIT" => Ok(Self::Portrait),
            "LANDSCAPE" => Ok(Self::Landscape),
            other => Err(ServiceError::InvalidAttributeValue(format!(
                "film orientation {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Portrait => "PORTRAIT",
            Self::Landscape => "LANDSCAPE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagnificationType {
    None,
    Cubic,
    Replicate,
    Bilinear,
}

impl MagnificationType {
    fn parse(value: &str) -> Result<Self, ServiceError> {
        match value {
            "NONE" => Ok(Self::None),
            "CUBIC" => Ok(Self::Cubic),
            "REPLICATE" => Ok(Self::Replicate),
            "BILINEAR" => Ok(Self::Bilinear),
            other => Err(ServiceError::InvalidAttributeValue(format!(
                "magnification type {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Cubic => "CUBIC",
            Self::Replicate => "REPLICATE",
            Self::Bilinear => "BILINEAR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Normal,
    Reverse,
}

impl Polarity {
    fn parse(value: &str) -> Result<Self, ServiceError> {
        match value {
            "NORMAL" => Ok(Self::Normal),
            "REVERSE" => Ok(Self::Reverse),
            other => Err(ServiceError::InvalidAttributeValue(format!(
                "polarity {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Reverse => "REVERSE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderDensity {
    Black,
    White,
    /// hundredths of optical density
    Density(u16),
}

impl BorderDensity {
    fn parse(value: &str) -> Result<Self, ServiceError> {
        match value {
            "BLACK" => Ok(Self::Black),
            "WHITE" => Ok(Self::White),
            other => other
                .parse::<u16>()
                .map(Self::Density)
                .map_err(|_| {
                    ServiceError::InvalidAttributeValue(format!("border density {other:?}"))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Printing,
    Done,
    Failure,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Printing => "PRINTING",
            Self::Done => "DONE",
            Self::Failure => "FAILURE",
        }
    }
}

// ---------------------------------------------------------------------------
// entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FilmSession {
    pub uid: String,
    pub number_of_copies: u16,
    pub print_priority: PrintPriority,
    pub medium_type: String,
    pub film_destination: String,
    pub film_box_uids: Vec<String>,
}

impl FilmSession {
    fn with_defaults(uid: String) -> Self {
        Self {
            uid,
            number_of_copies: 1,
            print_priority: PrintPriority::Med,
            medium_type: "PAPER".to_string(),
            film_destination: "PROCESSOR".to_string(),
            film_box_uids: Vec::new(),
        }
    }

    fn apply(&mut self, ds: &InMemDicomObject) -> Result<(), ServiceError> {
        if let Some(copies) = u16_attr(ds, tags::NUMBER_OF_COPIES)? {
            if copies == 0 {
                return Err(ServiceError::InvalidAttributeValue(
                    "number of copies must be positive".to_string(),
                ));
            }
            self.number_of_copies = copies;
        }
        if let Some(priority) = str_attr(ds, tags::PRINT_PRIORITY) {
            self.print_priority = PrintPriority::parse(&priority)?;
        }
        if let Some(medium) = str_attr(ds, tags::MEDIUM_TYPE) {
            self.medium_type = medium;
        }
        if let Some(destination) = str_attr(ds, tags::FILM_DESTINATION) {
            self.film_destination = destination;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FilmBox {
    pub uid: String,
    pub film_session_uid: String,
    pub format: ImageDisplayFormat,
    pub orientation: FilmOrientation,
    pub film_size_id: String,
    pub magnification: MagnificationType,
    pub border_density: Option<BorderDensity>,
    pub trim: bool,
    pub max_density: u16,
    pub image_box_uids: Vec<String>,
    pub print_started: bool,
}

impl FilmBox {
    /// Merge mutable film attributes. The display format is fixed at
    /// creation because the Image Box set was synthesized from it.
    fn apply(&mut self, ds: &InMemDicomObject) -> Result<(), ServiceError> {
        if str_attr(ds, tags::IMAGE_DISPLAY_FORMAT).is_some() {
            return Err(ServiceError::InvalidAttributeValue(
                "image display format cannot be modified".to_string(),
            ));
        }
        if let Some(orientation) = str_attr(ds, tags::FILM_ORIENTATION) {
            self.orientation = FilmOrientation::parse(&orientation)?;
        }
        if let Some(size) = str_attr(ds, tags::FILM_SIZE_ID) {
            self.film_size_id = size;
        }
        if let Some(magnification) = str_attr(ds, tags::MAGNIFICATION_TYPE) {
            self.magnification = MagnificationType::parse(&magnification)?;
        }
        if let Some(density) = str_attr(ds, tags::BORDER_DENSITY) {
            self.border_density = Some(BorderDensity::parse(&density)?);
        }
        if let Some(trim) = str_attr(ds, tags::TRIM) {
            self.trim = match trim.as_str() {
                "YES" => true,
                "NO" => false,
                other => {
                    return Err(ServiceError::InvalidAttributeValue(format!(
                        "trim {other:?}"
                    )))
                }
            };
        }
        if let Some(density) = u16_attr(ds, tags::MAX_DENSITY)? {
            self.max_density = density;
        }
        Ok(())
    }
}

/// Pixel data plus the image module attributes describing it.
#[derive(Debug, Clone)]
pub struct ImageContent {
    pub pixel_data: Arc<Vec<u8>>,
    pub attrs: ImageAttributes,
}

#[derive(Debug, Clone)]
pub struct ImageBox {
    pub uid: String,
    pub film_box_uid: String,
    pub position: u16,
    pub polarity: Polarity,
    pub magnification: Option<MagnificationType>,
    pub image: Option<ImageContent>,
}

#[derive(Debug, Clone)]
pub struct PrintJob {
    pub uid: String,
    pub film_box_uid: String,
    pub status: ExecutionStatus,
    pub status_info: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// print-time snapshot
// ---------------------------------------------------------------------------

/// One Image Box slot frozen for page assembly. Pixel data is shared, not
/// copied.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub position: u16,
    pub polarity: Polarity,
    pub magnification: Option<MagnificationType>,
    pub image: Option<ImageContent>,
}

/// A Film Box subtree frozen at print-action time.
#[derive(Debug, Clone)]
pub struct FilmSnapshot {
    pub film_box_uid: String,
    pub format: ImageDisplayFormat,
    pub orientation: FilmOrientation,
    pub film_size_id: String,
    pub magnification: MagnificationType,
    pub border_density: Option<BorderDensity>,
    pub trim: bool,
    pub slots: Vec<SlotSnapshot>,
}

/// Snapshot plus owning session attributes, ready for the job sink.
#[derive(Debug, Clone)]
pub struct PrintRequest {
    pub snapshot: FilmSnapshot,
    pub session: FilmSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    FilmSession,
    FilmBox,
    ImageBox,
    PrintJob,
}

/// Outcome of a Film Box N-CREATE.
#[derive(Debug)]
pub struct CreatedFilmBox {
    pub uid: String,
    pub image_box_uids: Vec<String>,
    /// requested Max Density exceeded the supported maximum
    pub warning: bool,
}

// ---------------------------------------------------------------------------
// the store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PrintStore {
    association_id: String,
    film_sessions: HashMap<String, FilmSession>,
    session_order: Vec<String>,
    film_boxes: HashMap<String, FilmBox>,
    image_boxes: HashMap<String, ImageBox>,
    print_jobs: HashMap<String, PrintJob>,
    /// every SOP Instance UID ever used on this association
    seen_uids: HashSet<String>,
    pixel_bytes: usize,
    max_pixel_bytes: usize,
    job_retention: Duration,
}

impl PrintStore {
    pub fn new(association_id: String, max_pixel_bytes: usize, job_retention: Duration) -> Self {
        Self {
            association_id,
            film_sessions: HashMap::new(),
            session_order: Vec::new(),
            film_boxes: HashMap::new(),
            image_boxes: HashMap::new(),
            print_jobs: HashMap::new(),
            seen_uids: HashSet::new(),
            pixel_bytes: 0,
            max_pixel_bytes,
            job_retention,
        }
    }

    pub fn association_id(&self) -> &str {
        &self.association_id
    }

    pub fn kind_of(&self, uid: &str) -> Option<EntityKind> {
        let uid = clean_uid(uid);
        if self.film_sessions.contains_key(uid) {
            Some(EntityKind::FilmSession)
        } else if self.film_boxes.contains_key(uid) {
            Some(EntityKind::FilmBox)
        } else if self.image_boxes.contains_key(uid) {
            Some(EntityKind::ImageBox)
        } else if self.print_jobs.contains_key(uid) {
            Some(EntityKind::PrintJob)
        } else {
            None
        }
    }

    pub fn film_session(&self, uid: &str) -> Option<&FilmSession> {
        self.film_sessions.get(clean_uid(uid))
    }

    pub fn film_box(&self, uid: &str) -> Option<&FilmBox> {
        self.film_boxes.get(clean_uid(uid))
    }

    pub fn image_box(&self, uid: &str) -> Option<&ImageBox> {
        self.image_boxes.get(clean_uid(uid))
    }

    pub fn is_empty(&self) -> bool {
        self.film_sessions.is_empty() && self.film_boxes.is_empty() && self.image_boxes.is_empty()
    }

    fn claim_uid(&mut self, uid: &str) -> Result<(), ServiceError> {
        if !self.seen_uids.insert(uid.to_string()) {
            return Err(ServiceError::InvalidObjectInstance(format!(
                "SOP instance UID {uid} was already used on this association"
            )));
        }
        Ok(())
    }

    // -- N-CREATE ----------------------------------------------------------

    pub fn create_film_session(
        &mut self,
        uid: Option<String>,
        ds: Option<&InMemDicomObject>,
    ) -> Result<&FilmSession, ServiceError> {
        let uid = uid
            .as_deref()
            .map(clean_uid)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_uid);

        let mut session = FilmSession::with_defaults(uid.clone());
        if let Some(ds) = ds {
            session.apply(ds)?;
        }

        self.claim_uid(&uid)?;
        self.session_order.push(uid.clone());
        debug!(association_id = %self.association_id, uid = %uid, "film session created");
        Ok(self.film_sessions.entry(uid).or_insert(session))
    }

    pub fn create_film_box(
        &mut self,
        uid: Option<String>,
        ds: Option<&InMemDicomObject>,
        rows_first: bool,
        supported_max_density: u16,
    ) -> Result<CreatedFilmBox, ServiceError> {
        let uid = uid
            .as_deref()
            .map(clean_uid)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_uid);

        let session_uid = self.referenced_session_uid(ds)?;

        let format_text = ds
            .and_then(|ds| str_attr(ds, tags::IMAGE_DISPLAY_FORMAT))
            .unwrap_or_else(|| "STANDARD\\1,1".to_string());
        let format = ImageDisplayFormat::parse(&format_text, rows_first)
            .map_err(|e| ServiceError::InvalidAttributeValue(e.to_string()))?;

        let mut film_box = FilmBox {
            uid: uid.clone(),
            film_session_uid: session_uid.clone(),
            format,
            orientation: FilmOrientation::Portrait,
            film_size_id: "A4".to_string(),
            magnification: MagnificationType::None,
            border_density: None,
            trim: false,
            max_density: supported_max_density,
            image_box_uids: Vec::new(),
            print_started: false,
        };
        if let Some(ds) = ds {
            if let Some(orientation) = str_attr(ds, tags::FILM_ORIENTATION) {
                film_box.orientation = FilmOrientation::parse(&orientation)?;
            }
            if let Some(size) = str_attr(ds, tags::FILM_SIZE_ID) {
                film_box.film_size_id = size;
            }
            if let Some(magnification) = str_attr(ds, tags::MAGNIFICATION_TYPE) {
                film_box.magnification = MagnificationType::parse(&magnification)?;
            }
            if let Some(density) = str_attr(ds, tags::BORDER_DENSITY) {
                film_box.border_density = Some(BorderDensity::parse(&density)?);
            }
            if let Some(trim) = str_attr(ds, tags::TRIM) {
                film_box.trim = trim == "YES";
            }
            if let Some(density) = u16_attr(ds, tags::MAX_DENSITY)? {
                film_box.max_density = density;
            }
        }
        let warning = film_box.max_density > supported_max_density;

        // check the whole batch of UIDs (film box + synthesized slots)
        // before burning any of them, so a rejected N-CREATE neither leaves
        // a partial subtree nor poisons an identifier that was never
        // instantiated
        let count = film_box.format.cell_count();
        let mut image_box_uids = Vec::with_capacity(count);
        for index in 0..count {
            image_box_uids.push(format!("{}.{}", uid, index + 1));
        }
        if let Some(taken) = std::iter::once(&uid)
            .chain(image_box_uids.iter())
            .find(|u| self.seen_uids.contains(u.as_str()))
        {
            return Err(ServiceError::InvalidObjectInstance(format!(
                "SOP instance UID {taken} was already used on this association"
            )));
        }
        self.seen_uids.insert(uid.clone());
        self.seen_uids.extend(image_box_uids.iter().cloned());

        // synthesize the Image Box slots implied by the display format
        for (index, box_uid) in image_box_uids.iter().enumerate() {
            self.image_boxes.insert(
                box_uid.clone(),
                ImageBox {
                    uid: box_uid.clone(),
                    film_box_uid: uid.clone(),
                    position: (index + 1) as u16,
                    polarity: Polarity::Normal,
                    magnification: None,
                    image: None,
                },
            );
        }
        film_box.image_box_uids = image_box_uids.clone();

        self.film_boxes.insert(uid.clone(), film_box);
        self.film_sessions
            .get_mut(&session_uid)
            .expect("referenced session exists")
            .film_box_uids
            .push(uid.clone());

        debug!(
            association_id = %self.association_id,
            uid = %uid,
            session = %session_uid,
            slots = count,
            "film box created"
        );
        Ok(CreatedFilmBox {
            uid,
            image_box_uids,
            warning,
        })
    }

    /// Resolve the parent session of a new Film Box: the Referenced Film
    /// Session Sequence when present, otherwise the only open session.
    fn referenced_session_uid(
        &self,
        ds: Option<&InMemDicomObject>,
    ) -> Result<String, ServiceError> {
        let referenced = ds
            .and_then(|ds| ds.get(tags::REFERENCED_FILM_SESSION_SEQUENCE))
            .and_then(|el| el.value().items())
            .and_then(|items| items.first())
            .and_then(|item| str_attr(item, tags::REFERENCED_SOP_INSTANCE_UID));

        match referenced {
            Some(uid) => {
                if self.film_sessions.contains_key(clean_uid(&uid)) {
                    Ok(clean_uid(&uid).to_string())
                } else {
                    Err(ServiceError::NoSuchObjectInstance(uid))
                }
            }
            None if self.session_order.len() == 1 => Ok(self.session_order[0].clone()),
            None => Err(ServiceError::InvalidAttributeValue(
                "film box does not reference a film session".to_string(),
            )),
        }
    }

    // -- N-SET -------------------------------------------------------------

    pub fn set_film_session(
        &mut self,
        uid: &str,
        ds: &InMemDicomObject,
    ) -> Result<(), ServiceError> {
        let session = self
            .film_sessions
            .get_mut(clean_uid(uid))
            .ok_or_else(|| ServiceError::NoSuchObjectInstance(uid.to_string()))?;
        session.apply(ds)
    }

    pub fn set_film_box(&mut self, uid: &str, ds: &InMemDicomObject) -> Result<(), ServiceError> {
        let film_box = self
            .film_boxes
            .get_mut(clean_uid(uid))
            .ok_or_else(|| ServiceError::NoSuchObjectInstance(uid.to_string()))?;
        if film_box.print_started {
            return Err(ServiceError::PrintInProgress(uid.to_string()));
        }
        film_box.apply(ds)
    }

    /// Apply an Image Box modification list.
    ///
    /// The data set is consumed so the pixel buffer moves into the store
    /// instead of being copied.
    pub fn set_image_box(&mut self, uid: &str, mut ds: InMemDicomObject) -> Result<(), ServiceError> {
        let uid = clean_uid(uid).to_string();
        let Some(image_box) = self.image_boxes.get(&uid) else {
            return Err(ServiceError::NoSuchObjectInstance(uid));
        };
        let film_box_uid = image_box.film_box_uid.clone();
        if self
            .film_boxes
            .get(&film_box_uid)
            .map(|fb| fb.print_started)
            .unwrap_or(false)
        {
            return Err(ServiceError::PrintInProgress(film_box_uid));
        }

        // an empty modification list is a no-op confirmation
        if ds.iter().next().is_none() {
            return Ok(());
        }

        let position = u16_attr(&ds, tags::IMAGE_BOX_POSITION)?;
        let polarity = str_attr(&ds, tags::POLARITY)
            .map(|p| Polarity::parse(&p))
            .transpose()?;
        let magnification = str_attr(&ds, tags::MAGNIFICATION_TYPE)
            .map(|m| MagnificationType::parse(&m))
            .transpose()?;

        // the image module may be nested in the Basic Grayscale/Color Image
        // Sequence or laid out at the top level of the modification list
        let item = take_sequence_item(&mut ds, tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE)
            .or_else(|| take_sequence_item(&mut ds, tags::BASIC_COLOR_IMAGE_SEQUENCE));
        let mut image_ds = item.unwrap_or(ds);

        let Some(pixel_element) = image_ds.take(tags::PIXEL_DATA) else {
            return Err(ServiceError::InvalidAttributeValue(
                "modification list carries no pixel data".to_string(),
            ));
        };
        let pixel_data = element_into_bytes(pixel_element);
        let attrs = parse_image_attributes(&image_ds)?;

        // rows x columns x samples x bytes-per-sample must fit in the data
        if attrs.expected_bytes() > pixel_data.len() {
            return Err(ServiceError::InvalidAttributeValue(format!(
                "pixel data holds {} bytes but the image geometry needs {}",
                pixel_data.len(),
                attrs.expected_bytes()
            )));
        }

        if let Some(position) = position {
            let clash = self.film_boxes[&film_box_uid]
                .image_box_uids
                .iter()
                .filter(|other| **other != uid)
                .any(|other| {
                    self.image_boxes
                        .get(other)
                        .map(|b| b.position == position)
                        .unwrap_or(false)
                });
            if clash {
                return Err(ServiceError::InvalidAttributeValue(format!(
                    "image position {position} is already occupied"
                )));
            }
        }

        let previous_bytes = self.image_boxes[&uid]
            .image
            .as_ref()
            .map(|c| c.pixel_data.len())
            .unwrap_or(0);
        let budget_after = self.pixel_bytes - previous_bytes + pixel_data.len();
        if budget_after > self.max_pixel_bytes {
            return Err(ServiceError::ResourceLimit(format!(
                "association pixel memory would reach {budget_after} bytes"
            )));
        }

        let image_box = self.image_boxes.get_mut(&uid).expect("checked above");
        if let Some(position) = position {
            image_box.position = position;
        }
        if let Some(polarity) = polarity {
            image_box.polarity = polarity;
        }
        if let Some(magnification) = magnification {
            image_box.magnification = Some(magnification);
        }
        image_box.image = Some(ImageContent {
            pixel_data: Arc::new(pixel_data),
            attrs,
        });
        self.pixel_bytes = budget_after;
        debug!(
            association_id = %self.association_id,
            uid = %uid,
            bytes = self.pixel_bytes,
            "image box pixel data stored"
        );
        Ok(())
    }

    // -- N-ACTION ----------------------------------------------------------

    /// Freeze a Film Box subtree for printing. Later modification attempts
    /// are rejected.
    pub fn begin_print(&mut self, uid: &str) -> Result<PrintRequest, ServiceError> {
        let uid = clean_uid(uid);
        let film_box = self
            .film_boxes
            .get_mut(uid)
            .ok_or_else(|| ServiceError::NoSuchObjectInstance(uid.to_string()))?;
        film_box.print_started = true;
        let box_uids = film_box.image_box_uids.clone();

        let mut slots: Vec<SlotSnapshot> = box_uids
            .iter()
            .filter_map(|box_uid| self.image_boxes.get(box_uid))
            .map(|b| SlotSnapshot {
                position: b.position,
                polarity: b.polarity,
                magnification: b.magnification,
                image: b.image.clone(),
            })
            .collect();
        slots.sort_by_key(|slot| slot.position);

        let film_box = &self.film_boxes[uid];
        let session = self.film_sessions[&film_box.film_session_uid].clone();
        Ok(PrintRequest {
            snapshot: FilmSnapshot {
                film_box_uid: film_box.uid.clone(),
                format: film_box.format.clone(),
                orientation: film_box.orientation,
                film_size_id: film_box.film_size_id.clone(),
                magnification: film_box.magnification,
                border_density: film_box.border_density,
                trim: film_box.trim,
                slots,
            },
            session,
        })
    }

    /// Film Boxes of a session in insertion order, for the session-level
    /// print action.
    pub fn session_film_boxes(&self, uid: &str) -> Result<Vec<String>, ServiceError> {
        self.film_sessions
            .get(clean_uid(uid))
            .map(|s| s.film_box_uids.clone())
            .ok_or_else(|| ServiceError::NoSuchObjectInstance(uid.to_string()))
    }

    // -- N-DELETE ----------------------------------------------------------

    pub fn delete(&mut self, uid: &str) -> Result<(), ServiceError> {
        let uid = clean_uid(uid);
        match self.kind_of(uid) {
            Some(EntityKind::FilmSession) => {
                let session = self.film_sessions.remove(uid).expect("kind matched");
                self.session_order.retain(|u| u != uid);
                for film_box_uid in session.film_box_uids {
                    self.remove_film_box(&film_box_uid);
                }
                debug!(association_id = %self.association_id, uid = %uid, "film session deleted");
                Ok(())
            }
            Some(EntityKind::FilmBox) => {
                let session_uid = self.film_boxes[uid].film_session_uid.clone();
                self.remove_film_box(uid);
                if let Some(session) = self.film_sessions.get_mut(&session_uid) {
                    session.film_box_uids.retain(|u| u != uid);
                }
                debug!(association_id = %self.association_id, uid = %uid, "film box deleted");
                Ok(())
            }
            // image boxes live and die with their film box
            Some(EntityKind::ImageBox) | Some(EntityKind::PrintJob) => Err(
                ServiceError::InvalidObjectInstance(uid.to_string()),
            ),
            None => Err(ServiceError::NoSuchObjectInstance(uid.to_string())),
        }
    }

    fn remove_film_box(&mut self, uid: &str) {
        if let Some(film_box) = self.film_boxes.remove(uid) {
            for box_uid in film_box.image_box_uids {
                if let Some(image_box) = self.image_boxes.remove(&box_uid) {
                    if let Some(content) = image_box.image {
                        self.pixel_bytes -= content.pixel_data.len();
                    }
                }
            }
        }
    }

    // -- print jobs --------------------------------------------------------

    pub fn new_print_job(&mut self, film_box_uid: &str) -> PrintJob {
        let now = Utc::now();
        let job = PrintJob {
            uid: generate_uid(),
            film_box_uid: film_box_uid.to_string(),
            status: ExecutionStatus::Pending,
            status_info: String::new(),
            created: now,
            expires: now
                + chrono::Duration::from_std(self.job_retention)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        };
        self.seen_uids.insert(job.uid.clone());
        job
    }

    pub fn store_print_job(&mut self, job: PrintJob) {
        self.print_jobs.insert(job.uid.clone(), job);
    }

    pub fn print_job(&mut self, uid: &str) -> Option<&PrintJob> {
        self.purge_expired_jobs();
        self.print_jobs.get(clean_uid(uid))
    }

    fn purge_expired_jobs(&mut self) {
        let now = Utc::now();
        self.print_jobs.retain(|uid, job| {
            let keep = job.expires > now;
            if !keep {
                warn!(uid = %uid, "print job expired from retention window");
            }
            keep
        });
    }
}

// ---------------------------------------------------------------------------
// data-set access helpers
// ---------------------------------------------------------------------------

fn str_attr(ds: &InMemDicomObject, tag: Tag) -> Option<String> {
    ds.get(tag)
        .and_then(|el| el.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn u16_attr(ds: &InMemDicomObject, tag: Tag) -> Result<Option<u16>, ServiceError> {
    match ds.get(tag) {
        Some(el) => el
            .to_int::<u16>()
            .map(Some)
            .map_err(|e| ServiceError::InvalidAttributeValue(format!("{tag}: {e}"))),
        None => Ok(None),
    }
}

fn f64_attr(ds: &InMemDicomObject, tag: Tag) -> Option<f64> {
    ds.get(tag).and_then(|el| el.to_float64().ok())
}

/// Detach the first item of a sequence attribute, taking ownership.
fn take_sequence_item(ds: &mut InMemDicomObject, tag: Tag) -> Option<InMemDicomObject> {
    let element = ds.take(tag)?;
    element.into_value().into_items()?.into_iter().next()
}

/// Move the bytes out of a pixel data element.
fn element_into_bytes(element: dicom_object::mem::InMemElement) -> Vec<u8> {
    match element.into_value() {
        Value::Primitive(PrimitiveValue::U8(bytes)) => bytes.into_vec(),
        Value::Primitive(PrimitiveValue::U16(words)) => {
            // OW pixel data parsed as 16-bit words
            let mut bytes = Vec::with_capacity(words.len() * 2);
            for word in words {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            bytes
        }
        Value::Primitive(other) => other.to_bytes().into_owned(),
        _ => Vec::new(),
    }
}

fn parse_image_attributes(ds: &InMemDicomObject) -> Result<ImageAttributes, ServiceError> {
    let rows = u16_attr(ds, tags::ROWS)?.ok_or_else(|| {
        ServiceError::InvalidAttributeValue("image module is missing Rows".to_string())
    })?;
    let columns = u16_attr(ds, tags::COLUMNS)?.ok_or_else(|| {
        ServiceError::InvalidAttributeValue("image module is missing Columns".to_string())
    })?;
    let bits_allocated = u16_attr(ds, tags::BITS_ALLOCATED)?.unwrap_or(8);
    let bits_stored = u16_attr(ds, tags::BITS_STORED)?.unwrap_or(bits_allocated);
    let high_bit = u16_attr(ds, tags::HIGH_BIT)?.unwrap_or(bits_stored.saturating_sub(1));
    let pixel_representation = u16_attr(ds, tags::PIXEL_REPRESENTATION)?.unwrap_or(0);
    let samples_per_pixel = u16_attr(ds, tags::SAMPLES_PER_PIXEL)?.unwrap_or(1);
    let planar_configuration = u16_attr(ds, tags::PLANAR_CONFIGURATION)?.unwrap_or(0);

    let photometric_interpretation = match str_attr(ds, tags::PHOTOMETRIC_INTERPRETATION) {
        Some(text) => PhotometricInterpretation::parse(&text)
            .map_err(|e| ServiceError::InvalidAttributeValue(e.to_string()))?,
        None if samples_per_pixel == 3 => PhotometricInterpretation::Rgb,
        None => PhotometricInterpretation::Monochrome2,
    };

    let palette = parse_palette(ds);

    Ok(ImageAttributes {
        rows: rows as u32,
        columns: columns as u32,
        bits_allocated,
        bits_stored,
        high_bit,
        pixel_representation,
        photometric_interpretation,
        samples_per_pixel,
        planar_configuration,
        window_center: f64_attr(ds, tags::WINDOW_CENTER),
        window_width: f64_attr(ds, tags::WINDOW_WIDTH),
        palette,
    })
}

fn parse_palette(ds: &InMemDicomObject) -> Option<PaletteLut> {
    let descriptor = ds
        .get(tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR)?
        .to_multi_int::<u16>()
        .ok()?;
    if descriptor.len() < 3 {
        return None;
    }
    let red = palette_table(ds, tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA)?;
    let green = palette_table(ds, tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA)?;
    let blue = palette_table(ds, tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA)?;
    Some(PaletteLut {
        first_entry: descriptor[1],
        entry_bits: descriptor[2],
        red,
        green,
        blue,
    })
}

fn palette_table(ds: &InMemDicomObject, tag: Tag) -> Option<Vec<u16>> {
    let element = ds.get(tag)?;
    match element.value() {
        Value::Primitive(PrimitiveValue::U16(words)) => Some(words.to_vec()),
        _ => {
            let bytes = element.to_bytes().ok()?;
            Some(
                bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_core::value::DataSetSequence;
    use dicom_core::Length;
    use smallvec::smallvec;

    fn store() -> PrintStore {
        PrintStore::new("test-assoc".to_string(), 1024 * 1024, Duration::from_secs(60))
    }

    fn film_session_ds() -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(tags::NUMBER_OF_COPIES, VR::IS, dicom_value!(Str, "2")),
            DataElement::new(tags::PRINT_PRIORITY, VR::CS, dicom_value!(Str, "HIGH")),
            DataElement::new(tags::MEDIUM_TYPE, VR::CS, dicom_value!(Str, "BLUE FILM")),
        ])
    }

    fn image_ds(rows: u16, columns: u16, pixel: Vec<u8>) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])),
            DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [columns])),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [8])),
            DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [8])),
            DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [7])),
            DataElement::new(
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                dicom_value!(Str, "MONOCHROME2"),
            ),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OB,
                Value::Primitive(PrimitiveValue::U8(pixel.into())),
            ),
        ])
    }

    fn create_box(store: &mut PrintStore, format: &str) -> CreatedFilmBox {
        store
            .create_film_session(Some("1.2.3".to_string()), None)
            .unwrap();
        let ds = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::IMAGE_DISPLAY_FORMAT,
            VR::ST,
            dicom_value!(Str, format),
        )]);
        store
            .create_film_box(Some("1.2.3.9".to_string()), Some(&ds), false, 300)
            .unwrap()
    }

    #[test]
    fn film_session_defaults_and_merge() {
        let mut store = store();
        let session = store
            .create_film_session(Some("1.2.3".to_string()), Some(&film_session_ds()))
            .unwrap();
        assert_eq!(session.number_of_copies, 2);
        assert_eq!(session.print_priority, PrintPriority::High);
        assert_eq!(session.medium_type, "BLUE FILM");
        assert_eq!(session.film_destination, "PROCESSOR");
    }

    #[test]
    fn duplicate_uid_is_rejected() {
        let mut store = store();
        store
            .create_film_session(Some("1.2.3".to_string()), None)
            .unwrap();
        let err = store
            .create_film_session(Some("1.2.3".to_string()), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidObjectInstance(_)));
    }

    #[test]
    fn film_box_synthesizes_image_boxes() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\2,2");
        assert_eq!(created.image_box_uids.len(), 4);
        assert!(!created.warning);
        for (i, uid) in created.image_box_uids.iter().enumerate() {
            let image_box = store.image_box(uid).unwrap();
            assert_eq!(image_box.position as usize, i + 1);
            assert!(image_box.image.is_none());
        }
    }

    #[test]
    fn failed_film_box_create_burns_no_uids() {
        let mut store = store();
        store
            .create_film_session(Some("1.2.3".to_string()), None)
            .unwrap();
        // an unrelated object already owns the UID the first slot would get
        store
            .create_film_session(Some("1.2.3.9.1".to_string()), None)
            .unwrap();

        let reference = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3"),
        )]);
        let ds = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::REFERENCED_FILM_SESSION_SEQUENCE,
            VR::SQ,
            Value::from(DataSetSequence::new(smallvec![reference], Length::UNDEFINED)),
        )]);
        let err = store
            .create_film_box(Some("1.2.3.9".to_string()), Some(&ds), false, 300)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidObjectInstance(_)));
        assert!(store.film_box("1.2.3.9").is_none());

        // the rejected film box UID is still usable afterwards
        store
            .create_film_session(Some("1.2.3.9".to_string()), None)
            .unwrap();
    }

    #[test]
    fn film_box_without_session_fails() {
        let mut store = store();
        let err = store
            .create_film_box(Some("1.2.9".to_string()), None, false, 300)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAttributeValue(_)));
    }

    #[test]
    fn excessive_max_density_warns() {
        let mut store = store();
        store
            .create_film_session(Some("1.2.3".to_string()), None)
            .unwrap();
        let ds = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::MAX_DENSITY,
            VR::US,
            dicom_value!(U16, [400]),
        )]);
        let created = store
            .create_film_box(Some("1.2.3.9".to_string()), Some(&ds), false, 300)
            .unwrap();
        assert!(created.warning);
    }

    #[test]
    fn set_image_box_stores_pixels() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        store
            .set_image_box(&box_uid, image_ds(2, 2, vec![1, 2, 3, 4]))
            .unwrap();
        let image_box = store.image_box(&box_uid).unwrap();
        let content = image_box.image.as_ref().unwrap();
        assert_eq!(content.pixel_data.as_ref(), &vec![1, 2, 3, 4]);
        assert_eq!(content.attrs.rows, 2);
    }

    #[test]
    fn set_image_box_accepts_nested_sequence() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        let ds = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE,
            VR::SQ,
            Value::from(DataSetSequence::new(
                smallvec![image_ds(2, 2, vec![9, 9, 9, 9])],
                Length::UNDEFINED,
            )),
        )]);
        store.set_image_box(&box_uid, ds).unwrap();
        assert!(store.image_box(&box_uid).unwrap().image.is_some());
    }

    #[test]
    fn set_image_box_without_pixels_is_invalid() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        let ds = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::POLARITY,
            VR::CS,
            dicom_value!(Str, "REVERSE"),
        )]);
        let err = store.set_image_box(&box_uid, ds).unwrap_err();
        assert_eq!(err.status(), crate::dimse::status::INVALID_ATTRIBUTE_VALUE);
    }

    #[test]
    fn set_image_box_empty_list_is_noop() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        store
            .set_image_box(&box_uid, InMemDicomObject::new_empty())
            .unwrap();
        assert!(store.image_box(&box_uid).unwrap().image.is_none());
    }

    #[test]
    fn undersized_pixel_data_is_rejected() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        let err = store
            .set_image_box(&box_uid, image_ds(16, 16, vec![0; 4]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAttributeValue(_)));
    }

    #[test]
    fn pixel_budget_is_enforced() {
        let mut store =
            PrintStore::new("budget".to_string(), 8, Duration::from_secs(60));
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        let err = store
            .set_image_box(&box_uid, image_ds(3, 3, vec![0; 9]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ResourceLimit(_)));
    }

    #[test]
    fn repeated_identical_set_is_idempotent() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        store
            .set_image_box(&box_uid, image_ds(2, 2, vec![1, 2, 3, 4]))
            .unwrap();
        let before = format!("{:?}", store.image_box(&box_uid).unwrap());
        store
            .set_image_box(&box_uid, image_ds(2, 2, vec![1, 2, 3, 4]))
            .unwrap();
        let after = format!("{:?}", store.image_box(&box_uid).unwrap());
        assert_eq!(before, after);
    }

    #[test]
    fn print_freezes_the_film_box() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let box_uid = created.image_box_uids[0].clone();
        store
            .set_image_box(&box_uid, image_ds(2, 2, vec![1, 2, 3, 4]))
            .unwrap();

        let request = store.begin_print(&created.uid).unwrap();
        assert_eq!(request.snapshot.slots.len(), 1);
        assert!(request.snapshot.slots[0].image.is_some());

        let err = store
            .set_image_box(&box_uid, image_ds(2, 2, vec![4, 3, 2, 1]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::PrintInProgress(_)));
    }

    #[test]
    fn delete_film_session_cascades() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\2,1");
        store.delete("1.2.3").unwrap();
        assert!(store.is_empty());
        assert!(store.film_box(&created.uid).is_none());
        // the UID stays burned for the rest of the association
        let err = store
            .create_film_session(Some("1.2.3".to_string()), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidObjectInstance(_)));
    }

    #[test]
    fn image_boxes_cannot_be_deleted_directly() {
        let mut store = store();
        let created = create_box(&mut store, "STANDARD\\1,1");
        let err = store.delete(&created.image_box_uids[0]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidObjectInstance(_)));
        let err = store.delete("9.9.9").unwrap_err();
        assert!(matches!(err, ServiceError::NoSuchObjectInstance(_)));
    }

    #[test]
    fn print_job_lifecycle() {
        let mut store = store();
        let mut job = store.new_print_job("1.2.3.9");
        job.status = ExecutionStatus::Done;
        let uid = job.uid.clone();
        store.store_print_job(job);
        let job = store.print_job(&uid).unwrap();
        assert_eq!(job.status, ExecutionStatus::Done);
    }
}
