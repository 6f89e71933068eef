//! Error kinds for the print service.
//!
//! Faults are split by how far they are allowed to propagate: a
//! [`ServiceError`] is turned into a DIMSE status and the association stays
//! open; a [`ProtocolError`] tears the association down.

use thiserror::Error;

use crate::dimse::status;

/// Faults at the upper-layer / DIMSE codec boundary.
///
/// Any of these escalates to an A-ABORT of the affected association; the
/// server keeps accepting new associations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("failed to decode DIMSE command set")]
    DecodeCommand(#[source] dicom_object::ReadError),

    #[error("failed to encode DIMSE command set")]
    EncodeCommand(#[source] dicom_object::WriteError),

    #[error("failed to decode data set")]
    DecodeDataSet(#[source] dicom_object::ReadError),

    #[error("failed to encode data set")]
    EncodeDataSet(#[source] dicom_object::WriteError),

    #[error("transfer syntax {uid} was not accepted during negotiation")]
    UnsupportedTransferSyntax { uid: String },

    #[error("association error")]
    Association(#[from] dicom_ul::association::server::Error),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Faults in a single DIMSE request.
///
/// These map onto a response status code; the association remains open.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no such SOP instance {0}")]
    NoSuchObjectInstance(String),

    #[error("invalid SOP instance {0}")]
    InvalidObjectInstance(String),

    #[error("invalid attribute value: {0}")]
    InvalidAttributeValue(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("film box {0} has already been submitted for printing")]
    PrintInProgress(String),

    #[error("operation not supported for SOP class {0}")]
    UnsupportedOperation(String),

    #[error("processing failure: {0}")]
    Processing(String),
}

impl ServiceError {
    /// The DIMSE status code reported for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::NoSuchObjectInstance(_) => status::NO_SUCH_OBJECT_INSTANCE,
            ServiceError::InvalidObjectInstance(_) => status::INVALID_OBJECT_INSTANCE,
            ServiceError::InvalidAttributeValue(_) => status::INVALID_ATTRIBUTE_VALUE,
            ServiceError::ResourceLimit(_) => status::RESOURCE_LIMITATION,
            ServiceError::PrintInProgress(_) => status::FAILURE_PRINT_IN_PROGRESS,
            ServiceError::UnsupportedOperation(_) => status::FAILURE_UNSUPPORTED_OPERATION,
            ServiceError::Processing(_) => status::PROCESSING_FAILURE,
        }
    }
}

/// Faults in the pixel ingestion pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported pixel encoding: {0}")]
    UnsupportedPixelEncoding(String),

    #[error("invalid image geometry: {rows}x{columns}, {samples_per_pixel} samples/pixel, {bits_allocated} bits allocated")]
    InvalidGeometry {
        rows: u32,
        columns: u32,
        samples_per_pixel: u16,
        bits_allocated: u16,
    },

    #[error("pixel data is empty")]
    EmptyPixelData,
}

/// Faults while handing a page to the job sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write page")]
    Io(#[from] std::io::Error),

    #[error("failed to encode page")]
    Encode(#[from] image::ImageError),

    #[error("failed to write job record")]
    Record(#[from] serde_json::Error),
}
