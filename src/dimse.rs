//! DIMSE command sets: decoding requests, encoding responses.
//!
//! Command sets always travel in Implicit VR Little Endian. The Command
//! Group Length is computed with a two-pass serialization instead of
//! per-element arithmetic.

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_core::value::Value;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;

use crate::error::ProtocolError;

/// DIMSE command field codes handled by this SCP.
pub mod commands {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const N_GET_RQ: u16 = 0x0110;
    pub const N_SET_RQ: u16 = 0x0120;
    pub const N_ACTION_RQ: u16 = 0x0130;
    pub const N_CREATE_RQ: u16 = 0x0140;
    pub const N_DELETE_RQ: u16 = 0x0150;

    /// Response command code for a request command code.
    pub const fn response_of(request: u16) -> u16 {
        request | 0x8000
    }
}

/// DIMSE status codes used by the print service.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    /// requested Max Density exceeds the supported maximum
    pub const WARNING_MAX_DENSITY_EXCEEDED: u16 = 0xB605;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const NO_SUCH_OBJECT_INSTANCE: u16 = 0x0112;
    pub const INVALID_OBJECT_INSTANCE: u16 = 0x0117;
    pub const RESOURCE_LIMITATION: u16 = 0x0213;
    /// film box mutation after its print action has begun
    pub const FAILURE_PRINT_IN_PROGRESS: u16 = 0xC000;
    /// operation/SOP class combination this SCP does not provide
    pub const FAILURE_UNSUPPORTED_OPERATION: u16 = 0xC001;

    pub fn is_warning(status: u16) -> bool {
        (0xB000..=0xBFFF).contains(&status)
    }
}

/// Command Data Set Type value for "no data set follows".
const NO_DATA_SET: u16 = 0x0101;
/// Command Data Set Type value for "a data set follows".
const DATA_SET_PRESENT: u16 = 0x0001;

/// The parts of an incoming command set the dispatcher works with.
#[derive(Debug, Clone)]
pub struct DimseRequest {
    pub command_field: u16,
    pub message_id: u16,
    /// Affected or Requested SOP Class UID
    pub sop_class_uid: String,
    /// Affected or Requested SOP Instance UID
    pub sop_instance_uid: Option<String>,
    /// N-ACTION only
    pub action_type_id: Option<u16>,
    /// N-GET attribute filter
    pub attribute_list: Vec<Tag>,
    /// a data set follows this command
    pub has_dataset: bool,
}

/// Decode one complete command set.
pub fn parse_request(bytes: &[u8]) -> Result<DimseRequest, ProtocolError> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(bytes, &ts)
        .map_err(ProtocolError::DecodeCommand)?;

    let command_field = obj
        .get(tags::COMMAND_FIELD)
        .ok_or_else(|| ProtocolError::MalformedPdu("command set without Command Field".into()))?
        .uint16()
        .map_err(|e| ProtocolError::MalformedPdu(format!("bad Command Field: {e}")))?;

    let message_id = obj
        .get(tags::MESSAGE_ID)
        .ok_or_else(|| ProtocolError::MalformedPdu("command set without Message ID".into()))?
        .to_int::<u16>()
        .map_err(|e| ProtocolError::MalformedPdu(format!("bad Message ID: {e}")))?;

    let sop_class_uid = string_field(&obj, tags::AFFECTED_SOP_CLASS_UID)
        .or_else(|| string_field(&obj, tags::REQUESTED_SOP_CLASS_UID))
        .ok_or_else(|| ProtocolError::MalformedPdu("command set without SOP Class UID".into()))?;

    let sop_instance_uid = string_field(&obj, tags::AFFECTED_SOP_INSTANCE_UID)
        .or_else(|| string_field(&obj, tags::REQUESTED_SOP_INSTANCE_UID));

    let action_type_id = obj
        .get(tags::ACTION_TYPE_ID)
        .and_then(|el| el.to_int::<u16>().ok());

    let attribute_list = obj
        .get(tags::ATTRIBUTE_IDENTIFIER_LIST)
        .map(|el| match el.value() {
            Value::Primitive(PrimitiveValue::Tags(tags)) => tags.to_vec(),
            _ => Vec::new(),
        })
        .unwrap_or_default();

    let has_dataset = obj
        .get(tags::COMMAND_DATA_SET_TYPE)
        .and_then(|el| el.to_int::<u16>().ok())
        .map(|v| v != NO_DATA_SET)
        .unwrap_or(false);

    Ok(DimseRequest {
        command_field,
        message_id,
        sop_class_uid,
        sop_instance_uid,
        action_type_id,
        attribute_list,
        has_dataset,
    })
}

fn string_field(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.get(tag)
        .and_then(|el| el.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Build and serialize the response command set for a request.
pub fn encode_response_command(
    req: &DimseRequest,
    response_status: u16,
    has_dataset: bool,
) -> Result<Vec<u8>, ProtocolError> {
    let mut obj = InMemDicomObject::new_empty();

    obj.put(DataElement::new(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, req.sop_class_uid.as_str()),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [commands::response_of(req.command_field)]),
    ));
    obj.put(DataElement::new(
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        VR::US,
        dicom_value!(U16, [req.message_id]),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [if has_dataset { DATA_SET_PRESENT } else { NO_DATA_SET }]),
    ));
    obj.put(DataElement::new(
        tags::STATUS,
        VR::US,
        dicom_value!(U16, [response_status]),
    ));
    if let Some(uid) = &req.sop_instance_uid {
        obj.put(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid.as_str()),
        ));
    }
    if req.command_field == commands::N_ACTION_RQ {
        if let Some(action_type) = req.action_type_id {
            obj.put(DataElement::new(
                tags::ACTION_TYPE_ID,
                VR::US,
                dicom_value!(U16, [action_type]),
            ));
        }
    }

    encode_command_set(obj)
}

/// Serialize a command set, computing the Command Group Length by first
/// writing the body without it.
pub fn encode_command_set(mut obj: InMemDicomObject) -> Result<Vec<u8>, ProtocolError> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();

    let mut body = Vec::new();
    obj.write_dataset_with_ts(&mut body, &ts)
        .map_err(ProtocolError::EncodeCommand)?;

    obj.put(DataElement::new(
        tags::COMMAND_GROUP_LENGTH,
        VR::UL,
        PrimitiveValue::from(body.len() as u32),
    ));
    let mut full = Vec::with_capacity(body.len() + 12);
    obj.write_dataset_with_ts(&mut full, &ts)
        .map_err(ProtocolError::EncodeCommand)?;
    Ok(full)
}
