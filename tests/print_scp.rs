//! End-to-end scenarios against a listening print SCP.
//!
//! Each test boots a real server on an ephemeral port and drives it with
//! the `dicom-ul` client: C-ECHO, the full grayscale print dialogue,
//! error paths, and abort behavior.

use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dicom_core::value::{DataSetSequence, Value};
use dicom_core::{dicom_value, DataElement, Length, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use dicom_ul::association::client::ClientAssociationOptions;
use dicom_ul::pdu::{AbortRQSource, PDataValue, PDataValueType};
use dicom_ul::{ClientAssociation, Pdu};
use smallvec::smallvec;

use dicom_printscp::config::ServerConfig;
use dicom_printscp::dimse::{commands, encode_command_set};
use dicom_printscp::job::FileJobSink;
use dicom_printscp::server::PrintServer;

const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn start_server(output_dir: PathBuf) -> SocketAddr {
    let config = ServerConfig {
        port: 0,
        idle_timeout_secs: 10,
        output_dir: output_dir.clone(),
        ..Default::default()
    };
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            let sink = Arc::new(FileJobSink::new(output_dir));
            let server = PrintServer::bind(config, sink).await.expect("bind");
            addr_tx.send(server.local_addr().unwrap()).unwrap();
            let _ = server.run().await;
        });
    });
    addr_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("server did not start")
}

fn connect(addr: SocketAddr, abstract_syntax: &str) -> ClientAssociation<TcpStream> {
    ClientAssociationOptions::new()
        .calling_ae_title("TESTSCU")
        .called_ae_title("PRINTSCP")
        .max_pdu_length(65536)
        .with_presentation_context(abstract_syntax, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish_with(&format!("127.0.0.1:{}", addr.port()))
        .expect("association")
}

struct Response {
    status: u16,
    message_id: u16,
    dataset: Option<InMemDicomObject>,
}

/// Send one request (command + optional data set) and read its response.
fn roundtrip(
    association: &mut ClientAssociation<TcpStream>,
    command: InMemDicomObject,
    dataset: Option<InMemDicomObject>,
) -> Response {
    let pc = association
        .presentation_contexts()
        .first()
        .expect("accepted presentation context")
        .clone();

    let command_bytes = encode_command_set(command).expect("encode command");
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_bytes,
            }],
        })
        .expect("send command");

    if let Some(ds) = dataset {
        let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
            .get(&pc.transfer_syntax)
            .expect("negotiated transfer syntax");
        let mut buffer = Vec::new();
        ds.write_dataset_with_ts(&mut buffer, ts).expect("encode data set");
        let mut offset = 0;
        loop {
            let end = (offset + 8192).min(buffer.len());
            let is_last = end == buffer.len();
            association
                .send(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Data,
                        is_last,
                        data: buffer[offset..end].to_vec(),
                    }],
                })
                .expect("send data set");
            if is_last {
                break;
            }
            offset = end;
        }
    }

    read_response(association, &pc.transfer_syntax)
}

fn read_response(
    association: &mut ClientAssociation<TcpStream>,
    transfer_syntax: &str,
) -> Response {
    let ts_implicit = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut command_bytes = Vec::new();
    let mut dataset_bytes = Vec::new();
    let mut command: Option<InMemDicomObject> = None;
    let mut expect_dataset = false;
    let mut dataset_done = false;

    loop {
        let pdu = association.receive().expect("receive response");
        let Pdu::PData { data } = pdu else {
            panic!("unexpected PDU while waiting for a response: {pdu:?}");
        };
        for pdv in data {
            match pdv.value_type {
                PDataValueType::Command => {
                    command_bytes.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        let obj = InMemDicomObject::read_dataset_with_ts(
                            command_bytes.as_slice(),
                            &ts_implicit,
                        )
                        .expect("decode response command");
                        expect_dataset = obj
                            .get(tags::COMMAND_DATA_SET_TYPE)
                            .and_then(|el| el.to_int::<u16>().ok())
                            .map(|v| v != 0x0101)
                            .unwrap_or(false);
                        command = Some(obj);
                    }
                }
                PDataValueType::Data => {
                    dataset_bytes.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        dataset_done = true;
                    }
                }
            }
        }

        if let Some(obj) = &command {
            if !expect_dataset || dataset_done {
                let status = obj
                    .get(tags::STATUS)
                    .expect("response status")
                    .to_int::<u16>()
                    .expect("status is an integer");
                let message_id = obj
                    .get(tags::MESSAGE_ID_BEING_RESPONDED_TO)
                    .expect("message id being responded to")
                    .to_int::<u16>()
                    .expect("message id is an integer");
                let dataset = if expect_dataset {
                    let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
                        .get(transfer_syntax)
                        .expect("negotiated transfer syntax");
                    Some(
                        InMemDicomObject::read_dataset_with_ts(dataset_bytes.as_slice(), ts)
                            .expect("decode response data set"),
                    )
                } else {
                    None
                };
                return Response {
                    status,
                    message_id,
                    dataset,
                };
            }
        }
    }
}

// -- command set builders ---------------------------------------------------

fn echo_command(message_id: u16) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, uids::VERIFICATION),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [commands::C_ECHO_RQ]),
    ));
    obj.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [0x0101]),
    ));
    obj
}

fn n_create_command(
    message_id: u16,
    sop_class: &str,
    sop_instance: Option<&str>,
    with_dataset: bool,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, sop_class),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [commands::N_CREATE_RQ]),
    ));
    obj.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [if with_dataset { 0x0001 } else { 0x0101 }]),
    ));
    if let Some(uid) = sop_instance {
        obj.put(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));
    }
    obj
}

fn n_set_command(message_id: u16, sop_class: &str, sop_instance: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::REQUESTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, sop_class),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [commands::N_SET_RQ]),
    ));
    obj.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [0x0001]),
    ));
    obj.put(DataElement::new(
        tags::REQUESTED_SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance),
    ));
    obj
}

fn n_action_command(message_id: u16, sop_class: &str, sop_instance: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::REQUESTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, sop_class),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [commands::N_ACTION_RQ]),
    ));
    obj.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));
    obj.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [0x0101]),
    ));
    obj.put(DataElement::new(
        tags::REQUESTED_SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance),
    ));
    obj.put(DataElement::new(
        tags::ACTION_TYPE_ID,
        VR::US,
        dicom_value!(U16, [1]),
    ));
    obj
}

// -- data set builders ------------------------------------------------------

fn film_box_dataset(session_uid: &str, display_format: &str) -> InMemDicomObject {
    let mut reference = InMemDicomObject::new_empty();
    reference.put(DataElement::new(
        tags::REFERENCED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, uids::BASIC_FILM_SESSION),
    ));
    reference.put(DataElement::new(
        tags::REFERENCED_SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, session_uid),
    ));

    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::IMAGE_DISPLAY_FORMAT,
        VR::ST,
        dicom_value!(Str, display_format),
    ));
    obj.put(DataElement::new(
        tags::FILM_ORIENTATION,
        VR::CS,
        dicom_value!(Str, "PORTRAIT"),
    ));
    obj.put(DataElement::new(
        tags::FILM_SIZE_ID,
        VR::CS,
        dicom_value!(Str, "A4"),
    ));
    obj.put(DataElement::new(
        tags::REFERENCED_FILM_SESSION_SEQUENCE,
        VR::SQ,
        Value::from(DataSetSequence::new(smallvec![reference], Length::UNDEFINED)),
    ));
    obj
}

fn grayscale_image_dataset(
    rows: u16,
    columns: u16,
    photometric: &str,
    pixel: Vec<u8>,
) -> InMemDicomObject {
    let mut image = InMemDicomObject::new_empty();
    image.put(DataElement::new(
        tags::SAMPLES_PER_PIXEL,
        VR::US,
        dicom_value!(U16, [1]),
    ));
    image.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        dicom_value!(Str, photometric),
    ));
    image.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])));
    image.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        dicom_value!(U16, [columns]),
    ));
    image.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        dicom_value!(U16, [8]),
    ));
    image.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        dicom_value!(U16, [8]),
    ));
    image.put(DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [7])));
    image.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        dicom_value!(U16, [0]),
    ));
    image.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        Value::Primitive(PrimitiveValue::U8(pixel.into())),
    ));

    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE,
        VR::SQ,
        Value::from(DataSetSequence::new(smallvec![image], Length::UNDEFINED)),
    ));
    obj
}

fn find_page(output_dir: &Path, film_box_uid: &str) -> Option<PathBuf> {
    for entry in std::fs::read_dir(output_dir).ok()? {
        let dir = entry.ok()?.path();
        if dir.is_dir() {
            let candidate = dir.join(format!("{film_box_uid}.png"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Drive the grayscale print dialogue up to N-ACTION and return the film
/// box UID used.
fn print_one_image(
    association: &mut ClientAssociation<TcpStream>,
    photometric: &str,
    pixel: Vec<u8>,
    rows: u16,
    columns: u16,
) -> String {
    let session_uid = "1.2.826.0.1.3680043.8.999.10.1";
    let film_box_uid = "1.2.826.0.1.3680043.8.999.10.2";

    let rsp = roundtrip(
        association,
        n_create_command(1, uids::BASIC_FILM_SESSION, Some(session_uid), false),
        None,
    );
    assert_eq!(rsp.status, 0x0000, "film session N-CREATE failed");

    let rsp = roundtrip(
        association,
        n_create_command(2, uids::BASIC_FILM_BOX, Some(film_box_uid), true),
        Some(film_box_dataset(session_uid, "STANDARD\\1,1")),
    );
    assert_eq!(rsp.status, 0x0000, "film box N-CREATE failed");
    let refs = rsp.dataset.expect("film box response data set");
    let image_boxes = refs
        .get(tags::REFERENCED_IMAGE_BOX_SEQUENCE)
        .expect("referenced image box sequence")
        .value()
        .items()
        .expect("sequence items")
        .to_vec();
    assert_eq!(image_boxes.len(), 1);
    let image_box_uid = image_boxes[0]
        .get(tags::REFERENCED_SOP_INSTANCE_UID)
        .expect("referenced image box uid")
        .to_str()
        .unwrap()
        .trim_end_matches('\0')
        .to_string();

    let rsp = roundtrip(
        association,
        n_set_command(3, uids::BASIC_GRAYSCALE_IMAGE_BOX, &image_box_uid),
        Some(grayscale_image_dataset(rows, columns, photometric, pixel)),
    );
    assert_eq!(rsp.status, 0x0000, "image box N-SET failed");

    let rsp = roundtrip(
        association,
        n_action_command(4, uids::BASIC_FILM_BOX, film_box_uid),
        None,
    );
    assert_eq!(rsp.status, 0x0000, "film box N-ACTION failed");
    assert_eq!(rsp.message_id, 4);

    film_box_uid.to_string()
}

// ---------------------------------------------------------------------------

#[test]
fn c_echo_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let mut association = connect(addr, uids::VERIFICATION);
    let rsp = roundtrip(&mut association, echo_command(1), None);
    assert_eq!(rsp.status, 0x0000);
    assert_eq!(rsp.message_id, 1);
    association.release().expect("clean release");
}

#[test]
fn single_grayscale_print_writes_a_page() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let mut association = connect(addr, uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META);
    // a 256x256 gradient covering every 8-bit value
    let pixel: Vec<u8> = (0..256u32 * 256).map(|i| (i % 256) as u8).collect();
    let film_box_uid = print_one_image(&mut association, "MONOCHROME2", pixel, 256, 256);
    association.release().expect("clean release");

    let page = find_page(dir.path(), &film_box_uid).expect("page file on disk");
    let img = image::open(&page).expect("page decodes").to_luma8();
    // A4 portrait at 300 DPI
    assert_eq!(img.dimensions(), (2480, 3508));
    // the gradient survives normalization end-to-end
    let min = img.pixels().map(|p| p.0[0]).min().unwrap();
    let max = img.pixels().map(|p| p.0[0]).max().unwrap();
    assert_eq!(min, 0);
    assert_eq!(max, 255);
}

#[test]
fn monochrome1_zero_prints_white() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let mut association = connect(addr, uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META);
    let film_box_uid = print_one_image(
        &mut association,
        "MONOCHROME1",
        vec![0u8; 32 * 32],
        32,
        32,
    );
    association.release().expect("clean release");

    let page = find_page(dir.path(), &film_box_uid).expect("page file on disk");
    let img = image::open(&page).expect("page decodes").to_luma8();
    // inverted all-zero input renders white, so the whole page is white
    assert!(img.pixels().all(|p| p.0[0] == 255));
}

#[test]
fn n_set_on_unknown_instance_keeps_association_open() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let mut association = connect(addr, uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META);
    let rsp = roundtrip(
        &mut association,
        n_set_command(1, uids::BASIC_GRAYSCALE_IMAGE_BOX, "1.2.840.99999.404"),
        Some(grayscale_image_dataset(2, 2, "MONOCHROME2", vec![0; 4])),
    );
    assert_eq!(rsp.status, 0x0112);

    // the association survives: a valid create right after succeeds
    let rsp = roundtrip(
        &mut association,
        n_create_command(
            2,
            uids::BASIC_FILM_SESSION,
            Some("1.2.826.0.1.3680043.8.999.11.1"),
            false,
        ),
        None,
    );
    assert_eq!(rsp.status, 0x0000);
    association.release().expect("clean release");
}

#[test]
fn abort_closes_and_server_accepts_again() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let mut association = connect(addr, uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META);
    association
        .send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        })
        .expect("send abort");
    drop(association);

    // a fresh association must be accepted promptly
    let started = std::time::Instant::now();
    let mut association = connect(addr, uids::VERIFICATION);
    assert!(started.elapsed() < Duration::from_secs(1));
    let rsp = roundtrip(&mut association, echo_command(1), None);
    assert_eq!(rsp.status, 0x0000);
    association.release().expect("clean release");

    // nothing was printed by the aborted association
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .flat_map(|d| std::fs::read_dir(d.path()).into_iter().flatten().flatten())
        .collect();
    assert!(leftovers.is_empty(), "aborted association left {leftovers:?}");
}

#[test]
fn abort_mid_print_discards_the_page() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let session_uid = "1.2.826.0.1.3680043.8.999.12.1";
    let film_box_uid = "1.2.826.0.1.3680043.8.999.12.2";

    let mut association = connect(addr, uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META);
    let rsp = roundtrip(
        &mut association,
        n_create_command(1, uids::BASIC_FILM_SESSION, Some(session_uid), false),
        None,
    );
    assert_eq!(rsp.status, 0x0000, "film session N-CREATE failed");

    let rsp = roundtrip(
        &mut association,
        n_create_command(2, uids::BASIC_FILM_BOX, Some(film_box_uid), true),
        Some(film_box_dataset(session_uid, "STANDARD\\2,2")),
    );
    assert_eq!(rsp.status, 0x0000, "film box N-CREATE failed");
    let refs = rsp.dataset.expect("film box response data set");
    let image_boxes = refs
        .get(tags::REFERENCED_IMAGE_BOX_SEQUENCE)
        .expect("referenced image box sequence")
        .value()
        .items()
        .expect("sequence items")
        .to_vec();
    assert_eq!(image_boxes.len(), 4);

    // fill all four slots with large frames so page assembly is still
    // running when the abort arrives
    let pixel: Vec<u8> = (0..512u32 * 512).map(|i| (i % 256) as u8).collect();
    for (index, item) in image_boxes.iter().enumerate() {
        let image_box_uid = item
            .get(tags::REFERENCED_SOP_INSTANCE_UID)
            .expect("referenced image box uid")
            .to_str()
            .unwrap()
            .trim_end_matches('\0')
            .to_string();
        let rsp = roundtrip(
            &mut association,
            n_set_command(
                3 + index as u16,
                uids::BASIC_GRAYSCALE_IMAGE_BOX,
                &image_box_uid,
            ),
            Some(grayscale_image_dataset(512, 512, "MONOCHROME2", pixel.clone())),
        );
        assert_eq!(rsp.status, 0x0000, "image box N-SET failed");
    }

    // fire the print action and abort without waiting for its response
    let pc = association
        .presentation_contexts()
        .first()
        .expect("accepted presentation context")
        .clone();
    let command_bytes = encode_command_set(n_action_command(7, uids::BASIC_FILM_BOX, film_box_uid))
        .expect("encode command");
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_bytes,
            }],
        })
        .expect("send action");
    association
        .send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        })
        .expect("send abort");
    drop(association);

    // the server must accept a fresh association promptly
    let started = std::time::Instant::now();
    let mut association = connect(addr, uids::VERIFICATION);
    assert!(started.elapsed() < Duration::from_secs(1));
    let rsp = roundtrip(&mut association, echo_command(1), None);
    assert_eq!(rsp.status, 0x0000);
    association.release().expect("clean release");

    // give the discarded assembly time to run to completion; the
    // cancelled action may never produce an output file
    std::thread::sleep(Duration::from_secs(2));
    assert!(
        find_page(dir.path(), film_box_uid).is_none(),
        "cancelled print left a page behind"
    );
}

#[test]
fn mismatched_called_ae_title_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path().to_path_buf());

    let result = ClientAssociationOptions::new()
        .calling_ae_title("TESTSCU")
        .called_ae_title("SOMEONE_ELSE")
        .with_presentation_context(uids::VERIFICATION, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish_with(&format!("127.0.0.1:{}", addr.port()));
    assert!(result.is_err(), "association should have been rejected");

    // the AE title match is case-insensitive
    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TESTSCU")
        .called_ae_title("printscp")
        .with_presentation_context(uids::VERIFICATION, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish_with(&format!("127.0.0.1:{}", addr.port()))
        .expect("case-insensitive match accepted");
    let rsp = roundtrip(&mut association, echo_command(1), None);
    assert_eq!(rsp.status, 0x0000);
    association.release().expect("clean release");
}
