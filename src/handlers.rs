//! DIMSE request handlers.
//!
//! Every handler returns an explicit `(status, dataset)` pair. The
//! dispatcher is the single place where a panicking handler is converted
//! into a `0x0110` response; the association itself survives any single bad
//! request.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dicom_core::value::{DataSetSequence, Value};
use dicom_core::{dicom_value, DataElement, Length, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dimse::{commands, status, DimseRequest};
use crate::error::ServiceError;
use crate::job::{JobMetadata, JobSink};
use crate::page;
use crate::store::{EntityKind, ExecutionStatus, PrintStore};

/// Referenced Print Job Sequence (2100,0500)
const REFERENCED_PRINT_JOB_SEQUENCE: Tag = Tag(0x2100, 0x0500);

pub struct HandlerContext<'a> {
    pub config: &'a ServerConfig,
    pub sink: &'a Arc<dyn JobSink>,
    /// polled during long print work; true once the peer has aborted
    pub cancelled: &'a dyn Fn() -> bool,
}

#[derive(Debug)]
pub struct DimseReply {
    pub status: u16,
    pub dataset: Option<InMemDicomObject>,
    /// set when the server generated or normalized the instance UID
    pub affected_sop_instance: Option<String>,
}

impl DimseReply {
    fn status_only(status: u16) -> Self {
        Self {
            status,
            dataset: None,
            affected_sop_instance: None,
        }
    }
}

/// Dispatch outcome: either a reply to send, or the request died with the
/// association (peer abort).
#[derive(Debug)]
pub enum Dispatch {
    Reply(DimseReply),
    Cancelled,
}

pub fn dispatch(
    ctx: &HandlerContext,
    store: &mut PrintStore,
    req: &DimseRequest,
    dataset: Option<InMemDicomObject>,
) -> Dispatch {
    match catch_unwind(AssertUnwindSafe(|| route(ctx, store, req, dataset))) {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                association_id = %store.association_id(),
                message_id = req.message_id,
                command = %format_args!("{:#06x}", req.command_field),
                "handler panicked; responding with processing failure"
            );
            Dispatch::Reply(DimseReply::status_only(status::PROCESSING_FAILURE))
        }
    }
}

fn route(
    ctx: &HandlerContext,
    store: &mut PrintStore,
    req: &DimseRequest,
    dataset: Option<InMemDicomObject>,
) -> Dispatch {
    let result = match req.command_field {
        commands::C_ECHO_RQ => Ok(DimseReply::status_only(status::SUCCESS)),
        commands::N_CREATE_RQ => n_create(ctx, store, req, dataset.as_ref()),
        commands::N_SET_RQ => n_set(store, req, dataset),
        commands::N_ACTION_RQ => return n_action(ctx, store, req),
        commands::N_DELETE_RQ => n_delete(store, req),
        commands::N_GET_RQ => n_get(ctx, store, req),
        commands::C_STORE_RQ => c_store(ctx, store, req, dataset),
        other => {
            warn!(
                command = %format_args!("{:#06x}", other),
                "unsupported DIMSE command"
            );
            Err(ServiceError::UnsupportedOperation(format!(
                "command field {other:#06x}"
            )))
        }
    };
    Dispatch::Reply(finish(result, store, req))
}

/// Convert a handler result into the reply and log its status.
fn finish(
    result: Result<DimseReply, ServiceError>,
    store: &PrintStore,
    req: &DimseRequest,
) -> DimseReply {
    let uid = req.sop_instance_uid.as_deref().unwrap_or("-");
    match result {
        Ok(reply) => {
            if status::is_warning(reply.status) {
                warn!(
                    association_id = %store.association_id(),
                    message_id = req.message_id,
                    sop_instance = uid,
                    status = %format_args!("{:#06x}", reply.status),
                    "request completed with warning"
                );
            } else {
                debug!(
                    association_id = %store.association_id(),
                    message_id = req.message_id,
                    sop_instance = uid,
                    status = %format_args!("{:#06x}", reply.status),
                    "request completed"
                );
            }
            reply
        }
        Err(e) => {
            warn!(
                association_id = %store.association_id(),
                message_id = req.message_id,
                sop_instance = uid,
                status = %format_args!("{:#06x}", e.status()),
                error = %e,
                "request failed"
            );
            DimseReply::status_only(e.status())
        }
    }
}

// ---------------------------------------------------------------------------
// N-CREATE
// ---------------------------------------------------------------------------

fn n_create(
    ctx: &HandlerContext,
    store: &mut PrintStore,
    req: &DimseRequest,
    dataset: Option<&InMemDicomObject>,
) -> Result<DimseReply, ServiceError> {
    match req.sop_class_uid.as_str() {
        uids::BASIC_FILM_SESSION => {
            let association_id = store.association_id().to_string();
            let session = store.create_film_session(req.sop_instance_uid.clone(), dataset)?;

            let mut out = InMemDicomObject::new_empty();
            put_str(&mut out, tags::SOP_CLASS_UID, VR::UI, uids::BASIC_FILM_SESSION);
            put_str(&mut out, tags::SOP_INSTANCE_UID, VR::UI, &session.uid);
            put_str(
                &mut out,
                tags::NUMBER_OF_COPIES,
                VR::IS,
                &session.number_of_copies.to_string(),
            );
            put_str(
                &mut out,
                tags::PRINT_PRIORITY,
                VR::CS,
                session.print_priority.as_str(),
            );
            put_str(&mut out, tags::MEDIUM_TYPE, VR::CS, &session.medium_type);
            put_str(
                &mut out,
                tags::FILM_DESTINATION,
                VR::CS,
                &session.film_destination,
            );

            info!(
                association_id = %association_id,
                uid = %session.uid,
                "film session created"
            );
            let uid = session.uid.clone();
            Ok(DimseReply {
                status: status::SUCCESS,
                dataset: Some(out),
                affected_sop_instance: Some(uid),
            })
        }
        uids::BASIC_FILM_BOX => {
            let created = store.create_film_box(
                req.sop_instance_uid.clone(),
                dataset,
                ctx.config.standard_format_rows_first,
                ctx.config.max_density,
            )?;
            let film_box = store.film_box(&created.uid).expect("just created");
            // the references advertise the grayscale class; the SCU is free
            // to address the slots as color image boxes, and the page color
            // mode follows the pixel data that actually arrives
            let image_box_class = uids::BASIC_GRAYSCALE_IMAGE_BOX;

            let mut out = InMemDicomObject::new_empty();
            put_str(&mut out, tags::SOP_CLASS_UID, VR::UI, uids::BASIC_FILM_BOX);
            put_str(&mut out, tags::SOP_INSTANCE_UID, VR::UI, &film_box.uid);
            put_str(
                &mut out,
                tags::IMAGE_DISPLAY_FORMAT,
                VR::ST,
                &film_box.format.to_dicom(),
            );
            put_str(
                &mut out,
                tags::FILM_ORIENTATION,
                VR::CS,
                film_box.orientation.as_str(),
            );
            put_str(&mut out, tags::FILM_SIZE_ID, VR::CS, &film_box.film_size_id);
            put_str(
                &mut out,
                tags::MAGNIFICATION_TYPE,
                VR::CS,
                film_box.magnification.as_str(),
            );
            put_u16(&mut out, tags::MAX_DENSITY, film_box.max_density);

            let items: Vec<InMemDicomObject> = created
                .image_box_uids
                .iter()
                .map(|uid| {
                    let mut item = InMemDicomObject::new_empty();
                    put_str(&mut item, tags::REFERENCED_SOP_CLASS_UID, VR::UI, image_box_class);
                    put_str(&mut item, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, uid);
                    item
                })
                .collect();
            out.put(DataElement::new(
                tags::REFERENCED_IMAGE_BOX_SEQUENCE,
                VR::SQ,
                Value::from(DataSetSequence::new(
                    SmallVec::from_vec(items),
                    Length::UNDEFINED,
                )),
            ));

            info!(
                association_id = %store.association_id(),
                uid = %created.uid,
                slots = created.image_box_uids.len(),
                "film box created"
            );
            let reply_status = if created.warning {
                status::WARNING_MAX_DENSITY_EXCEEDED
            } else {
                status::SUCCESS
            };
            Ok(DimseReply {
                status: reply_status,
                dataset: Some(out),
                affected_sop_instance: Some(created.uid),
            })
        }
        other => Err(ServiceError::UnsupportedOperation(format!(
            "N-CREATE on {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// N-SET
// ---------------------------------------------------------------------------

fn n_set(
    store: &mut PrintStore,
    req: &DimseRequest,
    dataset: Option<InMemDicomObject>,
) -> Result<DimseReply, ServiceError> {
    let uid = req.sop_instance_uid.as_deref().ok_or_else(|| {
        ServiceError::InvalidAttributeValue("N-SET without a Requested SOP Instance UID".into())
    })?;
    let ds = dataset.unwrap_or_else(InMemDicomObject::new_empty);

    match store.kind_of(uid) {
        Some(EntityKind::FilmSession) => store.set_film_session(uid, &ds)?,
        Some(EntityKind::FilmBox) => store.set_film_box(uid, &ds)?,
        Some(EntityKind::ImageBox) => store.set_image_box(uid, ds)?,
        Some(EntityKind::PrintJob) => {
            return Err(ServiceError::InvalidObjectInstance(uid.to_string()))
        }
        None => return Err(ServiceError::NoSuchObjectInstance(uid.to_string())),
    }
    Ok(DimseReply::status_only(status::SUCCESS))
}

// ---------------------------------------------------------------------------
// N-ACTION (print)
// ---------------------------------------------------------------------------

fn n_action(ctx: &HandlerContext, store: &mut PrintStore, req: &DimseRequest) -> Dispatch {
    let Some(uid) = req.sop_instance_uid.clone() else {
        return Dispatch::Reply(finish(
            Err(ServiceError::InvalidAttributeValue(
                "N-ACTION without a Requested SOP Instance UID".into(),
            )),
            store,
            req,
        ));
    };
    let action_type = req.action_type_id.unwrap_or(1);
    if action_type != 1 {
        return Dispatch::Reply(finish(
            Err(ServiceError::UnsupportedOperation(format!(
                "action type {action_type}"
            ))),
            store,
            req,
        ));
    }

    let film_boxes = match store.kind_of(&uid) {
        Some(EntityKind::FilmBox) => vec![uid.clone()],
        Some(EntityKind::FilmSession) => match store.session_film_boxes(&uid) {
            Ok(boxes) => boxes,
            Err(e) => return Dispatch::Reply(finish(Err(e), store, req)),
        },
        Some(_) => {
            return Dispatch::Reply(finish(
                Err(ServiceError::InvalidObjectInstance(uid)),
                store,
                req,
            ))
        }
        None => {
            return Dispatch::Reply(finish(
                Err(ServiceError::NoSuchObjectInstance(uid)),
                store,
                req,
            ))
        }
    };

    print_film_boxes(ctx, store, req, film_boxes)
}

/// Print the given Film Boxes in order, producing one Print Job each.
fn print_film_boxes(
    ctx: &HandlerContext,
    store: &mut PrintStore,
    req: &DimseRequest,
    film_boxes: Vec<String>,
) -> Dispatch {
    let mut reply_status = status::SUCCESS;
    let mut job_uids = Vec::with_capacity(film_boxes.len());

    for film_box_uid in film_boxes {
        let request = match store.begin_print(&film_box_uid) {
            Ok(request) => request,
            Err(e) => return Dispatch::Reply(finish(Err(e), store, req)),
        };
        let mut job = store.new_print_job(&film_box_uid);
        job.status = ExecutionStatus::Printing;

        // page assembly is CPU-bound; run it on a worker thread and poll
        // for a peer abort while waiting
        let snapshot = request.snapshot.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(page::assemble(&snapshot));
        });

        let deadline = Instant::now() + ctx.config.print_timeout();
        let assembled = loop {
            if (ctx.cancelled)() {
                info!(
                    association_id = %store.association_id(),
                    film_box = %film_box_uid,
                    "print action cancelled by peer abort; discarding page"
                );
                return Dispatch::Cancelled;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(page) => break Some(page),
                Err(mpsc::RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
                Err(_) => break None,
            }
        };

        match assembled {
            Some(assembled) => {
                if assembled.warnings && reply_status == status::SUCCESS {
                    reply_status = status::WARNING_MAX_DENSITY_EXCEEDED;
                }
                let meta = JobMetadata {
                    association_id: store.association_id().to_string(),
                    film_session_uid: request.session.uid.clone(),
                    film_box_uid: film_box_uid.clone(),
                    number_of_copies: request.session.number_of_copies,
                    print_priority: request.session.print_priority.as_str().to_string(),
                    medium_type: request.session.medium_type.clone(),
                    film_destination: request.session.film_destination.clone(),
                };
                match ctx.sink.submit(&assembled.raster, &meta) {
                    Ok(path) => {
                        job.status = ExecutionStatus::Done;
                        job.status_info = path.display().to_string();
                    }
                    Err(e) => {
                        error!(
                            association_id = %store.association_id(),
                            film_box = %film_box_uid,
                            error = %e,
                            "print sink rejected the page"
                        );
                        job.status = ExecutionStatus::Failure;
                        job.status_info = e.to_string();
                        reply_status = status::PROCESSING_FAILURE;
                    }
                }
            }
            None => {
                error!(
                    association_id = %store.association_id(),
                    film_box = %film_box_uid,
                    "page assembly timed out"
                );
                job.status = ExecutionStatus::Failure;
                job.status_info = "page assembly timed out".to_string();
                reply_status = status::PROCESSING_FAILURE;
            }
        }

        job_uids.push(job.uid.clone());
        store.store_print_job(job);
    }

    let items: Vec<InMemDicomObject> = job_uids
        .iter()
        .map(|job_uid| {
            let mut item = InMemDicomObject::new_empty();
            put_str(&mut item, tags::REFERENCED_SOP_CLASS_UID, VR::UI, uids::PRINT_JOB);
            put_str(&mut item, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, job_uid);
            item
        })
        .collect();
    let mut out = InMemDicomObject::new_empty();
    out.put(DataElement::new(
        REFERENCED_PRINT_JOB_SEQUENCE,
        VR::SQ,
        Value::from(DataSetSequence::new(
            SmallVec::from_vec(items),
            Length::UNDEFINED,
        )),
    ));

    Dispatch::Reply(finish(
        Ok(DimseReply {
            status: reply_status,
            dataset: Some(out),
            affected_sop_instance: None,
        }),
        store,
        req,
    ))
}

// ---------------------------------------------------------------------------
// N-DELETE
// ---------------------------------------------------------------------------

fn n_delete(store: &mut PrintStore, req: &DimseRequest) -> Result<DimseReply, ServiceError> {
    let uid = req.sop_instance_uid.as_deref().ok_or_else(|| {
        ServiceError::InvalidAttributeValue("N-DELETE without a Requested SOP Instance UID".into())
    })?;
    store.delete(uid)?;
    Ok(DimseReply::status_only(status::SUCCESS))
}

// ---------------------------------------------------------------------------
// N-GET
// ---------------------------------------------------------------------------

fn n_get(
    ctx: &HandlerContext,
    store: &mut PrintStore,
    req: &DimseRequest,
) -> Result<DimseReply, ServiceError> {
    let class = req.sop_class_uid.as_str();
    let instance = req.sop_instance_uid.as_deref().unwrap_or("");

    let mut out = if class == uids::PRINTER || instance == uids::PRINTER_INSTANCE {
        printer_dataset(ctx.config)
    } else if class == uids::PRINTER_CONFIGURATION_RETRIEVAL
        || instance == uids::PRINTER_CONFIGURATION_RETRIEVAL_INSTANCE
    {
        printer_configuration_dataset(ctx.config)
    } else if class == uids::PRINT_JOB {
        let job = store
            .print_job(instance)
            .ok_or_else(|| ServiceError::NoSuchObjectInstance(instance.to_string()))?;
        print_job_dataset(job)
    } else {
        return Err(ServiceError::UnsupportedOperation(format!(
            "N-GET on {class}"
        )));
    };

    if !req.attribute_list.is_empty() {
        let wanted = req.attribute_list.clone();
        out.retain(|el| wanted.contains(&el.header().tag));
    }

    Ok(DimseReply {
        status: status::SUCCESS,
        dataset: Some(out),
        affected_sop_instance: None,
    })
}

fn printer_dataset(config: &ServerConfig) -> InMemDicomObject {
    let mut out = InMemDicomObject::new_empty();
    put_str(&mut out, tags::MANUFACTURER, VR::LO, "dicom-printscp");
    put_str(&mut out, tags::PRINTER_STATUS, VR::CS, "NORMAL");
    put_str(&mut out, tags::PRINTER_STATUS_INFO, VR::CS, "NORMAL");
    put_str(&mut out, tags::PRINTER_NAME, VR::LO, &config.printer_name);
    out
}

fn printer_configuration_dataset(config: &ServerConfig) -> InMemDicomObject {
    let mut out = InMemDicomObject::new_empty();
    put_str(&mut out, tags::PRINTER_NAME, VR::LO, &config.printer_name);
    put_str(&mut out, tags::MANUFACTURER, VR::LO, "dicom-printscp");
    put_str(&mut out, tags::MANUFACTURER_MODEL_NAME, VR::LO, "file sink");
    put_str(
        &mut out,
        tags::CONFIGURATION_INFORMATION,
        VR::ST,
        "STANDARD,ROW,COL layouts; A4 default film; PNG output",
    );
    put_str(
        &mut out,
        tags::MEMORY_ALLOCATION,
        VR::IS,
        &(config.max_pixel_bytes / (1024 * 1024)).to_string(),
    );
    out
}

fn print_job_dataset(job: &crate::store::PrintJob) -> InMemDicomObject {
    let mut out = InMemDicomObject::new_empty();
    put_str(&mut out, tags::SOP_CLASS_UID, VR::UI, uids::PRINT_JOB);
    put_str(&mut out, tags::SOP_INSTANCE_UID, VR::UI, &job.uid);
    put_str(
        &mut out,
        tags::EXECUTION_STATUS,
        VR::CS,
        job.status.as_str(),
    );
    put_str(
        &mut out,
        tags::EXECUTION_STATUS_INFO,
        VR::CS,
        &job.status_info,
    );
    put_str(
        &mut out,
        tags::CREATION_DATE,
        VR::DA,
        &job.created.format("%Y%m%d").to_string(),
    );
    put_str(
        &mut out,
        tags::CREATION_TIME,
        VR::TM,
        &job.created.format("%H%M%S").to_string(),
    );
    out
}

// ---------------------------------------------------------------------------
// C-STORE fallback
// ---------------------------------------------------------------------------

fn c_store(
    ctx: &HandlerContext,
    store: &mut PrintStore,
    req: &DimseRequest,
    dataset: Option<InMemDicomObject>,
) -> Result<DimseReply, ServiceError> {
    let obj = dataset
        .ok_or_else(|| ServiceError::Processing("C-STORE request without a data set".into()))?;

    let sop_instance_uid = req
        .sop_instance_uid
        .clone()
        .unwrap_or_else(crate::store::generate_uid);

    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(&req.sop_class_uid)
        .media_storage_sop_instance_uid(&sop_instance_uid)
        .transfer_syntax(crate::common::transfer_syntaxes::EXPLICIT_VR_LE)
        .build()
        .map_err(|e| ServiceError::Processing(format!("file meta: {e}")))?;
    let file_obj = obj.with_exact_meta(file_meta);

    let dir = ctx.config.output_dir.join(store.association_id());
    std::fs::create_dir_all(&dir).map_err(|e| ServiceError::Processing(e.to_string()))?;
    let path = dir.join(format!("{}.dcm", sop_instance_uid.trim_end_matches('\0')));
    file_obj
        .write_to_file(&path)
        .map_err(|e| ServiceError::Processing(format!("could not save instance: {e}")))?;

    info!(
        association_id = %store.association_id(),
        path = %path.display(),
        "stored composite instance"
    );
    Ok(DimseReply::status_only(status::SUCCESS))
}

// ---------------------------------------------------------------------------

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, dicom_value!(Str, value)));
}

fn put_u16(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
}
