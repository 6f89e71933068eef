//! Association worker.
//!
//! One worker runs per accepted connection, strictly single-threaded:
//! negotiate with `dicom-ul`, assemble DIMSE messages out of P-DATA
//! fragments, dispatch them in arrival order, and send each response before
//! touching the next request. The worker owns the association's
//! [`PrintStore`]; dropping it on release or abort is what cascades
//! deletion of the print hierarchy.

use std::net::TcpStream;
use std::sync::Arc;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_ul::association::server::{AccessControl, ServerAssociationOptions};
use dicom_ul::association::ServerAssociation;
use dicom_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJServiceUserReason, PDataValue,
    PDataValueType, UserIdentity,
};
use dicom_ul::Pdu;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dimse::{self, DimseRequest};
use crate::error::ProtocolError;
use crate::handlers::{self, DimseReply, Dispatch, HandlerContext};
use crate::server::ServerContext;
use crate::store::PrintStore;

/// Response data sets are fragmented into chunks this large.
const DATA_CHUNK_SIZE: usize = 8 * 1024;

/// Accepts associations whose called AE title matches this node's title,
/// case-insensitively after trimming.
#[derive(Debug, Default, Copy, Clone)]
pub struct AcceptCalledAeTitleCaseInsensitive;

impl AccessControl for AcceptCalledAeTitleCaseInsensitive {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title
            .trim()
            .eq_ignore_ascii_case(called_ae_title.trim())
        {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

#[derive(Default)]
struct MessageAssembly {
    command: Vec<u8>,
    dataset: Vec<u8>,
    /// a parsed command waiting for its data set
    pending: Option<(DimseRequest, u8)>,
}

enum LoopAction {
    Continue,
    Stop,
}

/// Drive one association until release, abort, or a protocol fault.
pub fn run_association(ctx: Arc<ServerContext>, stream: TcpStream) -> Result<(), ProtocolError> {
    let association_id = Uuid::new_v4().to_string();
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut options = ServerAssociationOptions::new()
        .ae_access_control(AcceptCalledAeTitleCaseInsensitive)
        .ae_title(ctx.config.ae_title.trim())
        .max_pdu_length(ctx.config.max_pdu_length)
        .timeout(ctx.config.idle_timeout())
        .strict(false)
        .promiscuous(false);
    for uid in ctx.transfer_syntaxes.all_uids() {
        options = options.with_transfer_syntax(uid);
    }
    for uid in ctx.sop_classes.all_uids() {
        options = options.with_abstract_syntax(uid);
    }

    let mut association = options.establish(stream)?;
    info!(
        association_id = %association_id,
        peer = %peer,
        calling_ae_title = %association.client_ae_title(),
        "association established"
    );
    for pc in association.presentation_contexts() {
        debug!(
            association_id = %association_id,
            id = pc.id,
            transfer_syntax = %pc.transfer_syntax,
            "accepted presentation context"
        );
    }

    // a second handle onto the socket lets long print work poll for an
    // abort without disturbing the association's reader
    let probe_stream = association.inner_stream().try_clone()?;

    let mut store = PrintStore::new(
        association_id.clone(),
        ctx.config.max_pixel_bytes,
        ctx.config.job_retention(),
    );
    let mut assembly = MessageAssembly::default();

    loop {
        match association.receive() {
            Ok(Pdu::PData { data }) => {
                let mut action = LoopAction::Continue;
                for pdv in data {
                    match handle_pdata_value(
                        &ctx,
                        &mut association,
                        &mut store,
                        &mut assembly,
                        &probe_stream,
                        pdv,
                    ) {
                        Ok(LoopAction::Continue) => {}
                        Ok(LoopAction::Stop) => {
                            action = LoopAction::Stop;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                association_id = %association_id,
                                error = %e,
                                "protocol fault, aborting association"
                            );
                            abort(&mut association);
                            return Err(e);
                        }
                    }
                }
                if matches!(action, LoopAction::Stop) {
                    break;
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                if let Err(e) = association.send(&Pdu::ReleaseRP) {
                    warn!(association_id = %association_id, error = %e, "failed to confirm release");
                }
                info!(association_id = %association_id, "association released");
                break;
            }
            Ok(Pdu::AbortRQ { source }) => {
                warn!(association_id = %association_id, source = ?source, "association aborted by peer");
                break;
            }
            Ok(other) => {
                warn!(
                    association_id = %association_id,
                    pdu = %other.short_description(),
                    "unexpected PDU in open association, aborting"
                );
                abort(&mut association);
                break;
            }
            Err(e) => {
                // transport fault or idle timeout
                warn!(association_id = %association_id, error = %e, "receive failed, aborting association");
                abort(&mut association);
                break;
            }
        }
    }

    // dropping the store cascades deletion of everything the job sink has
    // not taken over
    drop(store);
    info!(association_id = %association_id, peer = %peer, "association closed");
    Ok(())
}

fn abort(association: &mut ServerAssociation<TcpStream>) {
    let _ = association.send(&Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(
            AbortRQServiceProviderReason::UnrecognizedPdu,
        ),
    });
}

fn handle_pdata_value(
    ctx: &Arc<ServerContext>,
    association: &mut ServerAssociation<TcpStream>,
    store: &mut PrintStore,
    assembly: &mut MessageAssembly,
    probe_stream: &TcpStream,
    mut pdv: PDataValue,
) -> Result<LoopAction, ProtocolError> {
    match pdv.value_type {
        PDataValueType::Command => {
            assembly.command.append(&mut pdv.data);
            if !pdv.is_last {
                return Ok(LoopAction::Continue);
            }
            let req = dimse::parse_request(&assembly.command)?;
            assembly.command.clear();
            if req.has_dataset {
                assembly.pending = Some((req, pdv.presentation_context_id));
                Ok(LoopAction::Continue)
            } else {
                process_request(
                    ctx,
                    association,
                    store,
                    probe_stream,
                    req,
                    None,
                    pdv.presentation_context_id,
                )
            }
        }
        PDataValueType::Data => {
            assembly.dataset.append(&mut pdv.data);
            if !pdv.is_last {
                return Ok(LoopAction::Continue);
            }
            let (req, pc_id) = assembly.pending.take().ok_or_else(|| {
                ProtocolError::MalformedPdu("data set fragment without a pending command".into())
            })?;
            let bytes = std::mem::take(&mut assembly.dataset);
            let dataset = decode_dataset(association, pc_id, &bytes)?;
            process_request(ctx, association, store, probe_stream, req, Some(dataset), pc_id)
        }
    }
}

fn decode_dataset(
    association: &ServerAssociation<TcpStream>,
    pc_id: u8,
    bytes: &[u8],
) -> Result<InMemDicomObject, ProtocolError> {
    let ts_uid = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.clone())
        .ok_or_else(|| {
            ProtocolError::MalformedPdu(format!("unknown presentation context {pc_id}"))
        })?;
    let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or(ProtocolError::UnsupportedTransferSyntax { uid: ts_uid })?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).map_err(ProtocolError::DecodeDataSet)
}

fn process_request(
    ctx: &Arc<ServerContext>,
    association: &mut ServerAssociation<TcpStream>,
    store: &mut PrintStore,
    probe_stream: &TcpStream,
    req: DimseRequest,
    dataset: Option<InMemDicomObject>,
    pc_id: u8,
) -> Result<LoopAction, ProtocolError> {
    let cancelled = || abort_pending(probe_stream);
    let handler_ctx = HandlerContext {
        config: &ctx.config,
        sink: &ctx.sink,
        cancelled: &cancelled,
    };

    match handlers::dispatch(&handler_ctx, store, &req, dataset) {
        Dispatch::Reply(reply) => {
            send_response(association, pc_id, &req, reply)?;
            Ok(LoopAction::Continue)
        }
        Dispatch::Cancelled => Ok(LoopAction::Stop),
    }
}

/// True when the peer already pushed more bytes while a request handler is
/// still running. Mid-request, the only legitimate traffic is an A-ABORT
/// (PDU type 7); a closed socket counts as gone as well.
fn abort_pending(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let cancelled = match stream.peek(&mut probe) {
        Ok(0) => true,
        Ok(_) => probe[0] == 0x07,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    cancelled
}

fn send_response(
    association: &mut ServerAssociation<TcpStream>,
    pc_id: u8,
    req: &DimseRequest,
    reply: DimseReply,
) -> Result<(), ProtocolError> {
    let mut response_req = req.clone();
    if let Some(uid) = &reply.affected_sop_instance {
        response_req.sop_instance_uid = Some(uid.clone());
    }

    let has_dataset = reply.dataset.is_some();
    let command = dimse::encode_response_command(&response_req, reply.status, has_dataset)?;
    association.send(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: command,
        }],
    })?;

    let Some(dataset) = reply.dataset else {
        return Ok(());
    };

    let ts_uid = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.clone())
        .ok_or_else(|| {
            ProtocolError::MalformedPdu(format!("unknown presentation context {pc_id}"))
        })?;
    let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or(ProtocolError::UnsupportedTransferSyntax { uid: ts_uid })?;

    let mut buffer = Vec::new();
    dataset
        .write_dataset_with_ts(&mut buffer, ts)
        .map_err(ProtocolError::EncodeDataSet)?;

    let mut offset = 0;
    loop {
        let end = (offset + DATA_CHUNK_SIZE).min(buffer.len());
        let is_last = end == buffer.len();
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last,
                data: buffer[offset..end].to_vec(),
            }],
        })?;
        if is_last {
            break;
        }
        offset = end;
    }
    Ok(())
}
