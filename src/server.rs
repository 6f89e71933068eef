//! TCP accept loop.
//!
//! Accepts connections on the configured port and hands each one to a
//! blocking association worker. A semaphore caps simultaneous
//! associations; a connection over the limit gets its A-ASSOCIATE-RQ
//! answered with a rejection (local limit exceeded) instead of silently
//! dropping.

use std::sync::Arc;

use dicom_ul::Pdu;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::association;
use crate::common::sop_classes::SopClassRegistry;
use crate::common::transfer_syntaxes::TransferSyntaxRegistry;
use crate::config::ServerConfig;
use crate::job::JobSink;

/// Read-only state shared by every association worker.
pub struct ServerContext {
    pub config: ServerConfig,
    pub sink: Arc<dyn JobSink>,
    pub sop_classes: SopClassRegistry,
    pub transfer_syntaxes: TransferSyntaxRegistry,
}

pub struct PrintServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
}

impl PrintServer {
    pub async fn bind(config: ServerConfig, sink: Arc<dyn JobSink>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        Ok(Self {
            ctx: Arc::new(ServerContext {
                config,
                sink,
                sop_classes: SopClassRegistry::new(),
                transfer_syntaxes: TransferSyntaxRegistry::new(),
            }),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let limiter = Arc::new(Semaphore::new(self.ctx.config.max_associations));
        info!(
            port = self.local_addr().map(|a| a.port()).unwrap_or(0),
            ae_title = %self.ctx.config.ae_title,
            max_associations = self.ctx.config.max_associations,
            "print SCP listening"
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            info!(peer = %addr, "new connection");

            let std_stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(peer = %addr, error = %e, "could not detach socket");
                    continue;
                }
            };
            // the association worker drives the socket with blocking reads
            if let Err(e) = std_stream.set_nonblocking(false) {
                warn!(peer = %addr, error = %e, "could not configure socket");
                continue;
            }

            let ctx = Arc::clone(&self.ctx);
            match Arc::clone(&limiter).try_acquire_owned() {
                Ok(permit) => {
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = association::run_association(ctx, std_stream) {
                            warn!(peer = %addr, error = %e, "association ended with error");
                        }
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(peer = %addr, "association limit reached, rejecting");
                    let max_pdu_length = ctx.config.max_pdu_length;
                    tokio::task::spawn_blocking(move || {
                        reject_over_limit(std_stream, max_pdu_length);
                    });
                }
            }
        }
    }
}

/// Answer the pending A-ASSOCIATE-RQ on an over-limit connection with
/// A-ASSOCIATE-RJ, reason "local limit exceeded".
fn reject_over_limit(mut stream: std::net::TcpStream, max_pdu_length: u32) {
    use dicom_ul::pdu::reader::read_pdu;
    use dicom_ul::pdu::writer::write_pdu;
    use dicom_ul::pdu::{
        AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
        AssociationRJSource,
    };
    use std::io::{Cursor, Read, Write};

    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));

    let mut read_buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let pdu = loop {
        {
            let mut cursor = Cursor::new(&read_buffer[..]);
            match read_pdu(&mut cursor, max_pdu_length, false) {
                Ok(Some(pdu)) => break Some(pdu),
                Ok(None) => {}
                Err(_) => break None,
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => break None,
            Ok(n) => read_buffer.extend_from_slice(&chunk[..n]),
            Err(_) => break None,
        }
    };

    if let Some(Pdu::AssociationRQ(_)) = pdu {
        let rejection = Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Transient,
            source: AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
        });
        let mut buffer = Vec::new();
        if write_pdu(&mut buffer, &rejection).is_ok() {
            let _ = stream.write_all(&buffer);
        }
    }
}
