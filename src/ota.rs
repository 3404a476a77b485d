// OTA firmware update engine
//
// Runs over the live session link (ConnectionSource::Reused), so the
// Scan..FindCharacteristics steps are never entered. Wire protocol on the
// BGX OTA service:
//
//   control <- 0x00 [password bytes, 0x00]   open transfer
//   data    <- image chunks                  ack mode chosen by the caller
//   control <- 0x03                          finalize, peripheral installs
//   control <- 0x04                          abort (best effort, on cancel)
//
// Progress is reported only for chunks the transport accepted. Cancel stops
// the next chunk from being issued and ends with UserCanceled, never Failed.

use crate::error::BgxError;
use crate::events::BgxEvent;
use crate::session::{BgxSession, Shared};
use crate::transport::{BgxCharacteristic, TransportError, CODE_TIMEOUT};
use crate::types::{
    AckMode, ConnectionSource, ConnectionState, CredentialPurpose, ImageRef, OtaFailureReason,
    OtaOperation, OtaSession, OtaStatus, OtaStep,
};
use crate::version::FirmwareVersion;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const OTA_CONTROL_START: u8 = 0x00;
const OTA_CONTROL_FINISH: u8 = 0x03;
const OTA_CONTROL_ABORT: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelCause {
    User,
    LinkLost,
}

/// Running OTA transfer owned by a session.
pub(crate) struct OtaSlot {
    pub(crate) session: OtaSession,
    cancel: watch::Sender<Option<CancelCause>>,
    /// Closed when the transfer task exits.
    done: watch::Receiver<()>,
}

/// Everything needed to start a transfer.
#[derive(Clone)]
pub struct OtaRequest {
    pub image: ImageRef,
    pub ack_mode: AckMode,
    pub password: Option<String>,
    /// Catalog version of `image`, when known. Only used to log whether this
    /// is an upgrade; downgrades are allowed.
    pub version: Option<FirmwareVersion>,
}

impl OtaRequest {
    pub fn new(image: ImageRef, ack_mode: AckMode) -> Self {
        Self {
            image,
            ack_mode,
            password: None,
            version: None,
        }
    }
}

enum Interrupt {
    Canceled(CancelCause),
    PasswordRequired,
    Failed(OtaStep, OtaFailureReason),
}

fn failure_reason(e: &TransportError) -> OtaFailureReason {
    if e.code == CODE_TIMEOUT {
        OtaFailureReason::Timeout
    } else if e.is_password_rejection() {
        OtaFailureReason::PasswordRejected
    } else {
        OtaFailureReason::Transport {
            code: e.code,
            message: e.message.clone(),
        }
    }
}

/// Control payload that opens a transfer.
pub fn open_command(password: Option<&str>) -> Vec<u8> {
    let mut cmd = vec![OTA_CONTROL_START];
    if let Some(pw) = password.filter(|pw| !pw.is_empty()) {
        cmd.extend_from_slice(pw.as_bytes());
        cmd.push(0);
    }
    cmd
}

impl BgxSession {
    /// Start an OTA transfer. Returns once the transfer task is running;
    /// progress and the outcome arrive as `OtaProgress`/`OtaStatus` events.
    pub fn start_ota(&self, request: OtaRequest) -> Result<(), BgxError> {
        self.require_connected()?;
        if self.shared.lock_ota().is_some() {
            return Err(BgxError::Busy);
        }

        if let (Some(candidate), Some(running)) = (
            request.version,
            self.shared.running_firmware().and_then(|f| f.version),
        ) {
            if !candidate.is_newer_than(&running) {
                tlog!(
                    "[ota] {} installing {} over {} (not an upgrade)",
                    self.address(),
                    candidate,
                    running
                );
            }
        }

        let image = request.image.load()?;
        if image.is_empty() {
            return Err(BgxError::Io("Firmware image is empty".into()));
        }
        let total_bytes = u32::try_from(image.len())
            .map_err(|_| BgxError::Io(format!("Firmware image too large: {} bytes", image.len())))?;

        let supplied = request.password.filter(|pw| !pw.is_empty());
        let from_caller = supplied.is_some();
        let password = match supplied {
            Some(pw) => Some(pw),
            None => self
                .shared
                .credentials
                .retrieve(CredentialPurpose::OtaPassword, self.address())
                .unwrap_or_else(|e| {
                    tlog!("[ota] Credential lookup failed: {}", e);
                    None
                }),
        };

        let image_sha256 = hex::encode(Sha256::digest(image.as_slice()));
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(());

        {
            let mut slot = self.shared.lock_ota();
            if slot.is_some() {
                return Err(BgxError::Busy);
            }
            *slot = Some(OtaSlot {
                session: OtaSession {
                    step: OtaStep::Init,
                    operation: OtaOperation::InProgress,
                    bytes_sent: 0,
                    total_bytes,
                    write_ack_mode: request.ack_mode,
                    image_ref: request.image.clone(),
                    password: password.clone(),
                    source: ConnectionSource::Reused,
                    image_sha256: image_sha256.clone(),
                },
                cancel: cancel_tx,
                done: done_rx,
            });
        }

        tlog!(
            "[ota] {} starting {:?}: {} bytes, sha256 {}, {:?}, password {}",
            self.address(),
            request.image,
            total_bytes,
            image_sha256,
            request.ack_mode,
            if password.is_some() { "present" } else { "absent" }
        );

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = transfer(&shared, &image, password.as_deref(), from_caller, cancel_rx).await;
            finish(&shared, outcome).await;
            drop(done_tx);
        });
        Ok(())
    }

    /// Cancel the running transfer and wait for it to wind down. No-op when
    /// nothing is running.
    pub async fn cancel_ota(&self) -> Result<(), BgxError> {
        cancel(&self.shared, CancelCause::User).await;
        Ok(())
    }

    /// Snapshot of the running transfer, if any.
    pub fn ota_session(&self) -> Option<OtaSession> {
        self.shared.lock_ota().as_ref().map(|slot| slot.session.clone())
    }

    /// The most recently ended transfer, with its terminal step
    /// (`End` or `Error`) and `OtaOperation::Complete`.
    pub fn last_ota_session(&self) -> Option<OtaSession> {
        self.shared.lock_last_ota().clone()
    }

    pub fn ota_operation(&self) -> OtaOperation {
        match self.shared.lock_ota().as_ref() {
            Some(slot) => slot.session.operation,
            None => OtaOperation::NoOperationInProgress,
        }
    }
}

async fn cancel(shared: &Shared, cause: CancelCause) {
    let done = {
        let slot = shared.lock_ota();
        match slot.as_ref() {
            Some(slot) => {
                // First cause wins
                slot.cancel.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(cause);
                        true
                    } else {
                        false
                    }
                });
                slot.done.clone()
            }
            None => {
                tlog!("[ota] {} no transfer to cancel", shared.address);
                return;
            }
        }
    };
    wait_done(done).await;
}

async fn wait_done(mut done: watch::Receiver<()>) {
    while done.changed().await.is_ok() {}
}

/// Called by the session when the link drops mid-transfer.
pub(crate) async fn fail_on_link_loss(shared: &Shared) {
    if shared.lock_ota().is_some() {
        cancel(shared, CancelCause::LinkLost).await;
    }
}

fn set_step(shared: &Shared, step: OtaStep) {
    if let Some(slot) = shared.lock_ota().as_mut() {
        slot.session.step = step;
    }
    tlog!("[ota] {} step {:?}", shared.address, step);
}

fn current_step(shared: &Shared) -> OtaStep {
    shared
        .lock_ota()
        .as_ref()
        .map(|slot| slot.session.step)
        .unwrap_or(OtaStep::NoOta)
}

async fn wait_cancel(rx: &mut watch::Receiver<Option<CancelCause>>) -> CancelCause {
    loop {
        if let Some(cause) = *rx.borrow_and_update() {
            return cause;
        }
        if rx.changed().await.is_err() {
            // Slot released without a cancel; nothing can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

/// Run `fut` unless a cancel arrives first.
async fn cancelable<F: std::future::Future>(
    rx: &mut watch::Receiver<Option<CancelCause>>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    if let Some(cause) = *rx.borrow() {
        return Err(Interrupt::Canceled(cause));
    }
    tokio::select! {
        biased;
        cause = wait_cancel(rx) => Err(Interrupt::Canceled(cause)),
        out = fut => Ok(out),
    }
}

async fn transfer(
    shared: &Shared,
    image: &[u8],
    password: Option<&str>,
    store_password: bool,
    mut cancel: watch::Receiver<Option<CancelCause>>,
) -> Result<(), Interrupt> {
    let total_bytes = image.len() as u32;
    let transport = &shared.transport;

    // Init: open the transfer, authenticating if we have a password
    let open = open_command(password);
    let opened = cancelable(
        &mut cancel,
        shared.op(
            "ota open",
            transport.write(BgxCharacteristic::OtaControl, &open, AckMode::Acknowledged),
        ),
    )
    .await?;
    match opened {
        Ok(()) => {}
        Err(e) if e.code >= 0 => {
            tlog!("[ota] {} open refused: {}", shared.address, e);
            return Err(Interrupt::PasswordRequired);
        }
        Err(e) => return Err(Interrupt::Failed(OtaStep::Init, failure_reason(&e))),
    }

    if let (true, Some(pw)) = (store_password, password) {
        if let Err(e) = shared
            .credentials
            .store(CredentialPurpose::OtaPassword, &shared.address, pw)
        {
            tlog!("[ota] Failed to store password: {}", e);
        }
    }

    shared.emit(BgxEvent::OtaStatus {
        address: shared.address.clone(),
        status: OtaStatus::Installing,
        bytes_sent: Some(0),
        failure: None,
        step: None,
    });

    let ack = shared
        .lock_ota()
        .as_ref()
        .map(|slot| slot.session.write_ack_mode)
        .unwrap_or(AckMode::Acknowledged);
    let step = match ack {
        AckMode::Acknowledged => OtaStep::UploadWithResponse,
        AckMode::Unacknowledged => OtaStep::UploadNoResponse,
    };
    set_step(shared, step);

    let mut bytes_sent = 0u32;
    for chunk in image.chunks(shared.config.ota_chunk_size) {
        cancelable(
            &mut cancel,
            shared.op("ota data", transport.write(BgxCharacteristic::OtaData, chunk, ack)),
        )
        .await?
        .map_err(|e| Interrupt::Failed(step, failure_reason(&e)))?;

        bytes_sent += chunk.len() as u32;
        if let Some(slot) = shared.lock_ota().as_mut() {
            slot.session.bytes_sent = bytes_sent;
        }
        shared.emit(BgxEvent::OtaProgress {
            address: shared.address.clone(),
            bytes_sent,
            total_bytes,
        });
    }

    set_step(shared, OtaStep::UploadFinish);
    shared.emit(BgxEvent::OtaStatus {
        address: shared.address.clone(),
        status: OtaStatus::Finishing,
        bytes_sent: Some(bytes_sent),
        failure: None,
        step: None,
    });

    cancelable(
        &mut cancel,
        shared.op(
            "ota finish",
            transport.write(
                BgxCharacteristic::OtaControl,
                &[OTA_CONTROL_FINISH],
                AckMode::Acknowledged,
            ),
        ),
    )
    .await?
    .map_err(|e| Interrupt::Failed(OtaStep::UploadFinish, failure_reason(&e)))?;

    // The peripheral installs and reboots; give it time before reporting
    let settle = Duration::from_millis(shared.config.ota_finish_settle_ms);
    cancelable(&mut cancel, tokio::time::sleep(settle)).await?;

    set_step(shared, OtaStep::End);
    Ok(())
}

async fn finish(shared: &Arc<Shared>, outcome: Result<(), Interrupt>) {
    let (status, failure, failed_at) = match outcome {
        Ok(()) => (OtaStatus::Finished, None, None),
        Err(Interrupt::Canceled(CancelCause::User)) => {
            if shared.connection() == ConnectionState::Connected {
                let abort = shared
                    .op(
                        "ota abort",
                        shared.transport.write(
                            BgxCharacteristic::OtaControl,
                            &[OTA_CONTROL_ABORT],
                            AckMode::Acknowledged,
                        ),
                    )
                    .await;
                if let Err(e) = abort {
                    tlog!("[ota] {} abort command failed: {}", shared.address, e);
                }
            }
            (OtaStatus::UserCanceled, None, None)
        }
        Err(Interrupt::Canceled(CancelCause::LinkLost)) => (
            OtaStatus::Failed,
            Some(OtaFailureReason::LinkLost),
            Some(current_step(shared)),
        ),
        Err(Interrupt::PasswordRequired) => (OtaStatus::PasswordRequired, None, Some(OtaStep::Init)),
        Err(Interrupt::Failed(at, reason)) => (OtaStatus::Failed, Some(reason), Some(at)),
    };

    // Release the slot; the finished session stays readable until the next one ends
    let bytes_sent = {
        let mut slot = shared.lock_ota();
        match slot.take() {
            Some(OtaSlot { mut session, .. }) => {
                session.operation = OtaOperation::Complete;
                session.step = match failed_at {
                    Some(_) => OtaStep::Error,
                    None => OtaStep::End,
                };
                let bytes_sent = session.bytes_sent;
                *shared.lock_last_ota() = Some(session);
                bytes_sent
            }
            None => 0,
        }
    };

    match (&failure, failed_at) {
        (Some(reason), Some(at)) => tlog!(
            "[ota] {} failed during {:?} after {} bytes: {}",
            shared.address,
            at,
            bytes_sent,
            reason
        ),
        _ => tlog!("[ota] {} {:?} after {} bytes", shared.address, status, bytes_sent),
    }

    shared.emit(BgxEvent::OtaStatus {
        address: shared.address.clone(),
        status,
        bytes_sent: Some(bytes_sent),
        failure,
        step: failed_at,
    });
}
