//! JSON-lines host for the ledger: one request object per line in, one
//! response object per line out. Subscribed change events are interleaved as
//! `{"cottage_id": .., "event": ..}` lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::validate::{self, FieldViolation, RawReservation, RawReservationPatch, ValidationFailure};

const NOTIFY_BUFFER: usize = 256;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateCottage {
        #[serde(flatten)]
        cottage: NewCottage,
    },
    UpdateCottage {
        id: Ulid,
        #[serde(flatten)]
        patch: CottagePatch,
    },
    DeleteCottage {
        id: Ulid,
    },
    GetCottage {
        id: Ulid,
    },
    ListCottages,
    CreateAmenity {
        caller: CallerId,
        name: String,
        #[serde(default)]
        additional_capacity: u32,
    },
    UpdateAmenity {
        id: Ulid,
        #[serde(flatten)]
        patch: AmenityPatch,
    },
    DeleteAmenity {
        id: Ulid,
    },
    GetAmenity {
        id: Ulid,
    },
    ListAmenities {
        #[serde(default)]
        assigned_only: bool,
    },
    AttachAmenity {
        cottage_id: Ulid,
        amenity_id: Ulid,
    },
    DetachAmenity {
        cottage_id: Ulid,
        amenity_id: Ulid,
    },
    CreateReservation {
        caller: CallerId,
        #[serde(flatten)]
        reservation: RawReservation,
    },
    UpdateReservation {
        id: Ulid,
        #[serde(flatten)]
        patch: RawReservationPatch,
    },
    CancelReservation {
        id: Ulid,
    },
    GetReservation {
        id: Ulid,
    },
    ListReservations {
        #[serde(default)]
        cottage_id: Option<Ulid>,
        #[serde(default)]
        caller: Option<CallerId>,
    },
    CheckAvailability {
        cottage_id: Ulid,
        check_in: String,
        check_out: String,
    },
    Vacancies {
        cottage_id: Ulid,
        from: String,
        to: String,
    },
    Subscribe {
        cottage_id: Ulid,
    },
    Unsubscribe {
        cottage_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ErrorBody) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// A committed change pushed to a subscribed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub cottage_id: Ulid,
    pub event: Event,
}

/// Everything a request can fail with before or inside the ledger.
#[derive(Debug)]
pub enum WireError {
    BadRequest(String),
    Validation(ValidationFailure),
    Engine(EngineError),
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        WireError::Engine(e)
    }
}

impl From<ValidationFailure> for WireError {
    fn from(e: ValidationFailure) -> Self {
        WireError::Validation(e)
    }
}

impl From<WireError> for ErrorBody {
    fn from(e: WireError) -> Self {
        match e {
            WireError::BadRequest(message) => ErrorBody {
                kind: ErrorKind::Invalid,
                status: ErrorKind::Invalid.status(),
                message,
                violations: Vec::new(),
            },
            WireError::Validation(failure) => ErrorBody {
                kind: failure.kind(),
                status: failure.kind().status(),
                message: failure.to_string(),
                violations: failure.violations,
            },
            WireError::Engine(err) => ErrorBody {
                kind: err.kind(),
                status: err.kind().status(),
                message: err.to_string(),
                violations: Vec::new(),
            },
        }
    }
}

fn to_data<T: Serialize>(value: T) -> Result<serde_json::Value, WireError> {
    serde_json::to_value(value).map_err(|e| WireError::Engine(EngineError::WalError(format!("encode: {e}"))))
}

/// Parse a pair of query dates. Ordering is left to the engine.
fn parse_range(check_in: &str, check_out: &str) -> Result<(Day, Day), WireError> {
    let parse = |s: &str| Day::parse_from_str(s.trim(), validate::DATE_FORMAT).ok();
    match (parse(check_in), parse(check_out)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(WireError::Validation(ValidationFailure {
            violations: vec![FieldViolation {
                field: validate::NON_FIELD_ERRORS.into(),
                message: format!("invalid date range: {check_in:?} .. {check_out:?} (expected YYYY-MM-DD)"),
            }],
        })),
    }
}

/// Run one engine operation. Subscriptions are connection state and are
/// handled by [`Session`].
pub async fn dispatch(engine: &Engine, req: Request) -> Result<serde_json::Value, WireError> {
    match req {
        Request::CreateCottage { cottage } => to_data(engine.create_cottage(cottage).await?),
        Request::UpdateCottage { id, patch } => to_data(engine.update_cottage(id, patch).await?),
        Request::DeleteCottage { id } => {
            let cascaded = engine.delete_cottage(id).await?;
            Ok(serde_json::json!({ "id": id, "deleted_reservations": cascaded }))
        }
        Request::GetCottage { id } => to_data(engine.get_cottage(id).await?),
        Request::ListCottages => to_data(engine.list_cottages().await),
        Request::CreateAmenity { caller, name, additional_capacity } => {
            to_data(engine.create_amenity(&name, additional_capacity, caller).await?)
        }
        Request::UpdateAmenity { id, patch } => to_data(engine.update_amenity(id, patch).await?),
        Request::DeleteAmenity { id } => {
            engine.delete_amenity(id).await?;
            Ok(serde_json::json!({ "id": id }))
        }
        Request::GetAmenity { id } => to_data(engine.get_amenity(id)?),
        Request::ListAmenities { assigned_only } => to_data(engine.list_amenities(assigned_only)),
        Request::AttachAmenity { cottage_id, amenity_id } => {
            to_data(engine.attach_amenity(cottage_id, amenity_id).await?)
        }
        Request::DetachAmenity { cottage_id, amenity_id } => {
            to_data(engine.detach_amenity(cottage_id, amenity_id).await?)
        }
        Request::CreateReservation { caller, reservation } => {
            let fields = validate::validate_reservation(reservation, engine)?;
            to_data(engine.admit(fields, caller).await?)
        }
        Request::UpdateReservation { id, patch } => {
            let patch = validate::validate_patch(patch)?;
            to_data(engine.modify(id, patch).await?)
        }
        Request::CancelReservation { id } => to_data(engine.cancel(id).await?),
        Request::GetReservation { id } => to_data(engine.get_reservation(id).await?),
        Request::ListReservations { cottage_id, caller } => match (cottage_id, caller) {
            (Some(cottage_id), _) => to_data(engine.list_reservations(cottage_id).await?),
            (None, Some(caller)) => to_data(engine.list_reservations_for_owner(&caller).await),
            (None, None) => Err(WireError::BadRequest(
                "list_reservations needs cottage_id or caller".into(),
            )),
        },
        Request::CheckAvailability { cottage_id, check_in, check_out } => {
            let (check_in, check_out) = parse_range(&check_in, &check_out)?;
            to_data(engine.check_availability(cottage_id, check_in, check_out).await?)
        }
        Request::Vacancies { cottage_id, from, to } => {
            let (from, to) = parse_range(&from, &to)?;
            to_data(engine.vacancies(cottage_id, from, to).await?)
        }
        Request::Subscribe { .. } | Request::Unsubscribe { .. } => Err(WireError::BadRequest(
            "subscriptions are only available on a connection".into(),
        )),
    }
}

/// Per-connection state: the engine plus this connection's change-feed forwarders.
pub struct Session {
    engine: Arc<Engine>,
    notify_tx: mpsc::Sender<Notification>,
    subscriptions: HashMap<Ulid, JoinHandle<()>>,
}

impl Session {
    pub fn new(engine: Arc<Engine>, notify_tx: mpsc::Sender<Notification>) -> Self {
        Self {
            engine,
            notify_tx,
            subscriptions: HashMap::new(),
        }
    }

    /// Parse, run and time one request line.
    pub async fn handle_line(&mut self, line: &str) -> Response {
        let req: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unparsed", "status" => "invalid")
                    .increment(1);
                return Response::failure(WireError::BadRequest(format!("invalid request: {e}")).into());
            }
        };

        let op = observability::op_label(&req);
        let start = Instant::now();
        let result = self.handle(req).await;
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(data) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
                Response::success(data)
            }
            Err(e) => {
                let body = ErrorBody::from(e);
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => body.kind.as_str())
                    .increment(1);
                tracing::debug!("{op} failed: {}", body.message);
                Response::failure(body)
            }
        }
    }

    async fn handle(&mut self, req: Request) -> Result<serde_json::Value, WireError> {
        match req {
            Request::Subscribe { cottage_id } => {
                self.subscribe(cottage_id)?;
                Ok(serde_json::json!({ "subscribed": cottage_id }))
            }
            Request::Unsubscribe { cottage_id } => {
                let was_subscribed = match self.subscriptions.remove(&cottage_id) {
                    Some(handle) => {
                        handle.abort();
                        true
                    }
                    None => false,
                };
                Ok(serde_json::json!({ "unsubscribed": cottage_id, "was_subscribed": was_subscribed }))
            }
            other => dispatch(&self.engine, other).await,
        }
    }

    fn subscribe(&mut self, cottage_id: Ulid) -> Result<(), EngineError> {
        if self.subscriptions.get(&cottage_id).is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let mut rx = self.engine.subscribe(cottage_id)?;
        let tx = self.notify_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(Notification { cottage_id, event }).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("subscriber on cottage {cottage_id} lagged, {skipped} events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.subscriptions.insert(cottage_id, handle);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}

fn encode_line<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        format!(r#"{{"ok":false,"error":{{"kind":"storage","status":500,"message":"encode: {e}"}}}}"#)
    })
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFY_BUFFER);
    let mut session = Session::new(engine, notify_tx);

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let body = WireError::BadRequest(format!("request line exceeds {MAX_LINE_LEN} bytes"));
                        framed.send(encode_line(&Response::failure(body.into()))).await?;
                        tracing::warn!("closing connection after oversized request line");
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = session.handle_line(&line).await;
                framed.send(encode_line(&response)).await?;
            }
            Some(notification) = notify_rx.recv() => {
                framed.send(encode_line(&notification)).await?;
            }
        }
    }
    Ok(())
}
