use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::coordinator::{Coordinator, Submitted};
use crate::engine::{AllocationQuery, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::notify::SubscriptionFilter;
use crate::observability::{request_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::protocol::{Request, Response};

type Lines = Framed<TcpStream, LinesCodec>;

/// Serve one client: newline-delimited JSON requests, one response line each.
/// A `subscribe` request turns the rest of the connection into an event stream.
pub async fn process_connection(socket: TcpStream, coordinator: Arc<Coordinator>) -> io::Result<()> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                send(&mut lines, &Response::error("bad_request", "line too long")).await?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "error").increment(1);
                send(&mut lines, &Response::error("bad_request", e.to_string())).await?;
                continue;
            }
        };

        if let Some(filter) = request.subscription() {
            metrics::counter!(REQUESTS_TOTAL, "op" => "subscribe", "status" => "ok").increment(1);
            return stream_events(lines, &coordinator, filter).await;
        }

        let label = request_label(&request);
        let start = Instant::now();
        let response = match dispatch(&coordinator, request).await {
            Ok(response) => response,
            Err(e) => Response::from(e),
        };
        let status = if response.is_ok() { "ok" } else { "error" };
        metrics::counter!(REQUESTS_TOTAL, "op" => label, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => label).record(start.elapsed().as_secs_f64());
        debug!(op = label, status, "request handled");

        send(&mut lines, &response).await?;
    }
    Ok(())
}

async fn dispatch(coordinator: &Arc<Coordinator>, request: Request) -> Result<Response, EngineError> {
    let engine = coordinator.engine();
    match request {
        Request::OperationStatus { id } => Ok(Response::ok(&coordinator.status(id)?)),
        Request::CancelOperation { id } => Ok(Response::ok(&coordinator.cancel(id)?)),
        Request::OperationHistory { limit } => Ok(Response::ok(&coordinator.history(limit))),
        Request::OperationResult { id } => {
            let result = coordinator.result(id).ok_or(EngineError::NotFound(id))?;
            Ok(Response::ok(&result))
        }
        Request::GetAllocation { id } => Ok(Response::ok(&engine.get_allocation(id).await?)),
        Request::ListAllocations {
            employee_id,
            project_id,
            include_inactive,
        } => {
            let query = AllocationQuery {
                employee_id,
                project_id,
                include_inactive,
            };
            Ok(Response::ok(&engine.list_allocations(&query).await))
        }
        Request::UpsertEmployee {
            id,
            weekly_capacity_hours,
            is_active,
        } => {
            engine.upsert_employee(id, weekly_capacity_hours, is_active).await?;
            Ok(Response::ok(&json!({ "id": id })))
        }
        Request::RemoveEmployee { id } => {
            let removed = engine.remove_employee(id).await?;
            Ok(Response::ok(&json!({ "id": id, "allocations_removed": removed })))
        }
        Request::UpsertProject { id, name, is_active } => {
            engine.upsert_project(id, name, is_active).await?;
            Ok(Response::ok(&json!({ "id": id })))
        }
        Request::RemoveProject { id } => {
            let removed = engine.remove_project(id).await?;
            Ok(Response::ok(&json!({ "id": id, "allocations_removed": removed })))
        }
        Request::RecordTimeEntry {
            id,
            allocation_id,
            work_date,
            hours,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            let entry = engine.record_time_entry(id, allocation_id, work_date, hours).await?;
            Ok(Response::ok(&entry))
        }
        Request::Subscribe { .. } => Ok(Response::error("bad_request", "already subscribed")),
        bulk => {
            let validate_only = bulk.is_validate_only();
            let Some(job) = bulk.into_bulk() else {
                return Ok(Response::error("bad_request", "unsupported op"));
            };
            if validate_only {
                return Ok(Response::ok(&coordinator.validate(job).await?));
            }
            match coordinator.submit(job, None).await? {
                Submitted::Finished(outcome) => Ok(Response::ok(&outcome)),
                Submitted::Accepted(id) => Ok(Response::ok(&json!({
                    "operation_id": id,
                    "status": "pending",
                }))),
            }
        }
    }
}

/// Push matching change events until the client hangs up. A lagged
/// subscriber gets one `resync_required` line and is disconnected.
async fn stream_events(
    lines: Lines,
    coordinator: &Coordinator,
    filter: SubscriptionFilter,
) -> io::Result<()> {
    let mut subscription = coordinator.engine().notify.subscribe(filter);
    let (mut sink, mut stream) = lines.split();
    send(&mut sink, &Response::ok(&json!({ "subscribed": filter }))).await?;

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Ok(event) => {
                    let line = serde_json::to_string(&event).map_err(io::Error::other)?;
                    sink.send(line).await.map_err(codec_err)?;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, closing stream");
                    let line = json!({ "type": "resync_required", "missed": missed }).to_string();
                    sink.send(line).await.map_err(codec_err)?;
                    return Ok(());
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            incoming = stream.next() => match incoming {
                None => return Ok(()),
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
                // Input is ignored once streaming.
                Some(_) => {}
            },
        }
    }
}

async fn send<S>(sink: &mut S, response: &Response) -> io::Result<()>
where
    S: futures::Sink<String, Error = LinesCodecError> + Unpin,
{
    let line = serde_json::to_string(response).map_err(io::Error::other)?;
    sink.send(line).await.map_err(codec_err)
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(io::ErrorKind::InvalidData, "line too long"),
    }
}
