//! One poll = one worker: session, parse, sink, watermark.
//!
//! A worker owns its connection for the whole poll and blocks on the
//! framer; the per-session deadline covers connect plus every read. On any
//! failure the watermark stays put, so the next poll re-reads the same
//! window. Meter-level faults are logged and absorbed — they never
//! propagate past the worker.

use chrono::{Duration as TimeDelta, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::roster::{RosterError, RosterStore};
use crate::session::{Session, SessionError, from_bound};
use crate::sink::{RecordSink, SinkError};
use meter_core::{BatchKey, DataKind, MeterContext, MeterDescriptor, ParseError};

// ---------------------------------------------------------------------------
// Context and errors
// ---------------------------------------------------------------------------

/// Shared handles and tuning a worker needs; cheap to clone behind an Arc.
pub struct WorkerContext {
    pub sink: Arc<RecordSink>,
    pub roster: Arc<RosterStore>,
    pub connect_timeout: Duration,
    pub tr: Duration,
    pub session_timeout: Duration,
    pub max_window: TimeDelta,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("sink: {0}")]
    Sink(#[from] SinkError),
    #[error("watermark: {0}")]
    Roster(#[from] RosterError),
    #[error("session deadline of {0:?} elapsed")]
    Timeout(Duration),
    #[error("sink did not accept the batch")]
    SinkRejected,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Poll one `(meter, kind)` slot. Never panics, never propagates: the
/// outcome is logged and the scheduler moves on.
pub async fn poll_meter(ctx: Arc<WorkerContext>, meter: MeterDescriptor, kind: DataKind) {
    let meter_id = meter.meter_id.clone();
    let endpoint = meter.endpoint();
    match run_poll(&ctx, meter, kind).await {
        Ok(0) => debug!(meter_id, endpoint, kind = %kind, "nothing to insert"),
        Ok(records) => info!(meter_id, endpoint, kind = %kind, records, "poll complete"),
        Err(e) => warn!(meter_id, endpoint, kind = %kind, error = %e, "poll failed"),
    }
}

async fn run_poll(
    ctx: &WorkerContext,
    meter: MeterDescriptor,
    kind: DataKind,
) -> Result<usize, PollError> {
    let dispatched_at = Utc::now();
    // An unknown timezone is fatal for this meter before any socket work.
    let parse_ctx = MeterContext::for_meter(&meter)?;
    let from = from_bound(&meter, kind, dispatched_at, ctx.max_window);

    // Seed the resume field for slow kinds so an interrupted poll does not
    // lose its extended window.
    if let (Some(field), Some(from_ts)) = (kind.watermark_field(), from) {
        if meter.watermark(field).is_none() && meter.interval(kind) > 900 {
            if let Err(e) = ctx.roster.set_watermark(&meter.meter_id, field, from_ts).await {
                warn!(meter_id = %meter.meter_id, field = %field, error = %e, "could not seed watermark");
            }
        }
    }

    let connect_timeout = meter
        .timeout
        .map_or(ctx.connect_timeout, |secs| Duration::from_secs(secs.into()));
    let body = tokio::time::timeout(ctx.session_timeout, async {
        let mut session = Session::open(meter.clone(), connect_timeout, ctx.tr).await?;
        session.read_kind(kind, from).await
        // The session (and its socket) drops here on success, failure, or
        // when the deadline cancels this future.
    })
    .await
    .map_err(|_| PollError::Timeout(ctx.session_timeout))??;

    let records = meter_core::parse(&body, kind, &parse_ctx)?;
    if records.is_empty() {
        return Ok(0);
    }

    let key = BatchKey::new(
        meter.org(),
        &meter.meter_id,
        dispatched_at.timestamp(),
        kind,
    );
    if !ctx.sink.insert(&key, &records).await? {
        return Err(PollError::SinkRejected);
    }

    // The sink confirmed: advance the resume point to the newest ingested
    // row, or clear it when the batch carried no timed rows.
    if let Some(field) = kind.watermark_field() {
        let newest = records
            .iter()
            .filter_map(|r| r.line_time)
            .max()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        let result = match newest {
            Some(instant) => ctx.roster.set_watermark(&meter.meter_id, field, instant).await,
            None => ctx.roster.clear_watermark(&meter.meter_id, field).await,
        };
        if let Err(e) = result {
            warn!(meter_id = %meter.meter_id, field = %field, error = %e, "watermark not updated");
        }
    }

    Ok(records.len())
}
