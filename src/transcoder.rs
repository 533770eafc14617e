//! Result transcoder: adapter row streams to ordered response frames.
//!
//! Rows travel through a bounded channel, so a slow consumer suspends the
//! producing adapter instead of growing a buffer. Every invocation stream
//! ends with exactly one terminal frame, either [`FrameBody::Complete`] or
//! [`FrameBody::Error`]; rows sent before an error are never withdrawn.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{mcp_error, AdapterError, CancelReason, ErrorKind, GatewayError};
use crate::router::InvocationStatus;
use crate::row::{Row, RowStream};

/// One response unit for an invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub request_id: String,
    #[serde(flatten)]
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "frame", content = "data", rename_all = "snake_case")]
pub enum FrameBody {
    Row(Row),
    Complete { row_count: u64 },
    Error(ErrorFrame),
}

impl FrameBody {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FrameBody::Row(_))
    }
}

/// Terminal error marker, keeping the error kind and cause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorFrame {
    pub kind: ErrorKind,
    pub message: String,
    /// Rows delivered before the error.
    pub rows_delivered: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_usable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
}

impl ErrorFrame {
    pub fn new(err: &GatewayError, rows_delivered: u64) -> Self {
        Self {
            kind: err.kind(),
            message: err.cause(),
            rows_delivered,
            connection_usable: err.connection_usable(),
            cancel_reason: match err {
                GatewayError::Cancelled(reason) => Some(*reason),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for ErrorFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorFrame {}

impl From<ErrorFrame> for rmcp::model::ErrorData {
    fn from(frame: ErrorFrame) -> Self {
        mcp_error(frame.kind, &frame.message)
    }
}

/// Creates the frame channel for one invocation.
///
/// `capacity` is the maximum number of frames buffered ahead of the consumer.
pub fn channel(request_id: impl Into<String>, capacity: usize) -> (FrameSink, InvocationStream) {
    let request_id = request_id.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FrameSink {
            request_id: request_id.clone(),
            tx,
            rows: 0,
        },
        InvocationStream { request_id, rx },
    )
}

/// Producer half of an invocation's frame channel.
pub struct FrameSink {
    request_id: String,
    tx: mpsc::Sender<Frame>,
    rows: u64,
}

/// The consumer dropped its end of the stream.
#[derive(Debug)]
pub struct ConsumerGone;

impl FrameSink {
    pub fn rows_delivered(&self) -> u64 {
        self.rows
    }

    /// Sends one row, waiting while the buffer is full.
    pub async fn row(&mut self, row: Row) -> Result<(), ConsumerGone> {
        self.send(FrameBody::Row(row)).await?;
        self.rows += 1;
        Ok(())
    }

    /// Resolves once the consumer has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Ends the stream successfully.
    pub async fn complete(self) {
        let row_count = self.rows;
        let _ = self.send(FrameBody::Complete { row_count }).await;
    }

    /// Ends the stream with an error marker.
    pub async fn fail(self, err: &GatewayError) {
        let frame = ErrorFrame::new(err, self.rows);
        let _ = self.send(FrameBody::Error(frame)).await;
    }

    async fn send(&self, body: FrameBody) -> Result<(), ConsumerGone> {
        self.tx
            .send(Frame {
                request_id: self.request_id.clone(),
                body,
            })
            .await
            .map_err(|_| ConsumerGone)
    }
}

/// How a [`pump`] ended.
#[derive(Debug)]
pub enum PumpOutcome {
    /// The adapter stream ended cleanly.
    Exhausted,
    /// The adapter raised an error mid-stream.
    Failed(AdapterError),
    /// The cancel token fired, the deadline passed or the consumer left.
    Interrupted(CancelReason),
}

/// Moves rows from an adapter stream into the sink, in order.
///
/// The cancel token, the deadline and consumer departure are observed both
/// while waiting on the adapter and while waiting on backpressure.
pub async fn pump(
    mut rows: RowStream<'_>,
    sink: &mut FrameSink,
    cancel: &CancellationToken,
    deadline: Instant,
) -> PumpOutcome {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Interrupted(CancelReason::Withdrawn),
            _ = sleep_until(deadline) => return PumpOutcome::Interrupted(CancelReason::DeadlineExceeded),
            _ = sink.closed() => return PumpOutcome::Interrupted(CancelReason::ConsumerGone),
            next = rows.next() => next,
        };

        let row = match next {
            None => return PumpOutcome::Exhausted,
            Some(Err(e)) => return PumpOutcome::Failed(e),
            Some(Ok(row)) => row,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Interrupted(CancelReason::Withdrawn),
            _ = sleep_until(deadline) => return PumpOutcome::Interrupted(CancelReason::DeadlineExceeded),
            sent = sink.row(row) => {
                if sent.is_err() {
                    return PumpOutcome::Interrupted(CancelReason::ConsumerGone);
                }
            }
        }
    }
}

/// Consumer half: the ordered frames of one invocation.
pub struct InvocationStream {
    request_id: String,
    rx: mpsc::Receiver<Frame>,
}

impl InvocationStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drains the stream into rows plus the terminal status.
    pub async fn outcome(mut self) -> InvocationOutcome {
        let mut rows = Vec::new();
        while let Some(frame) = self.rx.recv().await {
            match frame.body {
                FrameBody::Row(row) => rows.push(row),
                FrameBody::Complete { row_count } => {
                    return InvocationOutcome {
                        request_id: self.request_id,
                        status: InvocationStatus::Completed,
                        row_count,
                        rows,
                        error: None,
                    }
                }
                FrameBody::Error(error) => {
                    let status = if error.kind == ErrorKind::Cancelled {
                        InvocationStatus::Cancelled
                    } else {
                        InvocationStatus::Failed
                    };
                    return InvocationOutcome {
                        request_id: self.request_id,
                        status,
                        row_count: rows.len() as u64,
                        rows,
                        error: Some(error),
                    };
                }
            }
        }

        let rows_delivered = rows.len() as u64;
        InvocationOutcome {
            request_id: self.request_id,
            status: InvocationStatus::Failed,
            row_count: rows_delivered,
            rows,
            error: Some(ErrorFrame {
                kind: ErrorKind::ProtocolViolation,
                message: "invocation stream ended without a terminal frame".into(),
                rows_delivered,
                connection_usable: None,
                cancel_reason: None,
            }),
        }
    }
}

impl Stream for InvocationStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A fully collected invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutcome {
    pub request_id: String,
    pub status: InvocationStatus,
    pub row_count: u64,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

impl InvocationOutcome {
    /// Converts into the rows or the terminal error.
    pub fn into_result(self) -> Result<Vec<Row>, ErrorFrame> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn row(n: i64) -> Row {
        let mut data = Map::new();
        data.insert("n".into(), json!(n));
        Row::new(data)
    }

    fn rows(items: Vec<Result<Row, AdapterError>>) -> RowStream<'static> {
        Box::pin(futures::stream::iter(items))
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_pump_preserves_order_and_completes() {
        let (mut sink, stream) = channel("r1", 4);
        let cancel = CancellationToken::new();
        let source = rows((0..50).map(|n| Ok(row(n))).collect());

        let consumer = tokio::spawn(stream.outcome());
        let outcome = pump(source, &mut sink, &cancel, far()).await;
        assert!(matches!(outcome, PumpOutcome::Exhausted));
        sink.complete().await;

        let collected = consumer.await.unwrap();
        assert_eq!(collected.status, InvocationStatus::Completed);
        assert_eq!(collected.row_count, 50);
        let seen: Vec<i64> = collected.rows.iter().map(|r| r.get("n").unwrap()).collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_partial_rows_then_error() {
        let (mut sink, stream) = channel("r2", 16);
        let cancel = CancellationToken::new();
        let source = rows(vec![
            Ok(row(1)),
            Ok(row(2)),
            Err(AdapterError::io("pg1", "connection reset")),
        ]);

        let outcome = pump(source, &mut sink, &cancel, far()).await;
        let PumpOutcome::Failed(err) = outcome else {
            panic!("expected failure");
        };
        sink.fail(&GatewayError::Adapter(err)).await;

        let collected = stream.outcome().await;
        assert_eq!(collected.status, InvocationStatus::Failed);
        assert_eq!(collected.rows.len(), 2);
        let error = collected.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Adapter);
        assert_eq!(error.rows_delivered, 2);
        assert_eq!(error.connection_usable, Some(false));
    }

    #[tokio::test]
    async fn test_backpressure_observes_cancel() {
        let (mut sink, stream) = channel("r3", 1);
        let cancel = CancellationToken::new();
        let source = rows((0..10).map(|n| Ok(row(n))).collect());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = pump(source, &mut sink, &cancel, far()).await;
        assert!(matches!(
            outcome,
            PumpOutcome::Interrupted(CancelReason::Withdrawn)
        ));
        assert_eq!(sink.rows_delivered(), 1);
        drop(stream);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_stalled_stream() {
        let (mut sink, _stream) = channel("r4", 8);
        let cancel = CancellationToken::new();
        let source: RowStream<'static> = Box::pin(futures::stream::pending());

        let deadline = Instant::now() + Duration::from_millis(20);
        let outcome = pump(source, &mut sink, &cancel, deadline).await;
        assert!(matches!(
            outcome,
            PumpOutcome::Interrupted(CancelReason::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_consumer_gone() {
        let (mut sink, stream) = channel("r5", 8);
        drop(stream);
        let cancel = CancellationToken::new();
        let source: RowStream<'static> = Box::pin(futures::stream::pending());

        let outcome = pump(source, &mut sink, &cancel, far()).await;
        assert!(matches!(
            outcome,
            PumpOutcome::Interrupted(CancelReason::ConsumerGone)
        ));
    }

    #[tokio::test]
    async fn test_missing_terminal_frame_is_reported() {
        let (sink, stream) = channel("r6", 8);
        drop(sink);
        let collected = stream.outcome().await;
        assert_eq!(collected.status, InvocationStatus::Failed);
        assert_eq!(
            collected.error.unwrap().kind,
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn test_frame_serialization() {
        let frame = Frame {
            request_id: "r7".into(),
            body: FrameBody::Complete { row_count: 3 },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"request_id": "r7", "frame": "complete", "data": {"row_count": 3}})
        );
        assert!(frame.body.is_terminal());
    }
}
