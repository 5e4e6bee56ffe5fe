// SPDX-License-Identifier: PMPL-1.0-or-later
//! Response channels.
//!
//! A `ResponseSource` is the inbound side of an execution: the network (or a
//! test) pushes response chunks through a `ResponseSender`, and the executor
//! drains them without blocking. `ExecutionOutput` is the outbound side:
//! every chunk is forwarded once it has been applied, followed by a single
//! `Error` or `Complete`.

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::error::ExecutorError;

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Next(Value),
    Error(ExecutorError),
    Complete,
}

/// Producer half of a `ResponseSource`.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: UnboundedSender<SourceEvent>,
}

impl ResponseSender {
    /// Push one chunk. Returns false once the executor has dropped the source.
    pub fn next(&self, response: Value) -> bool {
        self.tx.send(SourceEvent::Next(response)).is_ok()
    }

    pub fn error(&self, error: ExecutorError) -> bool {
        self.tx.send(SourceEvent::Error(error)).is_ok()
    }

    pub fn complete(&self) -> bool {
        self.tx.send(SourceEvent::Complete).is_ok()
    }

    /// Whether the executor has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound response chunks for one execution.
#[derive(Debug)]
pub struct ResponseSource {
    rx: UnboundedReceiver<SourceEvent>,
    // Keeps a never-completing source open.
    _keep_alive: Option<ResponseSender>,
}

impl ResponseSource {
    pub fn channel() -> (ResponseSender, ResponseSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ResponseSender { tx },
            ResponseSource {
                rx,
                _keep_alive: None,
            },
        )
    }

    /// A source that yields `responses` and then completes.
    pub fn from_responses(responses: impl IntoIterator<Item = Value>) -> Self {
        let (sender, source) = Self::channel();
        for response in responses {
            sender.next(response);
        }
        sender.complete();
        source
    }

    /// A source that fails immediately.
    pub fn from_error(error: ExecutorError) -> Self {
        let (sender, source) = Self::channel();
        sender.error(error);
        source
    }

    /// A source that never yields and never completes.
    pub fn never() -> Self {
        let (sender, mut source) = Self::channel();
        source._keep_alive = Some(sender);
        source
    }

    /// Next available event, if any. A source whose senders are all gone
    /// counts as completed.
    pub(crate) fn poll(&mut self) -> Option<SourceEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(SourceEvent::Complete),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Next(Value),
    Error(ExecutorError),
    Complete,
}

/// Outbound events of one execution.
#[derive(Debug)]
pub struct ExecutionOutput {
    rx: UnboundedReceiver<ExecutionEvent>,
}

impl ExecutionOutput {
    /// Next event already emitted, without waiting.
    pub fn try_next(&mut self) -> Option<ExecutionEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event. `None` once the executor is gone and every
    /// event has been read.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    /// Every event emitted so far.
    pub fn collect_available(&mut self) -> Vec<ExecutionEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

/// Executor side of `ExecutionOutput`. Terminal events close it.
#[derive(Debug)]
pub(crate) struct OutputSink {
    tx: UnboundedSender<ExecutionEvent>,
    closed: bool,
}

impl OutputSink {
    pub(crate) fn channel() -> (OutputSink, ExecutionOutput) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSink { tx, closed: false }, ExecutionOutput { rx })
    }

    fn send(&mut self, event: ExecutionEvent) {
        if self.closed {
            return;
        }
        // A dropped receiver only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub(crate) fn next(&mut self, response: Value) {
        self.send(ExecutionEvent::Next(response));
    }

    pub(crate) fn error(&mut self, error: ExecutorError) {
        self.send(ExecutionEvent::Error(error));
        self.closed = true;
    }

    pub(crate) fn complete(&mut self) {
        self.send(ExecutionEvent::Complete);
        self.closed = true;
    }
}
