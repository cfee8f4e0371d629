//! Once-only completion reporting for an invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::ErrorValue;

/// The outcome reported through a gate.
#[derive(Debug)]
pub enum Completion {
    Response(Value),
    Error(ErrorValue),
}

/// Per-invocation completion gate.
///
/// All entry points share one first-call-wins slot: whichever of
/// [`succeed`](Self::succeed), [`fail`](Self::fail), [`done`](Self::done) or
/// [`callback`](Self::callback) fires first decides the outcome, and every
/// later call (from any entry point) is silently discarded. A handler that
/// both calls back and returns a value cannot corrupt the loop.
#[derive(Clone)]
pub struct CompletionGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    finished: AtomicBool,
    wait_for_quiescence: AtomicBool,
    outcome: Mutex<Option<oneshot::Sender<Completion>>>,
}

impl CompletionGate {
    pub fn new() -> (Self, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            inner: Arc::new(GateInner {
                finished: AtomicBool::new(false),
                wait_for_quiescence: AtomicBool::new(true),
                outcome: Mutex::new(Some(tx)),
            }),
        };
        (gate, rx)
    }

    /// Report the outcome: a non-null error wins over any result.
    pub fn done(&self, error: Option<ErrorValue>, result: Option<Value>) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let completion = match error {
            Some(error) => Completion::Error(error),
            None => Completion::Response(result.unwrap_or(Value::Null)),
        };

        let sender = self.inner.outcome.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(completion);
        }
    }

    pub fn succeed(&self, result: Value) {
        self.done(None, Some(result));
    }

    /// Failing with no error is normalized to the literal `"handled"`.
    pub fn fail(&self, error: Option<ErrorValue>) {
        let error = error.unwrap_or_else(|| ErrorValue::Message("handled".to_string()));
        self.done(Some(error), None);
    }

    /// Node-style callback form; equivalent to [`done`](Self::done).
    pub fn callback(&self, error: Option<ErrorValue>, result: Option<Value>) {
        self.done(error, result);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Whether the loop should wait for background work to drain before the
    /// next fetch. Defaults to true.
    pub fn wait_for_quiescence(&self) -> bool {
        self.inner.wait_for_quiescence.load(Ordering::SeqCst)
    }

    pub fn set_wait_for_quiescence(&self, value: bool) {
        self.inner.wait_for_quiescence.store(value, Ordering::SeqCst);
    }
}
