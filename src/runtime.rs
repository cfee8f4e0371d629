//! The invocation lifecycle engine: fetch, invoke, complete, reschedule.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;

use crate::client::RuntimeApiClient;
use crate::context::{Context, EnvironmentSnapshot, InvokeContext};
use crate::errors::{self, ContextError, ErrorValue};
use crate::gate::{Completion, CompletionGate};
use crate::telemetry;

/// A deferred handler computation that settles with a result or an error.
pub type HandlerFuture = BoxFuture<'static, Result<Value, ErrorValue>>;

/// What a handler invocation produced.
pub enum HandlerOutcome {
    /// A computation that settles later; the loop routes its outcome through
    /// the completion gate.
    Deferred(HandlerFuture),
    /// The handler reports through the completion gate (or not at all, in
    /// which case an empty success is posted once the process is quiescent).
    Pending,
}

impl HandlerOutcome {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, ErrorValue>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }
}

/// The user-supplied function invoked once per unit of work.
pub trait Handler {
    fn invoke(&mut self, event: Value, context: Context) -> HandlerOutcome;
}

impl<F> Handler for F
where
    F: FnMut(Value, Context) -> HandlerOutcome,
{
    fn invoke(&mut self, event: Value, context: Context) -> HandlerOutcome {
        (self)(event, context)
    }
}

/// Process-wide escape hatches for failures that cannot be recovered within
/// the current slot. Both report the error (against the current invocation if
/// one is in flight, as an init error otherwise) and then exit with the
/// reserved status code.
#[derive(Clone)]
pub struct ErrorCallbacks {
    client: RuntimeApiClient,
    current_invoke_id: Arc<Mutex<Option<String>>>,
}

impl ErrorCallbacks {
    pub fn new(client: RuntimeApiClient) -> Self {
        Self {
            client,
            current_invoke_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Point escapes at the invocation now in flight. Single writer: the loop
    /// overwrites this at every fetch-to-invoke transition.
    pub fn set_invocation(&self, id: &str) {
        if let Ok(mut slot) = self.current_invoke_id.lock() {
            *slot = Some(id.to_string());
        }
    }

    /// A synchronous escape reached the top level. Exit code 129.
    pub async fn uncaught_exception(&self, error: ErrorValue) {
        tracing::error!(detail = %errors::to_formatted(&error), "uncaught exception");
        self.report(&error).await;
        std::process::exit(129);
    }

    /// An asynchronous escape reached the top level. Exit code 128.
    pub async fn unhandled_rejection(&self, error: ErrorValue) {
        tracing::error!(detail = %errors::to_formatted(&error), "unhandled rejection");
        self.report(&error).await;
        std::process::exit(128);
    }

    async fn report(&self, error: &ErrorValue) {
        let invoke_id = self
            .current_invoke_id
            .lock()
            .ok()
            .and_then(|slot| slot.clone());

        let posted = match invoke_id {
            Some(id) => self.client.post_invocation_error(&id, error).await,
            None => self.client.post_init_error(error).await,
        };

        if let Err(err) = posted {
            tracing::error!(error = %err, "failed to report fatal error");
        }
    }
}

/// Registry of in-flight background work started by handlers.
///
/// Quiescence is the point where this registry is empty: the loop waits for
/// it before reusing the slot, unless the handler opts out.
#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<BackgroundInner>,
    callbacks: Option<ErrorCallbacks>,
}

struct BackgroundInner {
    pending: Mutex<usize>,
    notify: Notify,
}

impl BackgroundTasks {
    pub fn new(callbacks: ErrorCallbacks) -> Self {
        Self {
            inner: Arc::new(BackgroundInner {
                pending: Mutex::new(0),
                notify: Notify::new(),
            }),
            callbacks: Some(callbacks),
        }
    }

    /// Registry with no escape reporting attached.
    #[cfg(test)]
    pub(crate) fn unattended() -> Self {
        Self {
            inner: Arc::new(BackgroundInner {
                pending: Mutex::new(0),
                notify: Notify::new(),
            }),
            callbacks: None,
        }
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut pending) = self.inner.pending.lock() {
            *pending += 1;
        }

        let tasks = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            tasks.finish_one();

            if let Err(payload) = outcome {
                let error = ErrorValue::from_background_panic(payload);
                match &tasks.callbacks {
                    Some(callbacks) => callbacks.unhandled_rejection(error).await,
                    None => {
                        tracing::error!(detail = %errors::to_formatted(&error), "background task panicked")
                    }
                }
            }
        });
    }

    fn finish_one(&self) {
        let drained = match self.inner.pending.lock() {
            Ok(mut pending) => {
                *pending = pending.saturating_sub(1);
                *pending == 0
            }
            Err(_) => false,
        };
        if drained {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolve once no background work remains. The notified future is
    /// created before the count is read so a completion between the two
    /// cannot be missed.
    pub async fn quiescent(&self) {
        loop {
            let notified = self.inner.notify.notified();
            let pending = self.inner.pending.lock().map(|p| *p).unwrap_or(0);
            if pending == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// The invocation loop. One instance serves one execution slot; invocations
/// are strictly sequential.
pub struct Runtime<H> {
    client: RuntimeApiClient,
    handler: H,
    callbacks: ErrorCallbacks,
    background: BackgroundTasks,
}

impl<H: Handler> Runtime<H> {
    pub fn new(client: RuntimeApiClient, handler: H) -> Self {
        let callbacks = ErrorCallbacks::new(client.clone());
        let background = BackgroundTasks::new(callbacks.clone());
        Self {
            client,
            handler,
            callbacks,
            background,
        }
    }

    /// Run invocations until the process exits. Each iteration starts from
    /// the loop head, never by recursion, so stack depth stays bounded no
    /// matter how many invocations this slot serves.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            if let Err(err) = self.handle_once().await {
                // Orchestration failures are not handler failures: report
                // through the top-level escape and stop serving the slot.
                tracing::error!(error = %format!("{err:#}"), "unexpected top level error");
                self.callbacks.uncaught_exception(loop_error_value(err)).await;
            }

            // Let tasks queued by the finished invocation run first.
            tokio::task::yield_now().await;
        }
    }

    /// One full fetch-invoke-complete cycle.
    async fn handle_once(&mut self) -> anyhow::Result<()> {
        let invocation = self.client.next_invocation().await?;
        let invoke_context = InvokeContext::new(invocation.headers);

        let invoke_id = invoke_context.invoke_id()?;
        telemetry::set_current_request_id(&invoke_id);
        self.callbacks.set_invocation(&invoke_id);

        let (gate, mut completion_rx) = CompletionGate::new();

        invoke_context.forward_trace_context();
        match invoke_context.header_data() {
            Err(err) => gate.callback(Some(err.into()), None),
            Ok(header_data) => match serde_json::from_slice::<Value>(&invocation.body) {
                Err(err) => gate.callback(
                    Some(ErrorValue::error(
                        "Runtime.MalformedEventBody",
                        err.to_string(),
                    )),
                    None,
                ),
                Ok(event) => {
                    let context = Context::new(
                        EnvironmentSnapshot::capture(),
                        header_data,
                        gate.clone(),
                        self.background.clone(),
                    );

                    let called = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        self.handler.invoke(event, context)
                    }));

                    match called {
                        // A synchronous escape from the handler is this
                        // invocation's failure, not the process's.
                        Err(payload) => {
                            gate.callback(Some(ErrorValue::from_panic(payload)), None)
                        }
                        Ok(HandlerOutcome::Pending) => {}
                        Ok(HandlerOutcome::Deferred(future)) => {
                            match AssertUnwindSafe(future).catch_unwind().await {
                                Ok(Ok(result)) => gate.succeed(result),
                                Ok(Err(error)) => gate.fail(Some(error)),
                                Err(payload) => {
                                    self.callbacks
                                        .uncaught_exception(ErrorValue::from_panic(payload))
                                        .await;
                                }
                            }
                        }
                    }
                }
            },
        }

        // Either the gate fires, or the process goes quiescent first and the
        // invocation completes as an implicit empty success.
        let completion = tokio::select! {
            biased;
            completion = &mut completion_rx => {
                completion.unwrap_or(Completion::Response(Value::Null))
            }
            () = self.background.quiescent() => {
                gate.done(None, Some(Value::Null));
                completion_rx
                    .await
                    .unwrap_or(Completion::Response(Value::Null))
            }
        };

        match completion {
            Completion::Error(error) => {
                tracing::error!(detail = %errors::to_formatted(&error), "invoke error");
                self.client.post_invocation_error(&invoke_id, &error).await?;
            }
            Completion::Response(result) => {
                self.client
                    .post_invocation_response(&invoke_id, &result)
                    .await?;
                if gate.wait_for_quiescence() {
                    self.background.quiescent().await;
                }
            }
        }

        Ok(())
    }
}

fn loop_error_value(err: anyhow::Error) -> ErrorValue {
    match err.downcast::<ContextError>() {
        Ok(context_err) => context_err.into(),
        Err(err) => ErrorValue::error("Runtime.UnexpectedError", format!("{err:#}")),
    }
}
