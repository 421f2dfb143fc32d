use std::pin::Pin;

use futures::{FutureExt as _, StreamExt as _};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::decoder::{EventFrame, FrameDecoder};
use crate::config::ClientConfig;
use crate::errors::{ClientError, TransportError, extract_error_message};
use crate::model::{RunId, WorkflowId};

type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, TransportError>> + Send>>;

/// Receives the output of one stream connection.
///
/// `on_frame` is called in arrival order. At most one of `on_close` /
/// `on_error` follows, and nothing is called after it. A cancelled stream
/// gets no terminal callback unless the server had already ended the body,
/// in which case it gets `on_close`.
pub trait StreamObserver: Send + 'static {
    fn on_frame(&mut self, frame: EventFrame);
    fn on_close(&mut self);
    fn on_error(&mut self, error: TransportError);
}

impl StreamObserver for Box<dyn StreamObserver> {
    fn on_frame(&mut self, frame: EventFrame) {
        (**self).on_frame(frame)
    }

    fn on_close(&mut self) {
        (**self).on_close()
    }

    fn on_error(&mut self, error: TransportError) {
        (**self).on_error(error)
    }
}

/// Callback notifications as channel messages.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamSignal {
    Frame(EventFrame),
    Closed,
    Failed(TransportError),
}

impl StreamObserver for mpsc::UnboundedSender<StreamSignal> {
    fn on_frame(&mut self, frame: EventFrame) {
        let _ = self.send(StreamSignal::Frame(frame));
    }

    fn on_close(&mut self) {
        let _ = self.send(StreamSignal::Closed);
    }

    fn on_error(&mut self, error: TransportError) {
        let _ = self.send(StreamSignal::Failed(error));
    }
}

/// Body of the request that starts or resumes a run stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct StreamRequest {
    pub workflow_id: WorkflowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub resume: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl StreamRequest {
    /// Request for a fresh run.
    pub fn start(workflow_id: WorkflowId, inputs: Option<serde_json::Value>) -> Self {
        Self {
            workflow_id,
            inputs,
            resume: false,
            run_id: None,
        }
    }

    /// Request that re-attaches to a paused run.
    pub fn resume(workflow_id: WorkflowId, run_id: RunId) -> Self {
        Self {
            workflow_id,
            inputs: None,
            resume: true,
            run_id: Some(run_id),
        }
    }
}

/// One open stream connection.
///
/// Owns the read task. `cancel` may be called any number of times from any
/// state; only the first call has an effect. Dropping the handle cancels it.
pub struct StreamHandle {
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Starts reading `bytes` on a new task, decoding frames into `observer`.
    pub fn spawn<S, O>(bytes: S, observer: O) -> Self
    where
        S: futures::Stream<Item = Result<bytes::Bytes, TransportError>> + Send + 'static,
        O: StreamObserver,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(Box::pin(bytes), observer, cancel_rx));
        Self {
            cancel_tx,
            task: Some(task),
        }
    }

    /// Requests cancellation. Returns true only for the call that cancelled.
    pub fn cancel(&self) -> bool {
        self.cancel_tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// True once the read task has delivered its last callback.
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Waits for the read task to finish without cancelling it.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn read_loop<O: StreamObserver>(
    mut bytes: ByteStream,
    mut observer: O,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::default();
    loop {
        if *cancel_rx.borrow() {
            finish_cancelled(&mut bytes, &mut observer);
            return;
        }
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    finish_cancelled(&mut bytes, &mut observer);
                    return;
                }
            }
            next = bytes.next() => match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.feed(&chunk) {
                        if *cancel_rx.borrow() {
                            return;
                        }
                        observer.on_frame(frame);
                    }
                }
                Some(Err(err)) => {
                    if *cancel_rx.borrow() {
                        return;
                    }
                    warn!(error = %err, "stream read failed");
                    observer.on_error(err);
                    return;
                }
                None => {
                    debug!(buffered = decoder.pending_len(), "stream closed by server");
                    observer.on_close();
                    return;
                }
            }
        }
    }
}

// A cancel that lands after the server already ended the body still reports
// the clean close; otherwise a cancelled stream stays silent.
fn finish_cancelled<O: StreamObserver>(bytes: &mut ByteStream, observer: &mut O) {
    loop {
        match bytes.next().now_or_never() {
            Some(Some(Ok(_))) => continue,
            Some(None) => {
                debug!("stream cancelled after the server closed it");
                observer.on_close();
                return;
            }
            Some(Some(Err(_))) | None => {
                debug!("stream cancelled");
                return;
            }
        }
    }
}

/// Opens run streams.
#[async_trait::async_trait]
pub trait RunStreamOpener: Send + Sync {
    /// Opens one connection. Fails before any callback when the server
    /// rejects the request.
    async fn open(
        &self,
        request: &StreamRequest,
        observer: Box<dyn StreamObserver>,
    ) -> Result<StreamHandle, TransportError>;
}

/// HTTP implementation of `RunStreamOpener`.
pub struct StreamTransport {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl StreamTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        // No overall timeout: a run may legitimately stream for a long time.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build stream client: {e}")))?;
        Ok(Self {
            client,
            url: config.stream_url(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    /// Sends the request and, once the server accepts it, starts dispatching
    /// frames to `observer`.
    pub async fn open_stream<O: StreamObserver>(
        &self,
        request: &StreamRequest,
        observer: O,
    ) -> Result<StreamHandle, TransportError> {
        debug!(url = %self.url, workflow_id = %request.workflow_id, resume = request.resume, "opening run stream");
        let mut http_req = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = &self.bearer_token {
            http_req = http_req.bearer_auth(token);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: extract_error_message(status.as_u16(), &body),
            });
        }
        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            && !content_type.contains("text/event-stream")
        {
            return Err(TransportError::Protocol(format!(
                "expected an event stream, got {content_type}"
            )));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Read(e.to_string())));
        Ok(StreamHandle::spawn(bytes, observer))
    }
}

#[async_trait::async_trait]
impl RunStreamOpener for StreamTransport {
    async fn open(
        &self,
        request: &StreamRequest,
        observer: Box<dyn StreamObserver>,
    ) -> Result<StreamHandle, TransportError> {
        self.open_stream(request, observer).await
    }
}
