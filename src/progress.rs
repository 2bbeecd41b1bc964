use serde::Serialize;
use snafu::ResultExt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error;

/// Minimum interval between throttled progress emissions
const EMIT_INTERVAL: Duration = Duration::from_millis(100);
/// Byte delta that forces an emission regardless of the interval
const EMIT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Progress,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Pull,
    Push,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerStatus {
    pub id: String,
    pub size: u64,
    pub current: u64,
}

/// One newline-delimited JSON message on the progress stream.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerStatus>,
    pub mode: Mode,
}

/// Serializes messages as NDJSON onto a shared writer. The lock keeps
/// whole lines atomic when several layer pumps emit concurrently.
struct Emitter {
    writer: tokio::sync::Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl Emitter {
    fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Box::pin(writer)),
        }
    }

    async fn emit(&self, message: &Message) -> crate::Result<()> {
        let mut line = serde_json::to_vec(message).context(error::SerializeSnafu)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_slice())
            .await
            .context(error::ProgressWriteSnafu)?;
        writer.flush().await.context(error::ProgressWriteSnafu)?;
        Ok(())
    }
}

/// Emission throttle. Progress messages go out when enough time or bytes
/// have passed since the previous one, and always for the final update.
struct Throttle {
    last_emit: Option<Instant>,
    bytes_at_last: u64,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_emit: None,
            bytes_at_last: 0,
        }
    }

    fn should_emit(&mut self, aggregate: u64, is_final: bool) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                last.elapsed() >= EMIT_INTERVAL
                    || aggregate.saturating_sub(self.bytes_at_last) >= EMIT_BYTES
            }
        };
        if due || is_final {
            self.last_emit = Some(Instant::now());
            self.bytes_at_last = aggregate;
            return true;
        }
        false
    }
}

/// Cloneable handle feeding byte counts for one layer. Intermediate
/// updates use a 1-slot channel with drop-newest semantics so a slow
/// consumer cannot stall the transfer; the final update is sent blocking
/// so the end-of-stream message is never lost.
#[derive(Clone)]
pub struct LayerHandle {
    sender: mpsc::Sender<u64>,
    size: u64,
}

impl LayerHandle {
    /// Report the cumulative byte count for this layer, dropping the
    /// update if the pump is busy.
    pub fn update(&self, complete: u64) {
        let _ = self.sender.try_send(complete);
    }

    /// Report the layer complete, waiting for the pump to accept it.
    pub async fn finish(&self) {
        let _ = self.sender.send(self.size).await;
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A no-op handle for callers that did not ask for progress.
pub fn null_handle() -> LayerHandle {
    let (sender, _receiver) = mpsc::channel(1);
    LayerHandle { sender, size: 0 }
}

/// AsyncRead tee that counts bytes flowing through it and reports them
/// to a layer handle.
pub struct TrackedReader<R> {
    inner: R,
    seen: u64,
    handle: LayerHandle,
}

impl<R> TrackedReader<R> {
    pub fn new(inner: R, handle: LayerHandle) -> Self {
        Self {
            inner,
            seen: 0,
            handle,
        }
    }
}

impl<R> AsyncRead for TrackedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.seen += n as u64;
                    this.handle.update(this.seen);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Progress state shared by a tracker's pumps.
struct TrackerState {
    total: u64,
    aggregate: u64,
    last_layer: Option<LayerStatus>,
}

/// Aggregates progress across the layers of one pull or push. Each
/// registered layer gets its own pump task; emissions carry the image
/// total and the most recently advancing layer.
pub struct Tracker {
    emitter: Arc<Emitter>,
    mode: Mode,
    state: Arc<Mutex<TrackerState>>,
    throttle: Arc<Mutex<Throttle>>,
    pumps: Mutex<Vec<JoinHandle<crate::Result<()>>>>,
}

impl Tracker {
    pub fn new(writer: impl AsyncWrite + Send + 'static, mode: Mode) -> Self {
        Self {
            emitter: Arc::new(Emitter::new(writer)),
            mode,
            state: Arc::new(Mutex::new(TrackerState {
                total: 0,
                aggregate: 0,
                last_layer: None,
            })),
            throttle: Arc::new(Mutex::new(Throttle::new())),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Register a layer and spawn its pump. The returned handle feeds the
    /// pump; closing every clone of it ends the pump.
    pub fn register(&self, id: impl Into<String>, size: u64) -> LayerHandle {
        let id = id.into();
        let (sender, mut receiver) = mpsc::channel::<u64>(1);
        {
            let mut state = self.state.lock().expect("tracker state poisoned");
            state.total += size;
        }
        let emitter = self.emitter.clone();
        let state = self.state.clone();
        let throttle = self.throttle.clone();
        let mode = self.mode;
        let pump = tokio::spawn(async move {
            let mut current: u64 = 0;
            while let Some(update) = receiver.recv().await {
                // per-layer counts are monotonic even if updates race
                let advanced = update.max(current) - current;
                current += advanced;
                let is_final = current >= size;
                let (emit, message) = {
                    let mut state = state.lock().expect("tracker state poisoned");
                    state.aggregate += advanced;
                    let aggregate = state.aggregate;
                    let status = LayerStatus {
                        id: id.clone(),
                        size,
                        current,
                    };
                    state.last_layer = Some(status.clone());
                    let mut throttle = throttle.lock().expect("throttle poisoned");
                    let emit = throttle.should_emit(aggregate, is_final);
                    (
                        emit,
                        Message {
                            message_type: MessageType::Progress,
                            message: None,
                            total: state.total,
                            layer: Some(status),
                            mode,
                        },
                    )
                };
                if emit {
                    emitter.emit(&message).await?;
                }
            }
            Ok(())
        });
        self.pumps
            .lock()
            .expect("tracker pumps poisoned")
            .push(pump);
        LayerHandle { sender, size }
    }

    async fn message(&self, message_type: MessageType, text: impl Into<String>) -> crate::Result<()> {
        let (total, layer) = {
            let state = self.state.lock().expect("tracker state poisoned");
            (state.total, state.last_layer.clone())
        };
        self.emitter
            .emit(&Message {
                message_type,
                message: Some(text.into()),
                total,
                layer,
                mode: self.mode,
            })
            .await
    }

    pub async fn success(&self, text: impl Into<String>) -> crate::Result<()> {
        self.message(MessageType::Success, text).await
    }

    pub async fn warning(&self, text: impl Into<String>) -> crate::Result<()> {
        self.message(MessageType::Warning, text).await
    }

    pub async fn error(&self, text: impl Into<String>) -> crate::Result<()> {
        self.message(MessageType::Error, text).await
    }

    /// Wait for every layer pump to drain and surface the first write
    /// error, if any.
    pub async fn wait(&self) -> crate::Result<()> {
        let pumps = {
            let mut guard = self.pumps.lock().expect("tracker pumps poisoned");
            std::mem::take(&mut *guard)
        };
        for pump in pumps {
            pump.await.context(error::TaskJoinSnafu)??;
        }
        Ok(())
    }
}

/// Single-layer progress reporter: consumes `{complete, total}` updates
/// from its channel and emits throttled progress messages until the
/// channel closes.
pub struct Reporter {
    sender: mpsc::Sender<Update>,
    pump: JoinHandle<crate::Result<()>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Update {
    pub complete: u64,
    pub total: u64,
}

impl Reporter {
    pub fn new(
        writer: impl AsyncWrite + Send + 'static,
        mode: Mode,
        layer_id: impl Into<String>,
        size: u64,
    ) -> Self {
        let id = layer_id.into();
        let (sender, mut receiver) = mpsc::channel::<Update>(1);
        let emitter = Emitter::new(writer);
        let pump = tokio::spawn(async move {
            let mut throttle = Throttle::new();
            while let Some(update) = receiver.recv().await {
                let is_final = update.complete >= update.total;
                if throttle.should_emit(update.complete, is_final) {
                    emitter
                        .emit(&Message {
                            message_type: MessageType::Progress,
                            message: None,
                            total: update.total,
                            layer: Some(LayerStatus {
                                id: id.clone(),
                                size,
                                current: update.complete,
                            }),
                            mode,
                        })
                        .await?;
                }
            }
            Ok(())
        });
        Self { sender, pump }
    }

    pub fn sender(&self) -> mpsc::Sender<Update> {
        self.sender.clone()
    }

    /// Close the update channel and block until the pump drains,
    /// returning any write error it hit.
    pub async fn wait(self) -> crate::Result<()> {
        drop(self.sender);
        self.pump.await.context(error::TaskJoinSnafu)?
    }
}

#[cfg(test)]
mod test {
    use std::io::BufRead;
    use std::sync::{Arc, Mutex};

    use super::{Mode, Reporter, Tracker, Update};

    /// AsyncWrite capturing emitted bytes for assertions
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl tokio::io::AsyncWrite for Capture {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl Capture {
        fn lines(&self) -> Vec<serde_json::Value> {
            let raw = self.0.lock().unwrap().clone();
            raw.as_slice()
                .lines()
                .map(|line| serde_json::from_str(line.unwrap().as_str()).unwrap())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_reporter_emits_final_message() {
        let capture = Capture::default();
        let reporter = Reporter::new(capture.clone(), Mode::Pull, "sha256:abc", 100);
        let sender = reporter.sender();
        sender
            .send(Update {
                complete: 40,
                total: 100,
            })
            .await
            .unwrap();
        sender
            .send(Update {
                complete: 100,
                total: 100,
            })
            .await
            .unwrap();
        drop(sender);
        reporter.wait().await.unwrap();

        let lines = capture.lines();
        assert!(!lines.is_empty());
        let last = lines.last().unwrap();
        assert_eq!(last["type"], "progress");
        assert_eq!(last["layer"]["current"], 100);
        assert_eq!(last["layer"]["size"], 100);
        assert_eq!(last["mode"], "pull");
    }

    #[tokio::test]
    async fn test_layer_progress_is_monotonic() {
        let capture = Capture::default();
        let tracker = Tracker::new(capture.clone(), Mode::Pull);
        let handle = tracker.register("sha256:abc", 1024);
        for step in 1..=8u64 {
            handle.update(step * 128);
            tokio::task::yield_now().await;
        }
        handle.finish().await;
        drop(handle);
        tracker.wait().await.unwrap();

        let lines = capture.lines();
        let currents: Vec<u64> = lines
            .iter()
            .filter(|line| line["type"] == "progress")
            .map(|line| line["layer"]["current"].as_u64().unwrap())
            .collect();
        assert!(!currents.is_empty());
        assert!(currents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*currents.last().unwrap(), 1024);
    }

    #[tokio::test]
    async fn test_tracker_total_is_image_size() {
        let capture = Capture::default();
        let tracker = Tracker::new(capture.clone(), Mode::Pull);
        let first = tracker.register("sha256:aaa", 600);
        let second = tracker.register("sha256:bbb", 400);
        first.finish().await;
        second.finish().await;
        drop((first, second));
        tracker.wait().await.unwrap();
        tracker.success("model pulled").await.unwrap();

        let lines = capture.lines();
        for line in lines.iter() {
            assert_eq!(line["total"], 1000);
        }
        let last = lines.last().unwrap();
        assert_eq!(last["type"], "success");
        assert_eq!(last["message"], "model pulled");
    }

    #[tokio::test]
    async fn test_intermediate_updates_dropped_not_blocking() {
        let capture = Capture::default();
        let tracker = Tracker::new(capture.clone(), Mode::Push);
        let handle = tracker.register("sha256:abc", u64::MAX);
        // far more updates than the 1-slot channel can hold; none block
        for step in 0..10_000u64 {
            handle.update(step);
        }
        drop(handle);
        tracker.wait().await.unwrap();
    }
}
