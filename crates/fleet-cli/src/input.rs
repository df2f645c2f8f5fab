use fleet_core::wire::NdjsonFrameDecoder;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Streams NDJSON frames from `reader` into `tx`. Bad lines are logged and
/// skipped; the sender is dropped at end of input.
pub fn spawn_ndjson_reader<R, T>(mut reader: R, tx: mpsc::Sender<T>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = NdjsonFrameDecoder::<T>::default();
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let (report, done) = match reader.read(&mut buf).await {
                Ok(0) => (decoder.finish(), true),
                Ok(n) => (decoder.push_chunk(&buf[..n]), false),
                Err(err) => {
                    warn!(event = "input_read_failed", error = %err);
                    (decoder.finish(), true)
                }
            };
            for err in report.errors {
                warn!(event = "input_line_invalid", error = %err);
            }
            for frame in report.frames {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            if done {
                return;
            }
        }
    })
}
