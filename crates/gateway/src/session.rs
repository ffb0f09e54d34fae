use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use core_types::{ChunkStream, GatewayError};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

const SESSION_BUFFER: usize = 32;

/// A streaming reply driven by its own task. Dropping the session cancels it.
pub struct StreamSession {
    rx: mpsc::Receiver<Result<String, GatewayError>>,
    task: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

/// Cancels a [`StreamSession`] from another task.
#[derive(Debug)]
pub struct StreamCancel {
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl StreamCancel {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }
}

impl StreamSession {
    pub(crate) fn spawn(mut stream: ChunkStream) -> Self {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Self {
            rx,
            task,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops the transfer. No chunk is yielded afterwards.
    pub fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("stream session cancelled");
        }
        self.task.abort();
        self.rx.close();
    }

    pub fn cancel_handle(&self) -> StreamCancel {
        StreamCancel {
            abort: self.task.abort_handle(),
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Drains the session into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String, GatewayError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Stream for StreamSession {
    type Item = Result<String, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    /// Yields `chunks` then never finishes; `dropped` flips once the stream is gone.
    fn endless(chunks: &[&str], dropped: Arc<AtomicBool>) -> ChunkStream {
        let guard = DropFlag(dropped);
        let head: Vec<Result<String, GatewayError>> =
            chunks.iter().map(|chunk| Ok(chunk.to_string())).collect();
        Box::pin(
            futures::stream::iter(head)
                .chain(futures::stream::pending())
                .map(move |item| {
                    let _alive = &guard;
                    item
                }),
        )
    }

    async fn wait_for(flag: &AtomicBool) -> bool {
        for _ in 0..100 {
            if flag.load(Ordering::Acquire) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn forwards_chunks_and_completes() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok("Hel".to_string()),
            Ok("lo".to_string()),
        ]));
        let session = StreamSession::spawn(stream);
        assert_eq!(session.collect_text().await.expect("text"), "Hello");
    }

    #[tokio::test]
    async fn collect_stops_at_first_error() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok("a".to_string()),
            Err(GatewayError::InvalidResponse("cut".to_string())),
            Ok("b".to_string()),
        ]));
        let session = StreamSession::spawn(stream);
        assert_eq!(
            session.collect_text().await,
            Err(GatewayError::InvalidResponse("cut".to_string()))
        );
    }

    #[tokio::test]
    async fn cancel_stops_yielding_and_drops_the_transfer() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut session = StreamSession::spawn(endless(&["first"], Arc::clone(&dropped)));

        assert_eq!(session.next().await, Some(Ok("first".to_string())));
        session.cancel();
        assert!(session.is_cancelled());
        assert_eq!(session.next().await, None);
        assert!(wait_for(&dropped).await, "upstream stream was not dropped");
    }

    #[tokio::test]
    async fn cancel_handle_works_from_another_task() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut session = StreamSession::spawn(endless(&["x"], Arc::clone(&dropped)));
        let handle = session.cancel_handle();

        assert_eq!(session.next().await, Some(Ok("x".to_string())));
        tokio::spawn(async move { handle.cancel() })
            .await
            .expect("join");
        assert_eq!(session.next().await, None);
        assert!(wait_for(&dropped).await);
    }

    #[tokio::test]
    async fn dropping_the_session_aborts_the_task() {
        let dropped = Arc::new(AtomicBool::new(false));
        let session = StreamSession::spawn(endless(&[], Arc::clone(&dropped)));
        drop(session);
        assert!(wait_for(&dropped).await);
    }
}
