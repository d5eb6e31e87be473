//! Request/response correlation for one HID channel
//!
//! A channel has a single inbound queue of response frames. Only one request
//! may be outstanding at a time: callers take the queue lock (bounded by
//! `lock_timeout`), discard whatever is already queued, write their request
//! and then consume frames until one matches, an early-exit predicate fires,
//! or the deadline passes. Frames that match nothing are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::transport::HidTransport;

/// Frame predicate used for matching and early exit
pub type FramePredicate<'a> = &'a (dyn Fn(&[u8]) -> bool + Send + Sync);

pub struct Correlator {
    transport: Arc<dyn HidTransport>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    lock_timeout: Duration,
}

impl Correlator {
    pub fn new(
        transport: Arc<dyn HidTransport>,
        inbound: mpsc::Receiver<Vec<u8>>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            inbound: Mutex::new(inbound),
            lock_timeout,
        }
    }

    /// Write `command` and wait for the first frame accepted by `matcher`.
    ///
    /// Returns `None` when the channel is busy past the lock timeout, the
    /// write fails, `early_exit` accepts a frame, or `timeout` elapses. The
    /// write counts against `timeout`.
    pub async fn send_and_wait(
        &self,
        command: &[u8],
        matcher: FramePredicate<'_>,
        timeout: Duration,
        early_exit: Option<FramePredicate<'_>>,
    ) -> Option<Vec<u8>> {
        let mut inbound = match tokio::time::timeout(self.lock_timeout, self.inbound.lock()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                debug!(
                    lock_timeout_ms = self.lock_timeout.as_millis() as u64,
                    "Channel busy, skipping request"
                );
                return None;
            }
        };

        let mut stale = 0usize;
        while inbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            trace!(stale, "Discarded stale frames");
        }

        // The write and the response share one deadline
        let deadline = Instant::now() + timeout;
        let transport = self.transport.clone();
        let data = command.to_vec();
        let write = tokio::task::spawn_blocking(move || transport.write(&data));
        match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "HID write failed");
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "HID write task failed");
                return None;
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "HID write timed out");
                return None;
            }
        }

        loop {
            let frame = match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Inbound queue closed");
                    return None;
                }
                Err(_) => {
                    trace!(timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    return None;
                }
            };

            if early_exit.is_some_and(|exit| exit(&frame)) {
                trace!(frame = ?frame, "Early exit");
                return None;
            }
            if matcher(&frame) {
                return Some(frame);
            }
            trace!(frame = ?frame, "Discarded unmatched frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn correlator(lock_timeout_ms: u64) -> (Arc<Correlator>, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let correlator = Correlator::new(
            Arc::new(MockTransport::silent()),
            rx,
            Duration::from_millis(lock_timeout_ms),
        );
        (Arc::new(correlator), tx)
    }

    fn is_battery_response(frame: &[u8]) -> bool {
        frame.len() > 3 && frame[2] == 0x06
    }

    #[tokio::test]
    async fn test_single_frame_delivered_once() {
        let (correlator, tx) = correlator(1000);
        let frame = vec![0x11, 0x01, 0x06, 0x0A, 50, 0x04, 0x00];

        let mut handles = Vec::new();
        for _ in 0..2 {
            let c = correlator.clone();
            handles.push(tokio::spawn(async move {
                c.send_and_wait(
                    &[0x10, 0x01, 0x06, 0x0A, 0, 0, 0],
                    &is_battery_response,
                    Duration::from_millis(200),
                    None,
                )
                .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(frame.clone()).await.unwrap();

        let mut delivered = 0;
        for handle in handles {
            if let Some(received) = handle.await.unwrap() {
                assert_eq!(received, frame);
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_busy_channel_gives_up() {
        let (correlator, _tx) = correlator(20);

        let holder = correlator.clone();
        let long = tokio::spawn(async move {
            holder
                .send_and_wait(&[0x10], &is_battery_response, Duration::from_millis(300), None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = std::time::Instant::now();
        let result = correlator
            .send_and_wait(&[0x10], &is_battery_response, Duration::from_millis(300), None)
            .await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_millis(250));

        assert!(long.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_released_after_timeout() {
        let (correlator, tx) = correlator(50);

        let first = correlator
            .send_and_wait(&[0x10], &is_battery_response, Duration::from_millis(100), None)
            .await;
        assert!(first.is_none());

        let c = correlator.clone();
        let second = tokio::spawn(async move {
            c.send_and_wait(
                &[0x10],
                &is_battery_response,
                Duration::from_millis(500),
                None,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frame = vec![0x11, 0x01, 0x06, 0x0A, 42, 0x04, 0x00];
        tx.send(frame.clone()).await.unwrap();

        assert_eq!(second.await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_stalled_write_is_bounded() {
        struct StalledTransport;

        impl HidTransport for StalledTransport {
            fn write(&self, data: &[u8]) -> std::io::Result<usize> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(data.len())
            }

            fn read_timeout(&self, _buf: &mut [u8], _timeout_ms: i32) -> std::io::Result<usize> {
                Ok(0)
            }
        }

        let (_tx, rx) = mpsc::channel(1);
        let correlator = Correlator::new(Arc::new(StalledTransport), rx, Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result = correlator
            .send_and_wait(&[0x10], &is_battery_response, Duration::from_millis(50), None)
            .await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_stale_frames_are_discarded() {
        let (correlator, tx) = correlator(1000);
        tx.send(vec![0x11, 0x01, 0x06, 0x0A, 99]).await.unwrap();

        let result = correlator
            .send_and_wait(&[0x10], &is_battery_response, Duration::from_millis(100), None)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_early_exit_and_unmatched_frames() {
        let (correlator, tx) = correlator(1000);
        let is_error = |frame: &[u8]| frame.len() > 2 && frame[2] == 0xFF;

        let c = correlator.clone();
        let pending = tokio::spawn(async move {
            c.send_and_wait(
                &[0x10],
                &is_battery_response,
                Duration::from_secs(5),
                Some(&is_error),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(vec![0x11, 0x01, 0x07, 0x0A]).await.unwrap();
        tx.send(vec![0x11, 0x01, 0xFF, 0x06]).await.unwrap();

        let started = std::time::Instant::now();
        assert!(pending.await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
