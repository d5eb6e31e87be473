//! In-memory transport for exercising channels without hardware
//!
//! Every write is recorded and passed to a responder closure; the frames it
//! returns become readable. Unsolicited reports can be pushed with
//! [`MockTransport::inject`].

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::transport::{HidTransport, ReportSupport};

type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

pub struct MockTransport {
    responder: Responder,
    writes: Mutex<Vec<Vec<u8>>>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    reports: ReportSupport,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new(responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            writes: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            reports: ReportSupport::BOTH,
        }
    }

    /// Limit the reports the interface accepts; other writes fail
    pub fn with_reports(mut self, reports: ReportSupport) -> Self {
        self.reports = reports;
        self
    }

    /// A device that never answers
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Queue an unsolicited report
    pub fn inject(&self, frame: Vec<u8>) {
        lock(&self.pending).push_back(frame);
        self.ready.notify_all();
    }

    /// Every report written so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }
}

impl HidTransport for MockTransport {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let report_id = data.first().copied().unwrap_or_default();
        if !self.reports.accepts(report_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("report 0x{:02X} not supported", report_id),
            ));
        }
        lock(&self.writes).push(data.to_vec());
        let replies = (self.responder)(data);
        if !replies.is_empty() {
            lock(&self.pending).extend(replies);
            self.ready.notify_all();
        }
        Ok(data.len())
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> io::Result<usize> {
        let mut pending = lock(&self.pending);
        if pending.is_empty() {
            let wait = Duration::from_millis(timeout_ms.max(0) as u64);
            pending = self
                .ready
                .wait_timeout(pending, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        match pending.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn reports(&self) -> ReportSupport {
        self.reports
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
