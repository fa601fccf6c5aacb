//! Background worker loop plumbing.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn a worker thread that runs `body` every `tick` until shutdown.
///
/// The shutdown channel doubles as the tick timer, so a stop request takes
/// effect without waiting out the interval.
pub(crate) fn spawn_ticker<F>(name: &'static str, tick: Duration, mut body: F) -> WorkerHandle
where
    F: FnMut() + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match shutdown_rx.recv_timeout(tick) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => body(),
            }
        })
        .expect("failed to spawn worker thread");
    WorkerHandle::new(shutdown_tx, join)
}
