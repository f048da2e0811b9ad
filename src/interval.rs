//! A cancellable, fixed-period repeating task on a dedicated thread.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel as chan;

/// A callback running every `period` on its own thread.
///
/// The callback is never invoked again before a prior invocation returns.
/// Cancelling (or dropping) the `Interval` wakes the thread immediately; an
/// invocation already in progress is allowed to finish. Dropping also joins
/// the thread.
#[derive(Debug)]
pub struct Interval {
    /// Dropping the sender disconnects the channel, which is the
    /// cancellation signal.
    cancel: Option<chan::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    period: Duration,
}

impl Interval {
    /// Spawn a thread named `name` that calls `callback` once every `period`.
    pub fn spawn<F>(name: String, period: Duration, mut callback: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (cancel, cancelled) = chan::bounded::<()>(0);

        let thread = thread::Builder::new().name(name).spawn(move || loop {
            match cancelled.recv_timeout(period) {
                Err(chan::RecvTimeoutError::Timeout) => callback(),
                Ok(()) | Err(chan::RecvTimeoutError::Disconnected) => break,
            }
        })?;

        Ok(Interval {
            cancel: Some(cancel),
            thread: Some(thread),
            period,
        })
    }

    /// The period between invocations.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Is the task still scheduled to run?
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Stop invoking the callback. Takes effect at the latest once the
    /// in-flight invocation, if any, returns.
    pub fn cancel(&mut self) {
        self.cancel = None;
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        self.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("interval thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Instant;

    #[test]
    fn invokes_repeatedly_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut interval = {
            let ticks = ticks.clone();
            Interval::spawn("test-interval".into(), Duration::from_millis(5), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "interval never ticked");
            thread::sleep(Duration::from_millis(1));
        }

        interval.cancel();
        assert!(!interval.is_active());
        drop(interval);

        let after_join = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_join);
    }

    #[test]
    fn does_not_tick_before_first_period() {
        let ticked = Arc::new(AtomicBool::new(false));
        let interval = {
            let ticked = ticked.clone();
            Interval::spawn("test-interval".into(), Duration::from_secs(60), move || {
                ticked.store(true, Ordering::SeqCst);
            })
            .unwrap()
        };
        assert_eq!(interval.period(), Duration::from_secs(60));

        // Cancellation wakes the thread; dropping must not wait a full period.
        let start = Instant::now();
        drop(interval);
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(!ticked.load(Ordering::SeqCst));
    }

    #[test]
    fn invocations_never_overlap() {
        let running = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicUsize::new(0));
        let interval = {
            let running = running.clone();
            let ticks = ticks.clone();
            Interval::spawn("test-interval".into(), Duration::from_millis(1), move || {
                assert!(!running.swap(true, Ordering::SeqCst));
                thread::sleep(Duration::from_millis(3));
                running.store(false, Ordering::SeqCst);
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 5 {
            assert!(Instant::now() < deadline, "interval never ticked");
            thread::sleep(Duration::from_millis(1));
        }
        drop(interval);
    }
}
