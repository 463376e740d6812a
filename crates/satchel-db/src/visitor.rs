use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// Cooperative control shared between a running query and other
/// threads: pause/resume parks the executing thread between candidate
/// documents; abort is best-effort at the same granularity.
#[derive(Default)]
pub struct QueryCtl {
    paused: Mutex<bool>,
    resumed: Condvar,
    aborted: AtomicBool,
}

impl QueryCtl {
    pub fn new() -> QueryCtl {
        QueryCtl::default()
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.resumed.notify_all();
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        // an aborted query must not stay parked
        self.resume();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Called by the executor between candidate documents. Blocks
    /// while paused; returns `false` when the query should stop.
    pub(crate) fn checkpoint(&self) -> bool {
        if self.is_aborted() {
            return false;
        }
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
            if self.is_aborted() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn abort_flag_stops_checkpoint() {
        let ctl = QueryCtl::new();
        assert!(ctl.checkpoint());
        ctl.abort();
        assert!(!ctl.checkpoint());
    }

    #[test]
    fn paused_checkpoint_blocks_until_resume() {
        let ctl = Arc::new(QueryCtl::new());
        ctl.pause();
        let worker = {
            let ctl = Arc::clone(&ctl);
            std::thread::spawn(move || ctl.checkpoint())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!worker.is_finished(), "worker should be parked");
        ctl.resume();
        assert!(worker.join().unwrap());
    }
}
