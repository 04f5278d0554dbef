use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use super::{ReadyMarker, RendezvousChannel, Signal};
use crate::error::{LoggerError, Result};

#[derive(Debug, Default)]
struct Board {
    ready: BTreeMap<String, ReadyMarker>,
    go: HashMap<String, u64>,
    stop: bool,
    /// Bumped on every change so waiters can tell a wakeup from a timeout.
    generation: u64,
}

/// In-process rendezvous for controllers running as threads. Every change
/// wakes all waiters through a condition variable.
#[derive(Debug, Clone, Default)]
pub struct LocalChannel {
    inner: Arc<(Mutex<Board>, Condvar)>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn board(&self) -> Result<MutexGuard<'_, Board>> {
        self.inner
            .0
            .lock()
            .map_err(|_| LoggerError::Channel("rendezvous board poisoned".to_owned()))
    }

    fn update<T>(&self, change: impl FnOnce(&mut Board) -> T) -> Result<T> {
        let mut board = self.board()?;
        let out = change(&mut board);
        board.generation += 1;
        self.inner.1.notify_all();
        Ok(out)
    }
}

impl RendezvousChannel for LocalChannel {
    fn post_ready(&self, marker: &ReadyMarker) -> Result<()> {
        self.update(|b| {
            b.ready.insert(marker.controller.clone(), marker.clone());
        })
    }

    fn ready_markers(&self) -> Result<Vec<ReadyMarker>> {
        Ok(self.board()?.ready.values().cloned().collect())
    }

    fn clear_ready(&self) -> Result<()> {
        self.update(|b| b.ready.clear())
    }

    fn post_go(&self, controller: &str, burst_index: u64) -> Result<()> {
        self.update(|b| {
            b.go.insert(controller.to_owned(), burst_index);
        })
    }

    fn take_signal(&self, controller: &str) -> Result<Option<Signal>> {
        {
            let board = self.board()?;
            if !board.go.contains_key(controller) {
                return Ok(board.stop.then_some(Signal::Stop));
            }
        }
        // consuming a GO is a change the leader may be waiting on
        let burst = self.update(|b| b.go.remove(controller))?;
        Ok(burst.map(Signal::Go))
    }

    fn post_stop(&self) -> Result<()> {
        self.update(|b| b.stop = true)
    }

    fn reset(&self) -> Result<()> {
        self.update(|b| {
            b.ready.clear();
            b.go.clear();
            b.stop = false;
        })
    }

    fn wait_for_change(&self, timeout: Duration) -> Result<()> {
        let board = self.board()?;
        let seen = board.generation;
        let (_board, _timed_out) = self
            .inner
            .1
            .wait_timeout_while(board, timeout, |b| b.generation == seen)
            .map_err(|_| LoggerError::Channel("rendezvous board poisoned".to_owned()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    #[test]
    fn go_is_consumed_and_stop_is_not() {
        let channel = LocalChannel::new();
        channel.post_go("a", 4).unwrap();
        assert_eq!(channel.take_signal("b").unwrap(), None);
        assert_eq!(channel.take_signal("a").unwrap(), Some(Signal::Go(4)));
        assert_eq!(channel.take_signal("a").unwrap(), None);

        channel.post_stop().unwrap();
        assert_eq!(channel.take_signal("a").unwrap(), Some(Signal::Stop));
        assert_eq!(channel.take_signal("a").unwrap(), Some(Signal::Stop));
        channel.reset().unwrap();
        assert_eq!(channel.take_signal("a").unwrap(), None);
    }

    #[test]
    fn waiter_wakes_on_post() {
        let channel = LocalChannel::new();
        let poster = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post_stop().unwrap();
        });
        let start = Instant::now();
        while channel.take_signal("a").unwrap().is_none() {
            channel.wait_for_change(Duration::from_millis(50)).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn taking_a_go_wakes_waiters() {
        let channel = LocalChannel::new();
        channel.post_go("a", 0).unwrap();
        let taker = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            taker.take_signal("a").unwrap()
        });
        let start = Instant::now();
        channel.wait_for_change(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.join().unwrap(), Some(Signal::Go(0)));
        assert_eq!(channel.take_signal("a").unwrap(), None);
    }
}
