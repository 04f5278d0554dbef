//! Rendezvous over marker files, for controllers running as separate
//! processes. The area is three directories under one root:
//!
//! ```text
//! READY/<controller>|READY   RON-encoded ReadyMarker
//! GO/<controller>            burst index as text
//! STOP/STOP                  empty
//! ```
//!
//! Markers are written under a dot-prefixed temporary name and renamed into
//! place, so a reader never sees a partial marker. Dot files are ignored.

use log::warn;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{ReadyMarker, RendezvousChannel, Signal};
use crate::error::Result;

const READY: &str = "READY";
const GO: &str = "GO";
const STOP: &str = "STOP";

#[derive(Debug, Clone)]
pub struct MarkerChannel {
    root: PathBuf,
    poll: Duration,
}

impl MarkerChannel {
    /// Open (creating if needed) the marker area under `root`.
    pub fn open(root: impl Into<PathBuf>, poll: Duration) -> Result<Self> {
        let root = root.into();
        for area in [READY, GO, STOP] {
            fs::create_dir_all(root.join(area))?;
        }
        Ok(MarkerChannel { root, poll })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn area(&self, area: &str) -> PathBuf {
        self.root.join(area)
    }

    fn post(&self, area: &str, name: &str, contents: &[u8]) -> Result<()> {
        let dir = self.area(area);
        let temp = dir.join(format!(".{name}.tmp"));
        fs::write(&temp, contents)?;
        fs::rename(&temp, dir.join(name))?;
        Ok(())
    }

    /// Visible markers in an area, skipping temporaries.
    fn markers(&self, area: &str) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(self.area(area))? {
            let entry = entry?;
            let hidden = entry.file_name().to_str().map_or(true, |n| n.starts_with('.'));
            if !hidden {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    fn clear(&self, area: &str) -> Result<()> {
        for path in self.markers(area)? {
            remove_if_present(&path)?;
        }
        Ok(())
    }
}

/// Another party may have consumed the marker first; that is fine.
fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl RendezvousChannel for MarkerChannel {
    fn post_ready(&self, marker: &ReadyMarker) -> Result<()> {
        let contents = ron::ser::to_string(marker)?;
        self.post(READY, &format!("{}|{READY}", marker.controller), contents.as_bytes())
    }

    fn ready_markers(&self) -> Result<Vec<ReadyMarker>> {
        let mut markers = Vec::new();
        for path in self.markers(READY)? {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match ron::de::from_str::<ReadyMarker>(&text) {
                Ok(marker) => markers.push(marker),
                Err(e) => warn!("ignoring unreadable READY marker {path:?}: {e}"),
            }
        }
        Ok(markers)
    }

    fn clear_ready(&self) -> Result<()> {
        self.clear(READY)
    }

    fn post_go(&self, controller: &str, burst_index: u64) -> Result<()> {
        self.post(GO, controller, burst_index.to_string().as_bytes())
    }

    fn take_signal(&self, controller: &str) -> Result<Option<Signal>> {
        let go = self.area(GO).join(controller);
        match fs::read_to_string(&go) {
            Ok(text) => {
                remove_if_present(&go)?;
                match text.trim().parse() {
                    Ok(burst) => return Ok(Some(Signal::Go(burst))),
                    Err(e) => warn!("{controller} : ignoring malformed GO marker {text:?}: {e}"),
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let stopped = self.area(STOP).join(STOP).exists();
        Ok(stopped.then_some(Signal::Stop))
    }

    fn post_stop(&self) -> Result<()> {
        self.post(STOP, STOP, b"")
    }

    fn reset(&self) -> Result<()> {
        for area in [READY, GO, STOP] {
            self.clear(area)?;
        }
        Ok(())
    }

    fn wait_for_change(&self, timeout: Duration) -> Result<()> {
        spin_sleep::sleep(timeout.min(self.poll));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (tempfile::TempDir, MarkerChannel) {
        let dir = tempfile::tempdir().unwrap();
        let channel = MarkerChannel::open(dir.path().join("rv"), Duration::from_millis(1)).unwrap();
        (dir, channel)
    }

    #[test]
    fn ready_markers_round_trip() {
        let (_dir, channel) = channel();
        let marker = ReadyMarker {
            controller: "world".into(),
            completed_burst: Some(3),
            pid: 42,
        };
        channel.post_ready(&marker).unwrap();
        assert!(channel.root().join("READY/world|READY").exists());
        assert_eq!(channel.ready_markers().unwrap(), vec![marker]);

        channel.clear_ready().unwrap();
        assert!(channel.ready_markers().unwrap().is_empty());
    }

    #[test]
    fn temporaries_and_garbage_are_ignored() {
        let (_dir, channel) = channel();
        fs::write(channel.root().join("READY/.half.tmp"), "(controller: \"x\"").unwrap();
        fs::write(channel.root().join("READY/junk|READY"), "not ron").unwrap();
        assert!(channel.ready_markers().unwrap().is_empty());
    }

    #[test]
    fn go_is_consumed_by_its_controller() {
        let (_dir, channel) = channel();
        channel.post_go("pupil", 12).unwrap();
        assert_eq!(channel.take_signal("world").unwrap(), None);
        assert_eq!(channel.take_signal("pupil").unwrap(), Some(Signal::Go(12)));
        assert_eq!(channel.take_signal("pupil").unwrap(), None);
    }

    #[test]
    fn stop_stays_until_reset() {
        let (_dir, channel) = channel();
        channel.post_stop().unwrap();
        assert_eq!(channel.take_signal("a").unwrap(), Some(Signal::Stop));
        assert_eq!(channel.take_signal("b").unwrap(), Some(Signal::Stop));
        channel.reset().unwrap();
        assert_eq!(channel.take_signal("a").unwrap(), None);
    }

    #[test]
    fn two_handles_share_the_area() {
        let (dir, leader) = channel();
        let follower = MarkerChannel::open(dir.path().join("rv"), Duration::from_millis(1)).unwrap();
        leader.post_go("ambient", 0).unwrap();
        assert_eq!(follower.take_signal("ambient").unwrap(), Some(Signal::Go(0)));
    }
}
