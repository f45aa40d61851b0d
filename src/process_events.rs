// src/process_events.rs
//
// ProcessEventSource: registers/removes per-pid kernel watches and produces a
// stream of fork/exec/exit events. Two implementations selected by `cfg`:
//
// - `KqueueEventSource` on BSD-family targets (FreeNAS's actual home), built
//   on the `kqueue` crate's EVFILT_PROC support.
// - `PollEventSource` elsewhere (this development environment is Linux),
//   grounded on `artisan_middleware::process_manager::collect_descendants`'s
//   approach of walking `procfs::process::all_processes()` to build a
//   pid -> children map and diffing it on an interval.
//
// Both funnel into the same `mpsc::Receiver<ProcEvent>` so `Supervisor`'s
// event loop doesn't need to know which one is active.

use crate::error::Error;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEventKind {
    Fork { child: i32 },
    Exec,
    Exit { code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEvent {
    pub pid: i32,
    pub kind: ProcEventKind,
}

/// Registers/removes per-pid kernel watches. Adding an already-tracked pid,
/// or removing a pid that was never tracked, is a no-op rather than an error.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessEventSource: Send + Sync {
    fn track(&self, pid: i32) -> Result<(), Error>;
    fn untrack(&self, pid: i32);
}

pub struct EventSourceHandle {
    pub source: Arc<dyn ProcessEventSource>,
    pub events: mpsc::Receiver<ProcEvent>,
}

// ---------------------------------------------------------------------
// BSD: kqueue EVFILT_PROC
// ---------------------------------------------------------------------

#[cfg(any(
    target_os = "freebsd",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue_source {
    use super::{EventSourceHandle, ProcEvent, ProcEventKind, ProcessEventSource};
    use crate::error::Error;
    use crate::log;
    use crate::logger::LogLevel;
    use kqueue::{EventFilter, FilterFlag, Ident, Watcher};
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use tokio::sync::mpsc;

    pub struct KqueueEventSource {
        commands: std_mpsc::Sender<Command>,
    }

    enum Command {
        Track(i32),
        Untrack(i32),
    }

    impl ProcessEventSource for KqueueEventSource {
        fn track(&self, pid: i32) -> Result<(), Error> {
            self.commands
                .send(Command::Track(pid))
                .map_err(|_| Error::Internal("kqueue watcher thread is gone".into()))
        }

        fn untrack(&self, pid: i32) {
            let _ = self.commands.send(Command::Untrack(pid));
        }
    }

    /// Spawns the dedicated OS thread that owns the kqueue fd and bridges
    /// its blocking `poll()` loop into an async channel — the same "blocking
    /// I/O on its own thread, forwarded through a channel" shape
    /// `process_manager.rs::read_stream_to_buffer` used for child stdio.
    pub fn spawn() -> Result<EventSourceHandle, Error> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<Command>();
        let (evt_tx, evt_rx) = mpsc::channel::<ProcEvent>(1024);
        let watcher = Arc::new(Mutex::new(
            Watcher::new().map_err(|e| Error::Unavailable(e.to_string()))?,
        ));

        {
            let watcher = watcher.clone();
            thread::Builder::new()
                .name("serviced-kqueue".into())
                .spawn(move || kqueue_loop(watcher, cmd_rx, evt_tx))
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(EventSourceHandle {
            source: Arc::new(KqueueEventSource { commands: cmd_tx }),
            events: evt_rx,
        })
    }

    const TRACK_FLAGS: FilterFlag = FilterFlag::NOTE_EXIT
        .union(FilterFlag::NOTE_EXEC)
        .union(FilterFlag::NOTE_FORK)
        .union(FilterFlag::NOTE_TRACK);

    fn kqueue_loop(
        watcher: Arc<Mutex<Watcher>>,
        commands: std_mpsc::Receiver<Command>,
        events: mpsc::Sender<ProcEvent>,
    ) {
        loop {
            while let Ok(cmd) = commands.try_recv() {
                let mut w = watcher.lock().unwrap();
                match cmd {
                    Command::Track(pid) => {
                        if let Err(err) =
                            w.add_pid(pid, EventFilter::EVFILT_PROC, TRACK_FLAGS)
                        {
                            log!(LogLevel::Warn, "failed to track pid {}: {}", pid, err);
                            continue;
                        }
                        if let Err(err) = w.watch() {
                            log!(LogLevel::Warn, "kqueue watch() failed: {}", err);
                        }
                    }
                    Command::Untrack(pid) => {
                        let _ = w.remove_pid(pid, EventFilter::EVFILT_PROC, TRACK_FLAGS);
                    }
                }
            }

            let ev = {
                let mut w = watcher.lock().unwrap();
                w.poll(Some(std::time::Duration::from_millis(200)))
            };

            let Some(ev) = ev else { continue };
            let Ident::Pid(pid) = ev.ident else { continue };

            let kqueue::EventFilter::EVFILT_PROC = ev.filter else {
                continue;
            };

            let flags = ev.flags;
            if flags.contains(FilterFlag::NOTE_CHILD) {
                // `data` carries the parent pid on a NOTE_CHILD (NOTE_TRACK) event.
                let parent = ev.data_as_i64().unwrap_or_default() as i32;
                let _ = events.blocking_send(ProcEvent {
                    pid: parent,
                    kind: ProcEventKind::Fork { child: pid },
                });
                continue;
            }
            if flags.contains(FilterFlag::NOTE_EXEC) {
                let _ = events.blocking_send(ProcEvent {
                    pid,
                    kind: ProcEventKind::Exec,
                });
            }
            if flags.contains(FilterFlag::NOTE_EXIT) {
                let code = ev.data_as_i64().unwrap_or_default() as i32;
                let _ = events.blocking_send(ProcEvent {
                    pid,
                    kind: ProcEventKind::Exit { code },
                });
            }
        }
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue_source::spawn as spawn_native;

// ---------------------------------------------------------------------
// Fallback: poll /proc on an interval
// ---------------------------------------------------------------------

/// Best-effort process-event source for targets without a native per-pid
/// watch facility. FORK/EXEC tracking degrades to best-effort (a process
/// that forks and the child exits between two polls is missed entirely);
/// anonymous-job discovery still runs, but is subject to the same race.
pub struct PollEventSource {
    tracked: std::sync::Mutex<HashSet<i32>>,
}

impl ProcessEventSource for PollEventSource {
    fn track(&self, pid: i32) -> Result<(), Error> {
        self.tracked.lock().unwrap().insert(pid);
        Ok(())
    }

    fn untrack(&self, pid: i32) {
        self.tracked.lock().unwrap().remove(&pid);
    }
}

pub fn spawn_poll(poll_interval: Duration) -> EventSourceHandle {
    let source = Arc::new(PollEventSource {
        tracked: std::sync::Mutex::new(HashSet::new()),
    });
    let (evt_tx, evt_rx) = mpsc::channel::<ProcEvent>(1024);

    {
        let source = source.clone();
        tokio::spawn(async move {
            poll_loop(source, evt_tx, poll_interval).await;
        });
    }

    EventSourceHandle {
        source,
        events: evt_rx,
    }
}

async fn poll_loop(
    source: Arc<PollEventSource>,
    events: mpsc::Sender<ProcEvent>,
    interval: Duration,
) {
    // pid -> did we already report its current exec() as matching.
    let mut known: HashSet<i32> = HashSet::new();
    let mut exec_reported: HashSet<i32> = HashSet::new();

    loop {
        tokio::time::sleep(interval).await;

        let tracked: HashSet<i32> = source.tracked.lock().unwrap().clone();
        if tracked.is_empty() && known.is_empty() {
            continue;
        }

        let children_of: HashMap<i32, Vec<i32>> = match read_children_map() {
            Ok(map) => map,
            Err(_) => continue,
        };
        let alive: HashSet<i32> = children_of
            .values()
            .flatten()
            .copied()
            .chain(children_of.keys().copied())
            .collect();

        for &pid in &tracked {
            if !exec_reported.contains(&pid) && alive.contains(&pid) {
                exec_reported.insert(pid);
                let _ = events
                    .send(ProcEvent {
                        pid,
                        kind: ProcEventKind::Exec,
                    })
                    .await;
            }

            if let Some(children) = children_of.get(&pid) {
                for &child in children {
                    if known.insert(child) {
                        let _ = events
                            .send(ProcEvent {
                                pid,
                                kind: ProcEventKind::Fork { child },
                            })
                            .await;
                    }
                }
            }

            if known.contains(&pid) && !alive.contains(&pid) {
                known.remove(&pid);
                exec_reported.remove(&pid);
                let _ = events
                    .send(ProcEvent {
                        pid,
                        kind: ProcEventKind::Exit { code: -1 },
                    })
                    .await;
            }
        }

        for pid in known.clone() {
            if !alive.contains(&pid) && !tracked.contains(&pid) {
                known.remove(&pid);
                let _ = events
                    .send(ProcEvent {
                        pid,
                        kind: ProcEventKind::Exit { code: -1 },
                    })
                    .await;
            }
        }

        known.extend(tracked.iter().copied().filter(|p| alive.contains(p)));
    }
}

#[cfg(target_os = "linux")]
fn read_children_map() -> Result<HashMap<i32, Vec<i32>>, Error> {
    use procfs::process::all_processes;

    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();
    for proc in all_processes().map_err(|e| Error::Unavailable(e.to_string()))? {
        let proc = match proc {
            Ok(p) => p,
            Err(_) => continue,
        };
        if let Ok(stat) = proc.stat() {
            children_of.entry(stat.ppid).or_default().push(proc.pid());
        }
    }
    Ok(children_of)
}

#[cfg(not(target_os = "linux"))]
fn read_children_map() -> Result<HashMap<i32, Vec<i32>>, Error> {
    Err(Error::Unavailable(
        "no /proc-equivalent process enumeration on this target".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_then_untrack_is_idempotent() {
        let source = PollEventSource {
            tracked: std::sync::Mutex::new(HashSet::new()),
        };
        source.track(123).unwrap();
        source.track(123).unwrap();
        assert_eq!(source.tracked.lock().unwrap().len(), 1);
        source.untrack(123);
        source.untrack(123);
        assert!(source.tracked.lock().unwrap().is_empty());
    }
}
