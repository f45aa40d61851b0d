// src/supervisor.rs
//
// Owns the job table and the `provides` set behind one lock, launches and
// stops jobs, and routes kernel process events into job state transitions.
// Grounded on the job-table-plus-single-lock shape implied throughout
// `artisan_middleware` (its `LockWithTimeout` over a shared table), here
// reimplemented directly on `tokio::sync::RwLock` since this crate doesn't
// carry `dusa_collection_utils`.

use crate::config::AppConfig;
use crate::dependency_graph::DependencyGraph;
use crate::error::Error;
use crate::job::{Job, JobId, JobSnapshot, JobSpec, JobState};
use crate::log;
use crate::logger::LogLevel;
use crate::process_events::{ProcEvent, ProcEventKind, ProcessEventSource};
use crate::timestamp::current_timestamp;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::{getsid, Pid};
use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;
use uuid::Uuid;

struct SupervisorState {
    jobs: HashMap<JobId, Job>,
    labels: HashMap<String, JobId>,
    pids: HashMap<i32, JobId>,
    provides: HashSet<String>,
}

pub struct Supervisor {
    config: AppConfig,
    event_source: Arc<dyn ProcessEventSource>,
    state: RwLock<SupervisorState>,
}

/// Standard record-query shape: a list of `(field, op, value)` triples
/// plus `limit`/`offset` params. Only equality is implemented — there's no
/// other filter consumer yet to justify a full query language.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub equals: Vec<(String, String)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Supervisor {
    pub fn new(config: AppConfig, event_source: Arc<dyn ProcessEventSource>) -> Arc<Self> {
        Arc::new(Supervisor {
            config,
            event_source,
            state: RwLock::new(SupervisorState {
                jobs: HashMap::new(),
                labels: HashMap::new(),
                pids: HashMap::new(),
                provides: HashSet::new(),
            }),
        })
    }

    pub async fn snapshot_provides(&self) -> HashSet<String> {
        self.state.read().await.provides.clone()
    }

    /// `load(spec)`: validates, assigns an id, enforces label uniqueness,
    /// and — if `RunAtLoad` — starts the job once requires are satisfied.
    /// Returns the new job id.
    pub async fn load(self: &Arc<Self>, spec: JobSpec) -> Result<JobId, Error> {
        let job = Job::from_spec(spec)?;
        let id = job.id;
        let label = job.label.clone();
        let run_at_load = job.run_at_load;

        {
            let mut state = self.state.write().await;
            if state.labels.contains_key(&label) {
                return Err(Error::AlreadyExists(format!(
                    "label already loaded: {}",
                    label
                )));
            }
            state.labels.insert(label.clone(), id);
            state.jobs.insert(id, job);
        }

        if run_at_load {
            // Ignore "requires not yet satisfied" — that's a normal no-op,
            // not a load failure.
            let _ = self.start_by_id(id).await;
        }

        Ok(id)
    }

    /// `unload(name_or_id)`: stops the job, then removes it from the table.
    pub async fn unload(&self, name_or_id: &str) -> Result<(), Error> {
        let id = {
            let state = self.state.read().await;
            self.resolve(&state, name_or_id)?
        };
        self.stop_by_id(&id).await?;

        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.remove(&id) {
            state.labels.remove(&job.label);
            if let Some(pid) = job.pid {
                state.pids.remove(&pid);
            }
        }
        Ok(())
    }

    pub async fn start(self: &Arc<Self>, name_or_id: &str) -> Result<(), Error> {
        let id = {
            let state = self.state.read().await;
            self.resolve(&state, name_or_id)?
        };
        self.start_by_id(id).await
    }

    pub async fn stop(&self, name_or_id: &str) -> Result<(), Error> {
        let id = {
            let state = self.state.read().await;
            self.resolve(&state, name_or_id)?
        };
        self.stop_by_id(&id).await
    }

    pub async fn query(&self, filter: QueryFilter) -> Vec<JobSnapshot> {
        let state = self.state.read().await;
        let mut rows: Vec<JobSnapshot> = state
            .jobs
            .values()
            .map(Job::to_snapshot)
            .filter(|snap| matches_filter(snap, &filter))
            .collect();
        rows.sort_by(|a, b| a.label.cmp(&b.label));

        if filter.offset > 0 {
            rows = rows.into_iter().skip(filter.offset).collect();
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows
    }

    fn resolve(&self, state: &SupervisorState, name_or_id: &str) -> Result<JobId, Error> {
        if let Ok(id) = Uuid::parse_str(name_or_id) {
            if state.jobs.contains_key(&id) {
                return Ok(id);
            }
        }
        state
            .labels
            .get(name_or_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no such job: {}", name_or_id)))
    }

    /// Performs the fork/SIGSTOP/track/SIGCONT barrier. Holds the table
    /// lock for the whole sequence: the window between fork and the
    /// SIGSTOP acknowledgement is expected to be microseconds, not the
    /// `exit_timeout`-scale wait `stop()` has to tolerate.
    async fn start_by_id(self: &Arc<Self>, id: JobId) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let provides = state.provides.clone();
        let job = state
            .jobs
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("no such job: {}", id)))?;

        if job.state == JobState::Running || job.state == JobState::Dying {
            return Ok(());
        }
        if !job.requires_satisfied(&provides) {
            return Ok(());
        }
        let now = current_timestamp();
        if !job.throttle_elapsed(now) {
            return Ok(());
        }

        let (mut command, _stdout_file, _stderr_file) = job.build_command()?;

        let mut child = command.spawn().map_err(Error::from)?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("spawned child has no pid".into()))? as i32;

        log!(LogLevel::Info, "spawned job {} as pid {}", job.label, pid);

        self.event_source.track(pid)?;

        // Block until the child's self-SIGSTOP is observed, so the watch
        // is guaranteed armed before we let it continue past exec.
        tokio::task::spawn_blocking(move || {
            waitid(Id::Pid(Pid::from_raw(pid)), WaitPidFlag::WSTOPPED)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
        .map_err(|e| Error::Internal(format!("waitid failed for pid {}: {}", pid, e)))?;

        signal::kill(Pid::from_raw(pid), Signal::SIGCONT)
            .map_err(|e| Error::Internal(format!("SIGCONT failed for pid {}: {}", pid, e)))?;

        let job = state.jobs.get_mut(&id).expect("job present under lock");
        job.pid = Some(pid);
        job.child = Some(child);
        job.state = JobState::Running;
        job.started_at = Some(now);
        job.last_launch_at = Some(now);
        job.did_exec = false;
        state.pids.insert(pid, id);

        Ok(())
    }

    /// `stop()`: SIGTERM, wait up to `exit_timeout` for the event loop to
    /// observe EXIT, escalate to SIGKILL, wait once more, then give up with
    /// a logged warning. Only holds the table lock for the brief signal +
    /// read steps, never across the wait, so one slow `stop()` never blocks
    /// other RPC calls.
    async fn stop_by_id(&self, id: &JobId) -> Result<(), Error> {
        let (pid, exit_timeout, notify) = {
            let mut state = self.state.write().await;
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("no such job: {}", id)))?;

            match job.state {
                JobState::Stopped | JobState::Unknown => return Ok(()),
                _ => {}
            }
            let pid = match job.pid {
                Some(pid) => pid,
                None => return Ok(()),
            };
            job.state = JobState::Dying;
            let notify = job.notify_exit.clone();
            let exit_timeout = job.exit_timeout.max(1);
            (pid, exit_timeout, notify)
        };

        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);

        if tokio::time::timeout(Duration::from_secs(exit_timeout), notify.notified())
            .await
            .is_ok()
        {
            return Ok(());
        }

        log!(
            LogLevel::Warn,
            "pid {} did not exit within {}s of SIGTERM; escalating to SIGKILL",
            pid,
            exit_timeout
        );
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);

        if tokio::time::timeout(Duration::from_secs(exit_timeout), notify.notified())
            .await
            .is_ok()
        {
            return Ok(());
        }

        log!(
            LogLevel::Warn,
            "pid {} did not exit after SIGKILL; giving up",
            pid
        );
        Ok(())
    }

    /// Commits `targets` into `provides`, then activates every STOPPED job
    /// whose `requires` are now satisfied. This is the only place newly
    /// provided targets get acted on — there is no separate periodic sweep
    /// to fall back on, so a job only starts because some `commit_provides`
    /// or `load` call actually drove it there.
    pub async fn commit_provides(self: &Arc<Self>, targets: HashSet<String>) {
        let to_start: Vec<JobId> = {
            let mut state = self.state.write().await;
            state.provides.extend(targets);
            let provides = state.provides.clone();
            state
                .jobs
                .iter()
                .filter(|(_, job)| job.should_auto_start(&provides))
                .map(|(id, _)| *id)
                .collect()
        };

        for id in to_start {
            if let Err(err) = self.start_by_id(id).await {
                log!(LogLevel::Error, "auto-start failed for job {}: {}", id, err);
            }
        }
    }

    pub async fn revoke_provides(&self, targets: &HashSet<String>) {
        let mut state = self.state.write().await;
        for t in targets {
            state.provides.remove(t);
        }
    }

    /// Consumes `ProcessEventSource` events and advances job state machines:
    /// FORK/EXEC/EXIT routing, the reaping rule, anonymous-job
    /// admission/eviction. Dependency-gated activation happens inline in
    /// `commit_provides`, not here.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ProcEvent>,
        deps: Arc<DependencyGraph>,
    ) {
        while let Some(ev) = events.recv().await {
            self.handle_event(ev, &deps).await;
        }
        log!(LogLevel::Error, "process event source closed; event loop exiting");
    }

    async fn handle_event(self: &Arc<Self>, ev: ProcEvent, deps: &Arc<DependencyGraph>) {
        match ev.kind {
            ProcEventKind::Fork { child } => self.handle_fork(ev.pid, child).await,
            ProcEventKind::Exec => self.handle_exec(ev.pid, deps).await,
            ProcEventKind::Exit { code } => self.handle_exit(ev.pid, code, deps).await,
        }
    }

    async fn handle_fork(&self, parent_pid: i32, child_pid: i32) {
        let mut state = self.state.write().await;
        let Some(&job_id) = state.pids.get(&parent_pid) else {
            self.event_source.untrack(child_pid);
            return;
        };
        let job_sid = state.jobs.get(&job_id).and_then(|j| j.sid);

        let child_sid = getsid(Some(Pid::from_raw(child_pid))).map(|s| s.as_raw()).ok();
        if job_sid.is_some() && child_sid != job_sid {
            self.event_source.untrack(child_pid);
            return;
        }

        let cmd = state
            .jobs
            .get(&job_id)
            .map(|j| j.label.clone())
            .unwrap_or_default();
        let anon = Job::new_anonymous(job_id, child_pid, job_sid.unwrap_or(0), &cmd);
        let anon_id = anon.id;
        state.labels.insert(anon.label.clone(), anon_id);
        state.pids.insert(child_pid, anon_id);
        state.jobs.insert(anon_id, anon);
        drop(state);

        let _ = self.event_source.track(child_pid);
        log!(
            LogLevel::Debug,
            "anonymous job discovered: parent pid {} child pid {}",
            parent_pid,
            child_pid
        );
    }

    async fn handle_exec(&self, pid: i32, deps: &Arc<DependencyGraph>) {
        let mut state = self.state.write().await;
        let Some(&job_id) = state.pids.get(&pid) else {
            return;
        };
        let provides = {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            if job.did_exec {
                return;
            }
            let argv = read_argv(pid).unwrap_or_else(|| job.program_arguments.clone());
            if !job.argv_matches(&argv) {
                return;
            }
            job.did_exec = true;
            job.sid = getsid(Some(Pid::from_raw(pid))).map(|s| s.as_raw()).ok();
            job.provides.clone()
        };
        drop(state);

        if !provides.is_empty() {
            deps.provide(provides).await;
        }
    }

    async fn handle_exit(self: &Arc<Self>, pid: i32, code: i32, deps: &Arc<DependencyGraph>) {
        self.event_source.untrack(pid);

        let (job_id, anonymous, revoked, keep_alive, label) = {
            let mut state = self.state.write().await;
            let Some(job_id) = state.pids.remove(&pid) else {
                return;
            };
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };

            // For a direct child, the real wait() status is available and
            // is more trustworthy than the event source's own `code` (the
            // polling fallback can't observe a real exit code and reports
            // a synthetic one).
            let real_code = job.child.as_mut().and_then(|child| {
                child
                    .try_wait()
                    .ok()
                    .flatten()
                    .and_then(|status| status.code().or_else(|| status.signal().map(|sig| -sig)))
            });
            job.pid = None;
            job.child = None;
            job.last_exit_code = Some(real_code.unwrap_or(code));
            job.exited_at = Some(current_timestamp());

            let was_dying = job.state == JobState::Dying;
            let keep_alive = job.keep_alive && !was_dying;
            if keep_alive {
                job.respawns += 1;
            }
            job.state = JobState::Stopped;
            let revoked = std::mem::take(&mut job.provides);
            // Anonymous jobs don't advertise; leave requires/provides of
            // managed jobs intact for a future relaunch.
            if !job.anonymous {
                job.provides = revoked.clone();
            }
            let notify = job.notify_exit.clone();
            notify.notify_waiters();

            let anonymous = job.anonymous;
            let label = job.label.clone();

            if anonymous {
                state.jobs.remove(&job_id);
                state.labels.remove(&label);
            }

            (job_id, anonymous, revoked, keep_alive, label)
        };

        if !anonymous && !revoked.is_empty() {
            deps.revoke(&revoked).await;
        }

        log!(
            LogLevel::Info,
            "job {} (pid {}) exited with code {}",
            label,
            pid,
            code
        );

        if keep_alive {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.start_by_id(job_id).await {
                    log!(LogLevel::Error, "keep-alive relaunch failed for {}: {}", job_id, err);
                }
            });
        }
    }

    /// Periodic sweep logging jobs whose `requires` has stayed unsatisfied
    /// longer than the configured threshold.
    pub async fn run_unsatisfied_requires_sweep(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.unsatisfied_requires_warn_after_secs);
        loop {
            tokio::time::sleep(interval).await;
            let state = self.state.read().await;
            let provides = state.provides.clone();
            for job in state.jobs.values() {
                if job.state == JobState::Stopped && !job.requires_satisfied(&provides) {
                    let missing: Vec<&String> =
                        job.requires.difference(&provides).collect();
                    log!(
                        LogLevel::Warn,
                        "job {} has unsatisfied requires: {:?}",
                        job.label,
                        missing
                    );
                }
            }
        }
    }
}

fn matches_filter(snap: &JobSnapshot, filter: &QueryFilter) -> bool {
    filter.equals.iter().all(|(field, value)| match field.as_str() {
        "Label" => &snap.label == value,
        "State" => snap.state.to_string() == *value,
        "Program" => &snap.program == value,
        _ => true,
    })
}

#[cfg(target_os = "linux")]
fn read_argv(pid: i32) -> Option<Vec<String>> {
    procfs::process::Process::new(pid).ok()?.cmdline().ok()
}

#[cfg(not(target_os = "linux"))]
fn read_argv(_pid: i32) -> Option<Vec<String>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_events::spawn_poll;
    use std::collections::HashMap;

    fn spec(label: &str, program: &str, args: &[&str]) -> JobSpec {
        JobSpec {
            label: label.to_string(),
            program: program.to_string(),
            program_arguments: args.iter().map(|s| s.to_string()).collect(),
            requires: HashSet::new(),
            provides: HashSet::new(),
            run_at_load: false,
            keep_alive: false,
            throttle_interval: 0,
            exit_timeout: 5,
            standard_out_path: None,
            standard_error_path: None,
            environment_variables: HashMap::new(),
            user_name: None,
            group_name: None,
            umask: None,
        }
    }

    fn new_supervisor() -> Arc<Supervisor> {
        let handle = spawn_poll(Duration::from_millis(50));
        Supervisor::new(AppConfig::dummy(), handle.source)
    }

    /// Like `new_supervisor`, but also drives the real event loop off a
    /// polling event source, so tests can exercise the fork/exec/exit path
    /// against real spawned processes.
    fn new_supervisor_with_loop() -> (Arc<Supervisor>, tokio::task::JoinHandle<()>) {
        let handle = spawn_poll(Duration::from_millis(20));
        let supervisor = Supervisor::new(AppConfig::dummy(), handle.source);
        let deps = DependencyGraph::new(supervisor.clone());
        let event_loop = tokio::spawn(supervisor.clone().run_event_loop(handle.events, deps));
        (supervisor, event_loop)
    }

    async fn wait_until_running(supervisor: &Arc<Supervisor>, id: JobId) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let rows = supervisor.query(QueryFilter::default()).await;
                if rows.iter().any(|r| r.id == id && r.state == JobState::Running) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job did not reach RUNNING in time");
    }

    #[tokio::test]
    async fn fork_from_an_untracked_parent_untracks_the_child() {
        use crate::process_events::MockProcessEventSource;

        let mut mock = MockProcessEventSource::new();
        mock.expect_untrack().with(mockall::predicate::eq(999)).times(1).return_const(());
        let supervisor = Supervisor::new(AppConfig::dummy(), Arc::new(mock));

        // No job has pid 111, so the child (999) must be untracked rather
        // than adopted as an anonymous job.
        supervisor.handle_fork(111, 999).await;

        let rows = supervisor.query(QueryFilter::default()).await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn label_collision_on_load_is_rejected() {
        let supervisor = new_supervisor();
        supervisor
            .load(spec("x", "/bin/sh", &["/bin/sh", "-c", "exit 0"]))
            .await
            .unwrap();
        let err = supervisor
            .load(spec("x", "/bin/sh", &["/bin/sh", "-c", "exit 0"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn unload_unknown_job_is_not_found() {
        let supervisor = new_supervisor();
        let err = supervisor.unload("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn query_filters_by_label() {
        let supervisor = new_supervisor();
        supervisor
            .load(spec("a", "/bin/sh", &["/bin/sh", "-c", "exit 0"]))
            .await
            .unwrap();
        supervisor
            .load(spec("b", "/bin/sh", &["/bin/sh", "-c", "exit 0"]))
            .await
            .unwrap();

        let filter = QueryFilter {
            equals: vec![("Label".to_string(), "a".to_string())],
            ..Default::default()
        };
        let rows = supervisor.query(filter).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "a");
    }

    #[tokio::test]
    async fn dependency_gated_job_stays_stopped_until_provided() {
        let supervisor = new_supervisor();
        let mut s = spec("a", "/bin/sleep", &["/bin/sleep", "60"]);
        s.requires.insert("net".to_string());
        let id = supervisor.load(s).await.unwrap();

        let rows = supervisor.query(QueryFilter::default()).await;
        let row = rows.iter().find(|r| r.id == id).unwrap();
        assert_eq!(row.state, JobState::Stopped);
    }

    #[tokio::test]
    async fn dependency_gated_job_activates_as_soon_as_its_requirement_is_provided() {
        let (supervisor, event_loop) = new_supervisor_with_loop();
        let mut a = spec("a", "/bin/sleep", &["/bin/sleep", "60"]);
        a.requires.insert("net".to_string());
        a.run_at_load = true;
        let id = supervisor.load(a).await.unwrap();

        let rows = supervisor.query(QueryFilter::default()).await;
        assert_eq!(rows.iter().find(|r| r.id == id).unwrap().state, JobState::Stopped);

        let mut targets = HashSet::new();
        targets.insert("net".to_string());
        supervisor.commit_provides(targets).await;

        let rows = supervisor.query(QueryFilter::default()).await;
        assert_eq!(rows.iter().find(|r| r.id == id).unwrap().state, JobState::Running);

        event_loop.abort();
    }

    #[tokio::test]
    async fn simple_run_reaches_stopped_with_exit_code_zero() {
        let (supervisor, event_loop) = new_supervisor_with_loop();
        let mut s = spec("echo", "/bin/sh", &["/bin/sh", "-c", "exit 0"]);
        s.run_at_load = true;
        let id = supervisor.load(s).await.unwrap();

        let row = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let rows = supervisor.query(QueryFilter::default()).await;
                if let Some(row) = rows.iter().find(|r| r.id == id) {
                    if row.state == JobState::Stopped && row.pid.is_none() {
                        return row.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job did not reach STOPPED in time");

        assert_eq!(row.last_exit_status, Some(0));
        event_loop.abort();
    }

    #[tokio::test]
    async fn graceful_stop_reaches_stopped_within_exit_timeout() {
        let (supervisor, event_loop) = new_supervisor_with_loop();
        let mut s = spec("sleeper", "/bin/sleep", &["/bin/sleep", "60"]);
        s.run_at_load = true;
        s.exit_timeout = 3;
        let id = supervisor.load(s).await.unwrap();
        wait_until_running(&supervisor, id).await;

        supervisor.stop(&id.to_string()).await.unwrap();

        let rows = supervisor.query(QueryFilter::default()).await;
        let row = rows.iter().find(|r| r.id == id).unwrap();
        assert_eq!(row.state, JobState::Stopped);
        assert!(row.pid.is_none());

        event_loop.abort();
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill_when_sigterm_is_ignored() {
        let (supervisor, event_loop) = new_supervisor_with_loop();
        let mut s = spec(
            "stubborn",
            "/bin/sh",
            &["/bin/sh", "-c", "trap '' TERM; sleep 60"],
        );
        s.run_at_load = true;
        s.exit_timeout = 1;
        let id = supervisor.load(s).await.unwrap();
        wait_until_running(&supervisor, id).await;

        let started = tokio::time::Instant::now();
        supervisor.stop(&id.to_string()).await.unwrap();
        let elapsed = started.elapsed();

        // SIGTERM is trapped away, so stop() must escalate to SIGKILL
        // rather than wait forever: bounded by roughly two exit_timeouts,
        // not indefinitely.
        assert!(elapsed < Duration::from_secs(5), "stop() took too long: {:?}", elapsed);

        let rows = supervisor.query(QueryFilter::default()).await;
        let row = rows.iter().find(|r| r.id == id).unwrap();
        assert_eq!(row.state, JobState::Stopped);

        event_loop.abort();
    }

    #[tokio::test]
    async fn anonymous_child_is_discovered_and_reaped_on_exit() {
        let (supervisor, event_loop) = new_supervisor_with_loop();
        let mut s = spec("shell", "/bin/sh", &["/bin/sh", "-c", "sleep 1 & wait"]);
        s.run_at_load = true;
        let shell_id = supervisor.load(s).await.unwrap();

        let anon_id = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let rows = supervisor.query(QueryFilter::default()).await;
                if let Some(anon) = rows.iter().find(|r| r.parent_id == Some(shell_id)) {
                    return anon.id;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("anonymous child was not discovered");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let rows = supervisor.query(QueryFilter::default()).await;
                if !rows.iter().any(|r| r.id == anon_id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("anonymous child was not reaped on exit");

        event_loop.abort();
    }
}
