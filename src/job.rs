// src/job.rs
//
// Job: the state machine and spawn/kill mechanics for one managed or
// anonymous process. The fork/exec sequence is the same `pre_exec` shape
// `process_manager.rs::spawn_complex_process` uses for `setsid()`, extended
// with the self-SIGSTOP/stdio-redirect/credential-drop/closefd chain the
// barrier protocol requires. `Supervisor` (supervisor.rs) owns the job table
// and drives these operations; this module owns what one job IS and how its
// process gets started, not the table-wide coordination.

use crate::error::Error;
use crate::users;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt as _;
use tokio::process::Command;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Unknown,
    Stopped,
    Running,
    Dying,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Unknown => "UNKNOWN",
            JobState::Stopped => "STOPPED",
            JobState::Running => "RUNNING",
            JobState::Dying => "DYING",
        };
        write!(f, "{}", s)
    }
}

/// The wire shape of a job spec (the property-list form a load request
/// carries). Field names are `PascalCase` and case-sensitive on the wire;
/// Rust fields stay `snake_case`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSpec {
    #[serde(rename = "Label")]
    pub label: String,

    #[serde(rename = "Program")]
    pub program: String,

    #[serde(rename = "ProgramArguments", default)]
    pub program_arguments: Vec<String>,

    #[serde(rename = "Requires", default)]
    pub requires: HashSet<String>,

    #[serde(rename = "Provides", default)]
    pub provides: HashSet<String>,

    #[serde(rename = "RunAtLoad", default)]
    pub run_at_load: bool,

    #[serde(rename = "KeepAlive", default)]
    pub keep_alive: bool,

    #[serde(rename = "ThrottleInterval", default)]
    pub throttle_interval: u64,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL; added
    /// to the property list consistently with the others, defaulting to
    /// `serviced`'s 5-second grace period.
    #[serde(rename = "ExitTimeout", default = "default_exit_timeout")]
    pub exit_timeout: u64,

    #[serde(rename = "StandardOutPath", default)]
    pub standard_out_path: Option<String>,

    #[serde(rename = "StandardErrorPath", default)]
    pub standard_error_path: Option<String>,

    #[serde(rename = "EnvironmentVariables", default)]
    pub environment_variables: HashMap<String, String>,

    #[serde(rename = "UserName", default)]
    pub user_name: Option<String>,

    #[serde(rename = "GroupName", default)]
    pub group_name: Option<String>,

    #[serde(rename = "Umask", default)]
    pub umask: Option<u32>,
}

fn default_exit_timeout() -> u64 {
    5
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), Error> {
        if self.label.trim().is_empty() {
            return Err(Error::Invalid("Label must not be empty".into()));
        }
        if self.program.trim().is_empty() {
            return Err(Error::Invalid("Program must not be empty".into()));
        }
        Ok(())
    }
}

/// One row of the job table. `child` is a runtime addition (not part of
/// the wire model) that lets `Supervisor` reap the OS process this job
/// directly spawned.
pub struct Job {
    pub id: JobId,
    pub label: String,
    pub anonymous: bool,
    pub parent: Option<JobId>,

    pub provides: HashSet<String>,
    pub requires: HashSet<String>,
    pub state: JobState,

    pub program: String,
    pub program_arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<u32>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,

    pub run_at_load: bool,
    pub keep_alive: bool,
    pub throttle_interval: u64,
    pub exit_timeout: u64,

    pub pid: Option<i32>,
    pub sid: Option<i32>,
    pub did_exec: bool,
    pub last_exit_code: Option<i32>,
    pub started_at: Option<u64>,
    pub exited_at: Option<u64>,
    pub respawns: u32,
    pub last_launch_at: Option<u64>,

    /// `None` for anonymous jobs: those pids are grandchildren of this
    /// process, not children, and cannot be `wait()`-ed here.
    pub child: Option<tokio::process::Child>,
    pub notify_exit: std::sync::Arc<tokio::sync::Notify>,
}

impl Job {
    pub fn from_spec(spec: JobSpec) -> Result<Self, Error> {
        spec.validate()?;
        Ok(Job {
            id: Uuid::new_v4(),
            label: spec.label,
            anonymous: false,
            parent: None,
            provides: spec.provides,
            requires: spec.requires,
            state: JobState::Stopped,
            program: spec.program,
            program_arguments: spec.program_arguments,
            environment: spec.environment_variables,
            user: spec.user_name,
            group: spec.group_name,
            umask: spec.umask,
            stdout_path: spec.standard_out_path,
            stderr_path: spec.standard_error_path,
            run_at_load: spec.run_at_load,
            keep_alive: spec.keep_alive,
            throttle_interval: spec.throttle_interval,
            exit_timeout: spec.exit_timeout,
            pid: None,
            sid: None,
            did_exec: false,
            last_exit_code: None,
            started_at: None,
            exited_at: None,
            respawns: 0,
            last_launch_at: None,
            child: None,
            notify_exit: std::sync::Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Synthesizes the anonymous job created when a tracked job's child
    /// forks into a descendant of the same session.
    pub fn new_anonymous(parent: JobId, pid: i32, sid: i32, cmd: &str) -> Self {
        Job {
            id: Uuid::new_v4(),
            label: format!("anonymous.{}@{}", cmd, pid),
            anonymous: true,
            parent: Some(parent),
            provides: HashSet::new(),
            requires: HashSet::new(),
            state: JobState::Running,
            program: String::new(),
            program_arguments: Vec::new(),
            environment: HashMap::new(),
            user: None,
            group: None,
            umask: None,
            stdout_path: None,
            stderr_path: None,
            run_at_load: false,
            keep_alive: false,
            throttle_interval: 0,
            exit_timeout: 0,
            pid: Some(pid),
            sid: Some(sid),
            did_exec: true,
            last_exit_code: None,
            started_at: Some(crate::timestamp::current_timestamp()),
            exited_at: None,
            respawns: 0,
            last_launch_at: None,
            child: None,
            notify_exit: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn requires_satisfied(&self, provides: &HashSet<String>) -> bool {
        self.requires.is_subset(provides)
    }

    /// `did_exec`'s argv-equality debounce: compares element-wise against
    /// `program_arguments`, not just the executable, so an intermediate
    /// wrapper exec doesn't get mistaken for the real one.
    pub fn argv_matches(&self, argv: &[String]) -> bool {
        argv == self.program_arguments.as_slice()
    }

    pub fn should_auto_start(&self, provides: &HashSet<String>) -> bool {
        self.state == JobState::Stopped
            && (self.run_at_load || self.keep_alive)
            && self.requires_satisfied(provides)
    }

    pub fn throttle_elapsed(&self, now: u64) -> bool {
        match self.last_launch_at {
            Some(last) => now.saturating_sub(last) >= self.throttle_interval,
            None => true,
        }
    }

    /// Builds the `Command` that will fork+exec this job's process, chaining
    /// the barrier protocol into a single `pre_exec` hook: self-SIGSTOP,
    /// stdio redirect, credential drop (`setgid` before `setuid`, each
    /// guarded on its own field), close fds from 3 upward, `setsid()`.
    ///
    /// Returns the built `Command` plus the owned stdio `File`s, which must
    /// outlive the `spawn()` call.
    pub fn build_command(&self) -> Result<(Command, File, File), Error> {
        let stdout_file = open_stdio_target(self.stdout_path.as_deref())?;
        let stderr_file = open_stdio_target(self.stderr_path.as_deref())?;

        let uid = self.user.as_deref().map(users::uid_for_name).transpose()?;
        let gid = self.group.as_deref().map(users::gid_for_name).transpose()?;
        let umask = self.umask;

        let stdout_fd = stdout_file.as_raw_fd();
        let stderr_fd = stderr_file.as_raw_fd();

        let mut command = Command::new(&self.program);
        command.args(&self.program_arguments);
        command.envs(&self.environment);
        command.kill_on_drop(false);

        unsafe {
            command.pre_exec(move || pre_exec_chain(stdout_fd, stderr_fd, gid, uid, umask));
        }

        Ok((command, stdout_file, stderr_file))
    }
}

/// Wire shape of a `query` reply row.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    #[serde(rename = "ID")]
    pub id: JobId,
    #[serde(rename = "ParentID")]
    pub parent_id: Option<JobId>,
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Program")]
    pub program: String,
    #[serde(rename = "ProgramArguments")]
    pub program_arguments: Vec<String>,
    #[serde(rename = "Provides")]
    pub provides: HashSet<String>,
    #[serde(rename = "Requires")]
    pub requires: HashSet<String>,
    #[serde(rename = "RunAtLoad")]
    pub run_at_load: bool,
    #[serde(rename = "KeepAlive")]
    pub keep_alive: bool,
    #[serde(rename = "State")]
    pub state: JobState,
    #[serde(rename = "LastExitStatus")]
    pub last_exit_status: Option<i32>,
    #[serde(rename = "PID")]
    pub pid: Option<i32>,
    #[serde(rename = "StandardOutPath", skip_serializing_if = "Option::is_none")]
    pub standard_out_path: Option<String>,
    #[serde(rename = "StandardErrorPath", skip_serializing_if = "Option::is_none")]
    pub standard_error_path: Option<String>,
    #[serde(
        rename = "EnvironmentVariables",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub environment_variables: HashMap<String, String>,
}

impl Job {
    pub fn to_snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            parent_id: self.parent,
            label: self.label.clone(),
            program: self.program.clone(),
            program_arguments: self.program_arguments.clone(),
            provides: self.provides.clone(),
            requires: self.requires.clone(),
            run_at_load: self.run_at_load,
            keep_alive: self.keep_alive,
            state: self.state,
            last_exit_status: self.last_exit_code,
            pid: self.pid,
            standard_out_path: self.stdout_path.clone(),
            standard_error_path: self.stderr_path.clone(),
            environment_variables: self.environment.clone(),
        }
    }
}

fn open_stdio_target(path: Option<&str>) -> Result<File, Error> {
    match path {
        Some(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::from),
        // Opened read-write: this fd gets dup2'd onto the child's
        // stdout/stderr, and a read-only /dev/null makes every write()
        // there fail with EBADF.
        None => OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(Error::from),
    }
}

/// Runs in the forked child, between `fork()` and `execve()`. Must stick to
/// async-signal-safe operations only: raw syscalls, no allocation, no
/// locking — the same constraint `spawn_complex_process`'s `setsid`-only
/// hook already respects, extended here with the rest of the barrier chain.
fn pre_exec_chain(
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    gid: Option<u32>,
    uid: Option<u32>,
    umask: Option<u32>,
) -> io::Result<()> {
    if unsafe { libc::raise(libc::SIGSTOP) } != 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::dup2(stdout_fd, libc::STDOUT_FILENO) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(stderr_fd, libc::STDERR_FILENO) } == -1 {
        return Err(io::Error::last_os_error());
    }

    // Drop the group before the user: once the uid changes we may no
    // longer have permission to change gid.
    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if let Some(mask) = umask {
        unsafe {
            libc::umask(mask as libc::mode_t);
        }
    }

    close_fds_from(3);

    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn close_fds_from(start: RawFd) {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd > 0 { max_fd as RawFd } else { 1024 };
    for fd in start..max_fd {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(label: &str, program: &str) -> JobSpec {
        JobSpec {
            label: label.to_string(),
            program: program.to_string(),
            program_arguments: vec![program.to_string()],
            requires: HashSet::new(),
            provides: HashSet::new(),
            run_at_load: false,
            keep_alive: false,
            throttle_interval: 0,
            exit_timeout: default_exit_timeout(),
            standard_out_path: None,
            standard_error_path: None,
            environment_variables: HashMap::new(),
            user_name: None,
            group_name: None,
            umask: None,
        }
    }

    #[test]
    fn empty_program_is_invalid() {
        let mut s = spec("x", "/bin/true");
        s.program = String::new();
        assert!(matches!(s.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn empty_label_is_invalid() {
        let mut s = spec("x", "/bin/true");
        s.label = String::new();
        assert!(matches!(s.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn from_spec_starts_stopped_with_no_pid() {
        let job = Job::from_spec(spec("x", "/bin/true")).unwrap();
        assert_eq!(job.state, JobState::Stopped);
        assert_eq!(job.pid, None);
        assert!(!job.anonymous);
    }

    #[test]
    fn requires_subset_gates_auto_start() {
        let mut s = spec("x", "/bin/true");
        s.requires.insert("net".into());
        s.run_at_load = true;
        let job = Job::from_spec(s).unwrap();

        assert!(!job.should_auto_start(&HashSet::new()));
        let mut provided = HashSet::new();
        provided.insert("net".to_string());
        assert!(job.should_auto_start(&provided));
    }

    #[test]
    fn argv_equality_debounces_wrapper_execs() {
        let job = Job::from_spec(spec("x", "/bin/sh")).unwrap();
        assert!(job.argv_matches(&["/bin/sh".to_string()]));
        assert!(!job.argv_matches(&["/bin/sh".to_string(), "-c".to_string()]));
    }

    #[test]
    fn throttle_interval_blocks_immediate_relaunch() {
        let mut job = Job::from_spec(spec("x", "/bin/true")).unwrap();
        job.throttle_interval = 30;
        job.last_launch_at = Some(crate::timestamp::current_timestamp());
        assert!(!job.throttle_elapsed(job.last_launch_at.unwrap()));
        assert!(job.throttle_elapsed(job.last_launch_at.unwrap() + 31));
    }

    #[test]
    fn anonymous_job_label_embeds_pid() {
        let parent = Uuid::new_v4();
        let job = Job::new_anonymous(parent, 4242, 7, "sleep");
        assert!(job.label.contains("4242"));
        assert_eq!(job.parent, Some(parent));
        assert_eq!(job.state, JobState::Running);
    }
}
