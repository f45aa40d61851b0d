// serviced: a process-launcher and lifecycle manager. Watches kernel
// process events, maintains job state machines, enforces dependency
// ordering, tracks forked descendants as anonymous jobs, and exposes a
// query/control RPC over a local Unix socket.

pub mod config;
pub mod control_rpc;
pub mod dependency_graph;
pub mod dispatcher_client;
pub mod error;
pub mod job;
pub mod logger;
pub mod process_events;
pub mod supervisor;
pub mod timestamp;
pub mod users;
