//! worker-agent — core library
//!
//! A container-local job execution agent (PID 1 of a worker container)
//! that mediates between a control plane and user-supplied worker
//! binaries: selects an execution discipline (`exec_per_job` /
//! `persistent_http`), supervises worker liveness/readiness, dispatches
//! jobs, tracks timing/status, optionally uploads result artifacts, and
//! notifies the control plane.

pub mod async_dispatch;
pub mod dispatch;
pub mod lock;
pub mod logs;
pub mod orchestrator;
pub mod paths;
pub mod platform;
pub mod reaper;
pub mod start;
pub mod state;
pub mod supervisor;
pub mod timestamp;
pub mod types;
pub mod upload;
