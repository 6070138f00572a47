//! A keepalive watchdog for supervised processes.
//!
//! The `terminal-keepalive` binary lowers its own CPU and I/O priority, then
//! reads liveness pings from stdin, one byte at a time. Each byte re-arms a
//! `timeout`-second alarm; when the pings stop the alarm's default action
//! kills the process, and when stdin closes it exits with status 1.
//!
//! [`supervisor`] is the parent side: it spawns the watchdog and feeds it.

pub mod config;
pub mod priority;
pub mod signals;
pub mod supervisor;
pub mod watchdog;
