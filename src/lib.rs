//! fleetd: a single-node daemon that keeps long-running agent missions in
//! pooled tmux windows, reclaims idle ones, mirrors their session titles onto
//! the windows and keeps configured repositories up to date.

pub mod config;
pub mod daemon;
pub mod log;
pub mod missions;
pub mod paths;
pub mod periodic;
pub mod pool;
pub mod reaper;
pub mod repo_update;
pub mod runner;
pub mod scanner;
pub mod store;
pub mod titles;
pub mod tmux;

#[cfg(test)]
mod testing;
