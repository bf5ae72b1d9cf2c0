//! Session runtime: ports, processes, servers, ordering and the runner

pub mod dependency;
pub mod ports;
pub mod process;
pub mod runner;
pub mod server;
pub mod signals;

pub use dependency::*;
pub use ports::*;
pub use process::*;
pub use runner::*;
pub use server::*;
pub use signals::*;
