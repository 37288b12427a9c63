pub mod cache;
pub mod compose;
pub mod composer;
pub mod config;
pub mod descriptor;
pub mod envfile;
pub mod error;
pub mod exec;
pub mod fragment;
pub mod guard;
pub mod identity;
pub mod io;
pub mod lifecycle;
pub mod oplog;
pub mod paths;
pub mod routing;
pub mod scratch;
pub mod shared;
pub mod webhook;

pub use error::{Result, ScratchError};
pub use identity::Identity;
pub use lifecycle::Controller;
pub use scratch::{ScratchEnvironment, ScratchState};
