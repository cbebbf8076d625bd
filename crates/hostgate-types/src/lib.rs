pub mod address;
pub mod event;
pub mod gateway;
pub mod install;
pub mod update;

pub use address::*;
pub use event::*;
pub use gateway::*;
pub use install::*;
pub use update::*;
