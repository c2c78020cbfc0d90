pub mod client;
pub mod exec;
pub mod genesis;
pub mod network;
pub mod node;
pub mod prelude;

pub use ixtest_core as core;
pub use ixtest_emulator as emulator;
