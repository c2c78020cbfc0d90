//! In-memory stand-ins for everything the harness talks to: the container
//! runtime, the node toolchain, the ledgers and the wallet daemons.

pub mod keys;
pub mod ledger;
pub mod sandbox;
pub mod toolchain;
pub mod wallet;

pub use keys::KeySeed;
pub use ledger::{relay_once, spawn_relayer, EmulatedLedger};
pub use sandbox::{Sandbox, SandboxCall, SandboxFault};
pub use wallet::{EmulatedConnector, EmulatedWallet};
