pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use traits::{LogStorage, StateMachineStore};
pub use types::{LogState, Snapshot};
