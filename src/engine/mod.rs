//! Settlement engine: pricing, fees, trade execution, serialization.

pub mod executor;
pub mod fees;
pub mod keys;
pub mod lmsr;
pub mod locks;
pub mod queue;

pub use executor::{BuyOutcome, ClaimOutcome, SellOutcome, TradeExecutor};
pub use fees::{FeeRates, FeeSplit};
pub use locks::LockManager;
pub use queue::TradeQueue;
