pub mod connection;
pub mod trade;

pub use connection::{Exchange, ExchangeConnection, SyncStatus};
pub use trade::{CanonicalTrade, LeverageOverride, Side};
