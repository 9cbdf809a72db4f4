// Session reconciliation: backend token exchange and the session bridge

mod bridge;
mod exchange;

pub use bridge::{BridgeHandle, SessionBridge, SessionState};
pub use exchange::{ExchangeError, TokenExchange};
