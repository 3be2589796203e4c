//! Topic names on the durable log

/// Consumer-facing record of persisted order and trade ids
pub const SYNC_DATA: &str = "sync_data";

/// Commands to the wallet collaborator
pub const WALLET_COMMANDS: &str = "wallet_commands";

/// Deposit and withdrawal outcomes from the wallet collaborator
pub const WALLET_EVENTS: &str = "wallet_events";

/// Commands into a market engine
pub fn orders(market_id: &str) -> String {
    format!("orders.{}", market_id)
}

/// Events out of a market engine
pub fn events(market_id: &str) -> String {
    format!("events.{}", market_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_topics() {
        assert_eq!(orders("btcusdt"), "orders.btcusdt");
        assert_eq!(events("btcusdt"), "events.btcusdt");
    }
}
