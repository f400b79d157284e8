pub mod fake_exchange;

pub use fake_exchange::{base_trade_time, trade, FakeExchange, FetchCall};
