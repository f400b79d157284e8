use serde::{Deserialize, Serialize};

/// One trade exactly as the upstream feed returns it. Price and size stay as
/// decimal strings until projection; `time` stays as the upstream ISO8601
/// text so the raw payload round-trips losslessly.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CoinbaseTrade {
    pub trade_id: u64,
    pub price: String,
    pub size: String,
    pub time: String,
    pub side: String,
}

/// A fetched page plus the pagination boundary from the `CB-AFTER` header.
#[derive(Clone, Debug, PartialEq)]
pub struct TradePage {
    pub trades: Vec<CoinbaseTrade>,
    pub next_cursor: Option<u64>,
}
