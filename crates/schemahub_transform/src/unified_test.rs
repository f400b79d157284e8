use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::json;
use uuid::Uuid;

use crate::unified::{
    parquet_column_names,
    parquet_to_records,
    project_raw,
    records_to_parquet,
    unified_object_key,
    ProjectionError,
    UnifiedRecord,
    UNIFIED_COLUMNS,
};

fn record(trade_id: &str) -> UnifiedRecord {
    UnifiedRecord {
        exchange: "coinbase".to_owned(),
        symbol: "BTC-USD".to_owned(),
        trade_id: trade_id.to_owned(),
        side: "buy".to_owned(),
        price: 50_000.5,
        quantity: 0.25,
        trade_ts: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

#[test]
fn raw_line_projects_onto_the_unified_schema() {
    let raw = json!({
        "trade_id": "42",
        "product_id": "BTC-USD",
        "price": 50000.5,
        "size": 0.25,
        "time": "2026-03-01T12:00:07.000000Z",
        "side": "BUY",
        "_source": "coinbase",
        "_raw_payload": "{}",
    });

    let unified = project_raw(&raw).unwrap();
    assert_eq!(unified.exchange, "coinbase");
    assert_eq!(unified.symbol, "BTC-USD");
    assert_eq!(unified.trade_id, "42");
    assert_eq!(unified.side, "buy");
    assert_eq!(unified.price, 50000.5);
    assert_eq!(unified.quantity, 0.25);
    assert_eq!(unified.trade_ts, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 7).unwrap());
}

#[test]
fn id_takes_precedence_and_numeric_ids_become_strings() {
    let raw = json!({
        "id": 7,
        "trade_id": "ignored",
        "product_id": "ETH-USD",
        "price": "1800.25",
        "size": "1.5",
        "time": "2026-03-01T00:00:00Z",
        "side": "sell",
    });
    let unified = project_raw(&raw).unwrap();
    assert_eq!(unified.trade_id, "7");
    assert_eq!(unified.price, 1800.25);
    assert_eq!(unified.quantity, 1.5);
}

#[rstest]
#[case::numeric(json!(1_750_000_000))]
#[case::text(json!("1750000000"))]
fn epoch_second_timestamps_are_accepted(#[case] time_value: serde_json::Value) {
    let raw = json!({
        "trade_id": "1",
        "product_id": "BTC-USD",
        "price": 1.0,
        "size": 1.0,
        "time": time_value,
        "side": "buy",
    });
    let unified = project_raw(&raw).unwrap();
    assert_eq!(unified.trade_ts.timestamp(), 1_750_000_000);
}

#[test]
fn missing_symbol_is_rejected() {
    let raw = json!({"trade_id": "1", "price": 1.0, "size": 1.0, "time": "2026-01-01T00:00:00Z", "side": "buy"});
    assert_matches!(project_raw(&raw).unwrap_err(), ProjectionError::MissingField("product_id"));
}

#[test]
fn garbage_price_is_rejected() {
    let raw = json!({
        "trade_id": "1",
        "product_id": "BTC-USD",
        "price": "not a price",
        "size": 1.0,
        "time": "2026-01-01T00:00:00Z",
        "side": "buy",
    });
    assert_matches!(
        project_raw(&raw).unwrap_err(),
        ProjectionError::WrongType { field: "price", .. }
    );
}

#[test]
fn parquet_round_trips_records_and_column_order() {
    let records = vec![record("1"), record("2"), record("3")];
    let bytes = records_to_parquet(&records).unwrap();

    let column_names = parquet_column_names(bytes.clone()).unwrap();
    assert_eq!(column_names, UNIFIED_COLUMNS.map(str::to_owned).to_vec());

    let round_tripped = parquet_to_records(bytes).unwrap();
    assert_eq!(round_tripped, records);
}

#[test]
fn unified_key_matches_the_fixed_layout() {
    let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let run_id = Uuid::nil();
    let key = unified_object_key("schemahub/unified_trades", 2, ts, run_id, 500_000);
    assert_eq!(
        key,
        format!("schemahub/unified_trades/v2/unified_trades_20260301T120000Z_{run_id}_500000.parquet")
    );
}
