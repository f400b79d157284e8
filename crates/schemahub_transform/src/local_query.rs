use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};

use arrow::array::{StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use regex::Regex;
use schemahub_storage::object_store::ObjectStore;
use schemahub_storage::query_service::{
    QueryOutput,
    QueryService,
    QueryServiceError,
    QueryServiceResult,
};

/// Local stand-in for the serverless columnar query service, used by dev
/// runs and tests. It understands exactly the statements the dedupe engine
/// issues (the count/distinct probe, the ROW_NUMBER rewrite and the
/// temp-table drop) and evaluates them against parquet objects in the
/// backing store. Cloud deployments wire a real [`QueryService`] instead.
pub struct LocalQueryEngine {
    store: Arc<dyn ObjectStore>,
    /// table name -> object-store prefix of its files.
    tables: Mutex<HashMap<String, String>>,
    executed: Mutex<Vec<String>>,
}

impl LocalQueryEngine {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, tables: Mutex::new(HashMap::new()), executed: Mutex::new(Vec::new()) }
    }

    pub fn register_table(&self, table: &str, prefix: &str) {
        self.tables.lock().unwrap().insert(table.to_owned(), prefix.to_owned());
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn table_prefix(&self, table: &str) -> QueryServiceResult<String> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| QueryServiceError::QueryFailed(format!("unknown table '{table}'")))
    }

    async fn read_table(&self, table: &str) -> QueryServiceResult<Vec<RecordBatch>> {
        let prefix = self.table_prefix(table)?;
        let keys = self
            .store
            .list_objects(&prefix)
            .await
            .map_err(|store_error| QueryServiceError::Backend(store_error.to_string()))?;
        let mut batches = Vec::new();
        for key in keys.iter().filter(|key| key.ends_with(".parquet")) {
            let body = self
                .store
                .get_object(key)
                .await
                .map_err(|store_error| QueryServiceError::Backend(store_error.to_string()))?
                .ok_or_else(|| QueryServiceError::Backend(format!("missing object '{key}'")))?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(body)
                .and_then(ParquetRecordBatchReaderBuilder::build)
                .map_err(|parquet_error| QueryServiceError::Backend(parquet_error.to_string()))?;
            for batch in reader {
                batches.push(
                    batch.map_err(|arrow_error| {
                        QueryServiceError::Backend(arrow_error.to_string())
                    })?,
                );
            }
        }
        Ok(batches)
    }

    async fn count_rows(&self, table: &str) -> QueryServiceResult<QueryOutput> {
        let batches = self.read_table(table).await?;
        let mut total = 0_usize;
        let mut identities = HashSet::new();
        for batch in &batches {
            total += batch.num_rows();
            for row in row_identities(batch)? {
                identities.insert(row.0);
            }
        }
        Ok(QueryOutput { rows: vec![vec![total.to_string(), identities.len().to_string()]] })
    }

    async fn rewrite_deduped(
        &self,
        target_table: &str,
        location: &str,
        source_table: &str,
    ) -> QueryServiceResult<QueryOutput> {
        let batches = self.read_table(source_table).await?;
        if batches.is_empty() {
            return Err(QueryServiceError::QueryFailed(format!(
                "source table '{source_table}' is empty"
            )));
        }
        let schema = batches[0].schema();
        let combined = concat_batches(&schema, &batches)
            .map_err(|arrow_error| QueryServiceError::Backend(arrow_error.to_string()))?;

        // ROW_NUMBER() OVER (PARTITION BY identity ORDER BY trade_ts DESC),
        // keeping rn = 1: the newest row per identity wins.
        let mut winners: HashMap<String, (u64, i64)> = HashMap::new();
        for (index, (identity, trade_ts)) in row_identities(&combined)?.into_iter().enumerate() {
            let index = u64::try_from(index).expect("row index fits in u64");
            winners
                .entry(identity)
                .and_modify(|current| {
                    if trade_ts > current.1 {
                        *current = (index, trade_ts);
                    }
                })
                .or_insert((index, trade_ts));
        }
        let mut indices: Vec<u64> = winners.into_values().map(|(index, _)| index).collect();
        indices.sort_unstable();

        let deduped = take_record_batch(&combined, &UInt64Array::from(indices))
            .map_err(|arrow_error| QueryServiceError::Backend(arrow_error.to_string()))?;

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)
            .map_err(|parquet_error| QueryServiceError::Backend(parquet_error.to_string()))?;
        writer
            .write(&deduped)
            .and_then(|_| writer.close().map(|_| ()))
            .map_err(|parquet_error| QueryServiceError::Backend(parquet_error.to_string()))?;

        let key = format!("{}dedupe-00000.parquet", location);
        self.store
            .put_object(&key, Bytes::from(buffer))
            .await
            .map_err(|store_error| QueryServiceError::Backend(store_error.to_string()))?;
        self.register_table(target_table, location);
        Ok(QueryOutput::default())
    }
}

static COUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^SELECT COUNT\(\*\) AS total_rows, COUNT\(DISTINCT [^)]+\) AS distinct_rows FROM (\w+)$",
    )
    .expect("Count pattern compiles")
});
static REWRITE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^CREATE TABLE (\w+) WITH \(external_location = 's3://[^/]*/([^']+)', format = 'PARQUET'\) AS SELECT .+ FROM \(SELECT \*, ROW_NUMBER\(\) OVER \(PARTITION BY .+ ORDER BY trade_ts DESC\) AS rn FROM (\w+)\) WHERE rn = 1$",
    )
    .expect("Rewrite pattern compiles")
});
static DROP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^DROP TABLE IF EXISTS (\w+)$").expect("Drop pattern compiles"));

#[async_trait]
impl QueryService for LocalQueryEngine {
    async fn execute(&self, sql: &str) -> QueryServiceResult<QueryOutput> {
        self.executed.lock().unwrap().push(sql.to_owned());
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(captures) = COUNT_PATTERN.captures(&normalized) {
            return self.count_rows(&captures[1]).await;
        }
        if let Some(captures) = REWRITE_PATTERN.captures(&normalized) {
            let target_table = captures[1].to_owned();
            let location = captures[2].to_owned();
            let source_table = captures[3].to_owned();
            return self.rewrite_deduped(&target_table, &location, &source_table).await;
        }
        if let Some(captures) = DROP_PATTERN.captures(&normalized) {
            self.tables.lock().unwrap().remove(&captures[1]);
            return Ok(QueryOutput::default());
        }
        Err(QueryServiceError::QueryFailed(format!("unsupported statement: {normalized}")))
    }
}

fn row_identities(batch: &RecordBatch) -> QueryServiceResult<Vec<(String, i64)>> {
    let column = |name: &str| {
        batch
            .column_by_name(name)
            .ok_or_else(|| QueryServiceError::Backend(format!("missing column '{name}'")))
    };
    let exchange = column("exchange")?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| QueryServiceError::Backend("exchange is not a string column".to_owned()))?;
    let symbol = column("symbol")?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| QueryServiceError::Backend("symbol is not a string column".to_owned()))?;
    let trade_id = column("trade_id")?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| QueryServiceError::Backend("trade_id is not a string column".to_owned()))?;
    let trade_ts = column("trade_ts")?
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| {
            QueryServiceError::Backend("trade_ts is not a microsecond timestamp".to_owned())
        })?;

    Ok((0..batch.num_rows())
        .map(|row| {
            let identity =
                format!("{}|{}|{}", exchange.value(row), symbol.value(row), trade_id.value(row));
            (identity, trade_ts.value(row))
        })
        .collect())
}
