pub mod checkpoint;
pub mod kv_store;
pub mod object_store;
#[cfg(test)]
mod object_store_test;
pub mod query_service;
