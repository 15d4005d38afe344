//! Broker counters
//!
//! - `broker_cache_lookups_total` (counter): label `result` = `hit` | `refresh` | `login_required`
//! - `broker_refresh_total` (counter): label `result` = `success` | `invalid_grant` | `consent_required` | `error`
//! - `broker_obo_exchanges_total` (counter): label `result` = `success` | `consent_required` | `error`
//! - `broker_store_writes_total` (counter)
//!
//! Without an installed recorder these are no-ops.

pub fn record_cache_lookup(result: &'static str) {
    metrics::counter!("broker_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_refresh(result: &'static str) {
    metrics::counter!("broker_refresh_total", "result" => result).increment(1);
}

pub fn record_obo(result: &'static str) {
    metrics::counter!("broker_obo_exchanges_total", "result" => result).increment(1);
}

pub fn record_store_write() {
    metrics::counter!("broker_store_writes_total").increment(1);
}
