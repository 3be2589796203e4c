use crate::AccountRef;

pub fn default_fee_account() -> AccountRef {
    AccountRef {
        user_id: 1,
        sub_account: 0,
    }
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_metrics_port() -> u16 {
    9090
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_http_port() -> u16 {
    8080
}

pub fn default_request_timeout_ms() -> u64 {
    30_000
}

pub fn default_storage_type() -> String {
    "memory".to_string()
}

pub fn default_postgres_port() -> u16 {
    5432
}

pub fn default_ssl_mode() -> String {
    "require".to_string()
}

pub fn default_max_connections() -> u32 {
    20
}

pub fn default_connection_timeout() -> u64 {
    30
}

pub fn default_idle_timeout() -> u64 {
    600
}

pub fn default_log_type() -> String {
    "memory".to_string()
}

pub fn default_redis_port() -> u16 {
    6379
}

pub fn default_key_prefix() -> String {
    "spotx".to_string()
}

pub fn default_wallet_poll_ms() -> u64 {
    500
}

pub fn default_command_buffer() -> usize {
    1024
}

pub fn default_event_buffer() -> usize {
    4096
}

pub fn default_terminated_cache_size() -> usize {
    100_000
}

pub fn default_depth_levels() -> usize {
    50
}

pub fn default_projection_retries() -> u32 {
    5
}

pub fn default_projection_backoff_ms() -> u64 {
    100
}

pub fn default_cancel_timeout_ms() -> u64 {
    10_000
}

pub fn default_cancel_attempts() -> u32 {
    3
}

pub fn default_cancel_budget_ms() -> u64 {
    10_000
}

pub fn default_history_window() -> usize {
    10_000
}

pub fn default_market_buy_buffer_bps() -> u64 {
    500
}

pub fn default_maker_bps() -> u64 {
    10
}

pub fn default_taker_bps() -> u64 {
    20
}

pub fn default_zero() -> String {
    "0".to_string()
}
