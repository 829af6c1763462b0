//! Default configuration values

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# tether job manager configuration

[stream]
cwnd_size = 65536
buffer_size = 2097152
max_packet_size = 4096
read_chunk_size = 4096

[input]
reorder_timeout_ms = 50
reorder_capacity = 64

[rpc]
request_timeout_ms = 5000
exit_delay_ms = 500
signal_grace_ms = 100
token_read_timeout_ms = 5000

[daemon]
# log_file = "/tmp/tether-job.out"
"##;
