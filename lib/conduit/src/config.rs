use serde_derive::Deserialize;

/// Per-channel tuning knobs. Deployments load these from JSON; every field
/// falls back to its default when omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Chunk size the channel expects from its pool.
    pub chunk_size: usize,
    /// Upper bound on a single decoded frame payload.
    pub max_frame_size: usize,
    /// Upper bound on a single decoded header name or value.
    pub max_header_size: usize,
    /// Initial HPACK dynamic table size.
    pub header_table_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> ChannelConfig {
        ChannelConfig {
            chunk_size: crate::buffer::DEFAULT_CHUNK_SIZE,
            max_frame_size: 1 << 20,
            max_header_size: 8192,
            header_table_size: 4096,
        }
    }
}

/// Listener-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Bind address in `<ip>:<port>` form.
    pub address: String,
    /// Channels idle longer than this are disconnected by housekeeping.
    pub idle_timeout_secs: u64,
    pub channel: ChannelConfig,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            address: "127.0.0.1:0".to_string(),
            idle_timeout_secs: 30,
            channel: ChannelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: EndpointConfig =
            serde_json::from_str(r#"{"address": "0.0.0.0:9000", "channel": {"chunk_size": 1024}}"#)
                .unwrap();

        assert_eq!(config.address, "0.0.0.0:9000");
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.channel.chunk_size, 1024);
        assert_eq!(config.channel.max_header_size, 8192);
    }

    #[test]
    fn test_empty_object_is_all_defaults() {
        let config: ChannelConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.chunk_size, crate::buffer::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.header_table_size, 4096);
    }
}
