use std::time::Duration;

/// Process-wide tunables. Constructed once at `Context::init` and shared
/// (immutably, after construction) by every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum size of per-flow read buffers.
    pub rcv_buffer_size: usize,
    /// Overall DNS resolution deadline; `Timeout` if no answers arrive.
    pub dns_t1: Duration,
    /// Grace period after the first DNS answer, to let others join.
    pub dns_t2: Duration,
    /// Fixed delay before delivering a literal address as resolved.
    pub dns_literal_timeout: Duration,
    /// Cap on resolved addresses retained per resolver pair.
    pub max_num_resolved: usize,
    /// Cap on transport stacks considered per flow.
    pub max_num_proto: usize,
    /// Path to the resolver configuration file (`/etc/resolv.conf`-style).
    pub resolv_conf_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rcv_buffer_size: 1024 * 1024,
            dns_t1: Duration::from_secs(5),
            dns_t2: Duration::from_millis(500),
            dns_literal_timeout: Duration::from_millis(10),
            max_num_resolved: 16,
            max_num_proto: 8,
            resolv_conf_path: "/etc/resolv.conf".to_string(),
        }
    }
}
