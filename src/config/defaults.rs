use super::Config;
use std::path::PathBuf;

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: 900,
            poll_interval: 10,
            startup_timeout: 60,
            max_retries: 3,
            health_check_port: 80,
            health_check_path: "/health".to_string(),
            health_check_timeout: 10,
            state_dir: default_state_dir(),
            own_hostname: None,
            log_level: "info".to_string(),
            log_file: None,
            proxy_container_name: "kamal-proxy".to_string(),
            access_log_dir: None,
            state_sync_sample_rate: 5,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kamal-napper")
}
