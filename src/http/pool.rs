use reqwest::Client;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const USER_AGENT: &str = concat!("crpt-api-client/", env!("CARGO_PKG_VERSION"));

pub fn create_http_client(config: &Config) -> Result<Client> {
    // Plain http is only reachable when explicitly configured (local stubs).
    let https_only = !config.api_url.starts_with("http://");

    let client = Client::builder()
        .use_rustls_tls()
        .tcp_nodelay(true)
        .https_only(https_only)
        .user_agent(USER_AGENT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(config.request_limit as usize)
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .build()?;

    Ok(client)
}
