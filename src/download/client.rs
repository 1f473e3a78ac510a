use std::time::Duration;

use reqwest::Client;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub max_idle_per_host: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("kfetch/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(15),
            max_redirects: 10,
            max_idle_per_host: 16,
        }
    }
}

/// Builds the transport shared by every segment a scheduler launches.
///
/// No overall request timeout is set: a body may legitimately stream for a long
/// time, and stalls are detected per chunk by the scheduler instead.
pub fn build_client(options: &ClientOptions) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(options.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(options.max_redirects))
        .connect_timeout(options.connect_timeout)
        .pool_max_idle_per_host(options.max_idle_per_host)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_nodelay(true)
        .build()
}
