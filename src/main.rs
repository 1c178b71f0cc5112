use std::time::Duration;

use tonga::{TongaClient, TongaOptions};

#[tokio::main]
async fn main() {
    let server_url =
        std::env::var("TONGA_SERVER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());

    let mut client = TongaClient::builder(server_url)
        .context_attribute("user", "demo user")
        .request_attribute("source", "tonga-demo")
        .options(TongaOptions {
            retries: 2,
            retry_delay: Duration::from_millis(500),
            analytics_report_interval: Duration::from_secs(5),
            ..TongaOptions::default()
        })
        .build()
        .unwrap();

    println!("{:?}", client.get("demo_flag").await);
    // Second call is served from the cache.
    println!("{:?}", client.get("demo_flag").await);

    println!("state: {:?}", client.dump_state());

    // Flushes the two resolutions counted above.
    client.close().await;
}
