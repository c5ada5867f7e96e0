use std::time::Duration;

use tracing::{error, info, warn};

/// Poll the Telepresence client on the other end of the tunnel:
/// - logging periodically keeps `kubectl logs` from going idle,
/// - the traffic keeps `kubectl port-forward` from going idle,
/// - a failed request is the hint that the local side died.
pub async fn poll_client() {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client builder with static options");
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    loop {
        ticker.tick().await;
        match client.head("http://localhost:9055/").send().await {
            Ok(response) if response.status().as_u16() == 200 => info!("Checkpoint"),
            Ok(response) => warn!("Client returned code {}", response.status().as_u16()),
            Err(exc) => {
                error!("Failed to contact Telepresence client:");
                error!("{}", exc);
                warn!("Perhaps it's time to exit?");
            }
        }
    }
}
