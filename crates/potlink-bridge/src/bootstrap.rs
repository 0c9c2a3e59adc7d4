use potlink::topic;

use tracing::{info, warn};

use crate::collaborators::DeviceRegistry;
use crate::error::Result;
use crate::transport::Transport;

/// Subscribes to the `sensors` and `data` topics of every known device.
///
/// Topics already subscribed are skipped, so the function can be called
/// again whenever the registry changes. Returns the number of new
/// subscriptions.
///
/// # Errors
///
/// An error is returned when the registry cannot be read or a subscription
/// fails. Subscriptions made before the failure are kept.
pub async fn subscribe_devices(
    devices: &dyn DeviceRegistry,
    transport: &dyn Transport,
) -> Result<usize> {
    let device_ids = devices.device_ids().await?;

    if device_ids.is_empty() {
        warn!("No devices registered, no topics to subscribe to");
        return Ok(0);
    }

    let mut subscribed = 0;
    for device_id in &device_ids {
        for filter in [topic::sensors(device_id), topic::data(device_id)] {
            if transport.subscribe(&filter).await? {
                subscribed += 1;
            }
        }
    }

    info!(
        "Subscribed to {subscribed} new topics for {} devices",
        device_ids.len()
    );
    Ok(subscribed)
}
