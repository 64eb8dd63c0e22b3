//! Channel adapter contract shared by every delivery partition.

use async_trait::async_trait;

use courier_common::error::ChannelError;
use courier_common::types::Channel;
use courier_engine::notifications::Notification;

/// Sends one notification on one channel and classifies the outcome.
///
/// Workers may invoke an adapter more than once for the same notification
/// (a lease can expire mid-send), so implementations must tolerate repeats.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;
}
