//! Best-effort user notifications. A failed send is logged and otherwise
//! ignored — nothing in the trade lifecycle blocks on a notification
//! succeeding. Telegram delivery itself is out of scope; `TelegramNotifier`
//! only implements the contract so the executor and trade manager have a
//! real trigger point to call into.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: uuid::Uuid, message: &str);
}

pub struct TelegramNotifier {
    bot_token: Option<String>,
}

impl TelegramNotifier {
    pub fn new(bot_token: Option<String>) -> Self {
        Self { bot_token }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_id: uuid::Uuid, message: &str) {
        if self.bot_token.is_none() {
            warn!(%user_id, message, "telegram notifier has no bot token configured, dropping");
            return;
        }
        // Wire delivery is intentionally unimplemented; callers only depend
        // on this trait's trigger points, not on messages actually arriving.
        warn!(%user_id, message, "telegram delivery not implemented, dropping");
    }
}

pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _user_id: uuid::Uuid, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_notifier_never_panics() {
        NullNotifier.notify(uuid::Uuid::new_v4(), "test").await;
    }
}
