use tokio::sync::broadcast;

/// A write observed on a context's local store.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<String>,
}

/// Storage-change pub/sub scoped to one execution context.
#[derive(Debug, Clone)]
pub struct StorageChannel {
    tx: broadcast::Sender<StorageChange>,
}

impl Default for StorageChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StorageChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns how many subscribers saw the change; zero is not an error.
    pub fn publish(&self, key: &str, new_value: Option<&str>) -> usize {
        let change = StorageChange {
            key: key.to_string(),
            new_value: new_value.map(str::to_string),
        };
        self.tx.send(change).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let channel = StorageChannel::default();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        assert_eq!(channel.publish("extensionJobData", Some("{}")), 2);

        let got = a.recv().await.unwrap();
        assert_eq!(got.key, "extensionJobData");
        assert_eq!(got.new_value.as_deref(), Some("{}"));
        assert_eq!(b.recv().await.unwrap(), got);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let channel = StorageChannel::default();
        assert_eq!(channel.publish("k", None), 0);
    }
}
