//! "Dial this number" requests from anywhere in the application.
//!
//! A single-slot broadcast: a request reaches whoever is listening at the
//! moment it is sent, the newest request overwrites an unread older one, and
//! nothing is kept when no listener exists.

use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub number: String,
}

#[derive(Debug, Clone)]
pub struct DialChannel {
    tx: broadcast::Sender<DialRequest>,
}

impl DialChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        DialChannel { tx }
    }

    /// Returns whether any listener was mounted to receive the request.
    pub fn dial_number(&self, number: impl Into<String>) -> bool {
        let request = DialRequest {
            number: number.into(),
        };
        match self.tx.send(request) {
            Ok(listeners) => {
                debug!("Dial request delivered to {} listener(s)", listeners);
                true
            }
            Err(broadcast::error::SendError(request)) => {
                debug!("Dial request for {} dropped, no listener mounted", request.number);
                false
            }
        }
    }

    pub fn subscribe(&self) -> DialListener {
        DialListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for DialChannel {
    fn default() -> Self {
        Self::new()
    }
}

// Unmounting is dropping the listener
#[derive(Debug)]
pub struct DialListener {
    rx: broadcast::Receiver<DialRequest>,
}

impl DialListener {
    /// Waits for the next request. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<DialRequest> {
        loop {
            match self.rx.recv().await {
                Ok(request) => return Some(request),
                // Older requests were overwritten; the newest is next in line
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Latest pending request, if one arrived since the last read.
    pub fn try_recv(&mut self) -> Option<DialRequest> {
        loop {
            match self.rx.try_recv() {
                Ok(request) => return Some(request),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_listener_drops_request() {
        let channel = DialChannel::new();
        assert!(!channel.dial_number("1001"));

        let mut listener = channel.subscribe();
        assert_eq!(listener.try_recv(), None, "requests are not persisted");
    }

    #[test]
    fn test_last_request_wins() {
        let channel = DialChannel::new();
        let mut listener = channel.subscribe();

        assert!(channel.dial_number("1001"));
        assert!(channel.dial_number("1002"));
        assert!(channel.dial_number("1003"));

        assert_eq!(
            listener.try_recv(),
            Some(DialRequest {
                number: "1003".to_string()
            })
        );
        assert_eq!(listener.try_recv(), None);
    }

    #[test]
    fn test_unmounted_listener_stops_receiving() {
        let channel = DialChannel::new();
        let listener = channel.subscribe();
        assert_eq!(channel.listener_count(), 1);

        drop(listener);
        assert_eq!(channel.listener_count(), 0);
        assert!(!channel.dial_number("1001"));
    }

    #[tokio::test]
    async fn test_clones_share_the_slot() {
        let contacts_side = DialChannel::new();
        let dialer_side = contacts_side.clone();
        let mut listener = dialer_side.subscribe();

        let task = tokio::spawn(async move { listener.recv().await });
        tokio::task::yield_now().await;
        assert!(contacts_side.dial_number("5551234"));

        let request = task.await.unwrap();
        assert_eq!(request.map(|r| r.number), Some("5551234".to_string()));
    }
}
