use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Booking, BookingStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Created,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl NoticeKind {
    /// The notice a transition into `status` emits. A booking never moves
    /// back to pending, so that status has none.
    pub fn for_status(status: BookingStatus) -> Option<Self> {
        match status {
            BookingStatus::Pending => None,
            BookingStatus::Confirmed => Some(NoticeKind::Confirmed),
            BookingStatus::Completed => Some(NoticeKind::Completed),
            BookingStatus::Cancelled => Some(NoticeKind::Cancelled),
            BookingStatus::NoShow => Some(NoticeKind::NoShow),
        }
    }
}

/// A committed booking change, fanned out to whoever listens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingNotice {
    pub kind: NoticeKind,
    pub booking: Booking,
}

/// Broadcast hub for booking notices, one channel per workspace plus a feed
/// carrying every workspace.
///
/// Sending never blocks the committing request: with no receiver the notice is
/// dropped, and a slow receiver lags instead of applying back-pressure.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
    all: broadcast::Sender<BookingNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one workspace. Creates the channel if needed.
    pub fn subscribe(&self, workspace_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        self.channels
            .entry(workspace_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingNotice> {
        self.all.subscribe()
    }

    pub fn send(&self, kind: NoticeKind, booking: &Booking) {
        let notice = BookingNotice {
            kind,
            booking: booking.clone(),
        };
        if let Some(sender) = self.channels.get(&booking.workspace_id) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }

    pub fn remove(&self, workspace_id: &Ulid) {
        self.channels.remove(workspace_id);
    }
}

/// Log every notice as one JSON line until the hub goes away.
pub async fn log_notices(mut rx: broadcast::Receiver<BookingNotice>) {
    loop {
        match rx.recv().await {
            Ok(notice) => match serde_json::to_string(&notice) {
                Ok(json) => info!(target: "slotkeep::notice", "{json}"),
                Err(e) => warn!(error = %e, "unencodable booking notice"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notice logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(workspace_id: Ulid) -> Booking {
        Booking {
            id: Ulid::new(),
            workspace_id,
            service_type_id: Ulid::new(),
            contact_id: Ulid::new(),
            scheduled_at: 2_000_000_000_000,
            duration_minutes: 30,
            status: BookingStatus::Pending,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn workspace_subscriber_sees_only_its_workspace() {
        let hub = NotifyHub::new();
        let ws = Ulid::new();
        let mut rx = hub.subscribe(ws);

        hub.send(NoticeKind::Created, &booking(Ulid::new()));
        let mine = booking(ws);
        hub.send(NoticeKind::Created, &mine);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.booking, mine);
        assert_eq!(received.kind, NoticeKind::Created);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn global_feed_sees_everything() {
        let hub = NotifyHub::new();
        let mut all = hub.subscribe_all();
        hub.send(NoticeKind::Created, &booking(Ulid::new()));
        hub.send(NoticeKind::Cancelled, &booking(Ulid::new()));
        assert_eq!(all.recv().await.unwrap().kind, NoticeKind::Created);
        assert_eq!(all.recv().await.unwrap().kind, NoticeKind::Cancelled);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(NoticeKind::Confirmed, &booking(Ulid::new()));
    }

    #[test]
    fn notice_json_shape() {
        let notice = BookingNotice {
            kind: NoticeKind::NoShow,
            booking: booking(Ulid::new()),
        };
        let value: serde_json::Value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["kind"], "no_show");
        assert_eq!(value["booking"]["status"], "pending");
    }

    #[test]
    fn pending_has_no_notice() {
        assert_eq!(NoticeKind::for_status(BookingStatus::Pending), None);
        assert_eq!(
            NoticeKind::for_status(BookingStatus::NoShow),
            Some(NoticeKind::NoShow)
        );
    }
}
