use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Liveness of an in-process connection. The status only ever increases in severity, so a
///  racing disconnect from either side is never downgraded by the other.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MailboxStatus {
    Active = 0,
    EndedGraceful = 1,
    EndedError = 2,
}

/// One side of a connection between two connectors in the same process. Packets go straight
///  into the peer's queue instead of through a socket, without loss or reordering. The two
///  sides share the liveness status, which outlives whichever side lets go first.
pub struct LocalMailbox {
    outbox: UnboundedSender<Bytes>,
    inbox: UnboundedReceiver<Bytes>,
    status: Arc<AtomicU8>,
}

impl LocalMailbox {
    pub fn pair() -> (LocalMailbox, LocalMailbox) {
        let (a_send, b_recv) = unbounded_channel();
        let (b_send, a_recv) = unbounded_channel();
        let status = Arc::new(AtomicU8::new(MailboxStatus::Active.into()));

        (
            LocalMailbox { outbox: a_send, inbox: a_recv, status: status.clone() },
            LocalMailbox { outbox: b_send, inbox: b_recv, status },
        )
    }

    pub fn put_data(&self, packets: Vec<Bytes>) {
        for packet in packets {
            if self.outbox.send(packet).is_err() {
                // the peer let go of its side, which is reflected in the status
                trace!("local peer is gone - discarding outgoing packets");
                return;
            }
        }
    }

    pub fn get_data(&mut self) -> Vec<Bytes> {
        let mut result = Vec::new();
        while let Ok(packet) = self.inbox.try_recv() {
            result.push(packet);
        }
        result
    }

    pub fn status(&self) -> MailboxStatus {
        MailboxStatus::try_from(self.status.load(Ordering::Acquire))
            .unwrap_or(MailboxStatus::EndedError)
    }

    /// Raises the status to `status`, leaving a more severe status in place
    pub fn set_status(&self, status: MailboxStatus) {
        self.status.fetch_max(status.into(), Ordering::AcqRel);
    }
}
