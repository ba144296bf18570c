use tokio::sync::broadcast;
use tracing::trace;

use crate::discovery::peer_id::PeerId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerEvent {
    /// the peer became active, either for the first time or after having departed
    Appeared(PeerAppearedData),
    /// an active peer announced changed attributes
    Changed(PeerChangedData),
    /// the peer said goodbye or was not heard from for too long
    Departed(PeerDepartedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAppearedData {
    pub peer: PeerId,
    /// `true` if the peer's profile version differs from the last one we saw, so higher layers
    ///  should re-fetch whatever they derive from it
    pub profile_changed: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerChangedData {
    pub peer: PeerId,
    pub profile_changed: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerDepartedData {
    pub peer: PeerId,
    /// `false` for an explicit bye, `true` if the departure was detected locally
    pub timed_out: bool,
}

pub struct PeerEventNotifier {
    sender: broadcast::Sender<PeerEvent>,
}
impl PeerEventNotifier {
    pub fn new() -> PeerEventNotifier {
        let (sender, _) = broadcast::channel(128);

        PeerEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: PeerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for PeerEventNotifier {
    fn default() -> Self {
        PeerEventNotifier::new()
    }
}
