pub mod codec;
pub(crate) mod session;

pub(crate) use session::{
    Alert, AlertReceiver, AlertSender, Command, HaveReceiver, HaveSender,
    PeerSession, Receiver, Sender,
};
