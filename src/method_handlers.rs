mod connect;

pub use connect::peer_connect::{ExitConnection, PeerConnect};
pub use connect::Connect;
