//! Identify: on every new session each side asks the other for its
//! [`PeerRecord`] and learns the address it was seen from.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{Node, NodeEvent};
use crate::{
    routing::{PeerRecord, RecordSource},
    transport::{PeerStream, Session},
    wire, Error,
};

pub const IDENTIFY_PROTOCOL: &str = "/bethrou/identify/1.0.0";
pub const AGENT: &str = concat!("bethrou/", env!("CARGO_PKG_VERSION"));

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub record: PeerRecord,
    /// The requester's address as the responder sees it. `None` over a
    /// relayed session.
    pub observed_addr: Option<SocketAddr>,
    pub agent: String,
}

pub(crate) fn serve(node: Node) {
    let mut incoming = node.accept(IDENTIFY_PROTOCOL);
    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let info = IdentifyInfo {
                record: node.local_record(),
                observed_addr: stream.remote_addr(),
                agent: AGENT.to_string(),
            };
            tokio::spawn(answer(stream, info));
        }
    });
}

async fn answer(mut stream: PeerStream, info: IdentifyInfo) {
    let peer = stream.remote_peer();
    let result = async {
        wire::write_message(&mut stream, &info).await?;
        stream.shutdown().await
    }
    .await;
    if let Err(err) = result {
        debug!(%peer, %err, "identify answer failed");
    }
}

async fn request(session: &Session) -> Result<IdentifyInfo, Error> {
    let mut stream = session.open_stream(IDENTIFY_PROTOCOL).await?;
    stream.shutdown().await?;
    Ok(wire::read_message(&mut stream).await?)
}

/// Asks the remote of `session` who it is and records the answer.
pub(crate) async fn exchange(node: Node, session: Session) {
    let peer = session.remote_peer();
    let info = match tokio::time::timeout(IDENTIFY_TIMEOUT, request(&session)).await {
        Ok(Ok(info)) => info,
        Ok(Err(err)) => {
            debug!(%peer, %err, "identify failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "identify timed out");
            return;
        }
    };
    if info.record.peer_id != peer {
        warn!(%peer, claimed = %info.record.peer_id, "identify record names another peer");
        return;
    }
    debug!(
        %peer,
        agent = %info.agent,
        addrs = info.record.addrs.len(),
        exit = info.record.roles.exit,
        relay = info.record.roles.relay,
        "identified peer"
    );
    node.registry().upsert(info.record, RecordSource::Identify);
    if !session.is_relayed() {
        if let Some(observed) = info.observed_addr {
            node.nat().record_observed(observed);
        }
    }
    node.emit(NodeEvent::Identified { peer });
}
