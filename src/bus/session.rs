//! Change notifications over the D-Bus session bus.
//!
//! Every topic maps to the object path of the same name. A payload is sent as the single byte
//! array argument of an [`SIGNAL`] signal on [`INTERFACE`], so all processes of a user session
//! receive the changes of each other. The bus routes a signal back to its sender as well.

use bytes::Bytes;
use n0_future::StreamExt;
use snafu::ResultExt;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};
use zbus::{message::Type as MessageType, names::BusName, Connection, MatchRule, MessageStream};

use super::{Bus, BusMessage, LocalBus, TOPIC_PREFIX};
use crate::error::{BusClosedSnafu, BusSnafu, Result};

/// Interface of the change signal.
pub const INTERFACE: &str = "com.google.code.AccountsSSO.Accounts";

/// Member name of the change signal.
pub const SIGNAL: &str = "AccountChanged";

/// A [`Bus`] reaching every manager of the user session, in any process.
#[derive(Debug)]
pub struct SessionBus {
    /// Fans received signals out to the subscribers of this process.
    local: LocalBus,
    outgoing: flume::Sender<(String, Bytes)>,
    _emitter: AbortOnDropHandle<()>,
    _receiver: AbortOnDropHandle<()>,
}

impl SessionBus {
    /// Connects to the session bus of the user.
    ///
    /// Returns once the connection is established and the signal subscription is in place.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::session().await.context(BusSnafu)?;
        Self::with_connection(conn).await
    }

    /// Uses an established bus connection.
    pub async fn with_connection(conn: Connection) -> Result<Self> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(INTERFACE)
            .context(BusSnafu)?
            .member(SIGNAL)
            .context(BusSnafu)?
            .path_namespace(TOPIC_PREFIX)
            .context(BusSnafu)?
            .build();
        let stream = MessageStream::for_match_rule(rule, &conn, None)
            .await
            .context(BusSnafu)?;
        debug!(unique_name = ?conn.unique_name(), "connected to session bus");

        let local = LocalBus::new();
        let (outgoing, queue) = flume::unbounded();
        let emitter = tokio::spawn(emit_signals(conn, queue));
        let receiver = tokio::spawn(forward_signals(stream, local.clone()));
        Ok(Self {
            local,
            outgoing,
            _emitter: AbortOnDropHandle::new(emitter),
            _receiver: AbortOnDropHandle::new(receiver),
        })
    }
}

impl Bus for SessionBus {
    fn emit(&self, topic: &str, payload: Bytes) -> Result<()> {
        // signals go out in order, from a single task
        self.outgoing
            .send((topic.to_string(), payload))
            .map_err(|_| BusClosedSnafu.build())
    }

    fn subscribe(&self, topics: Option<Vec<String>>) -> flume::Receiver<BusMessage> {
        self.local.subscribe(topics)
    }
}

async fn emit_signals(conn: Connection, queue: flume::Receiver<(String, Bytes)>) {
    while let Ok((topic, payload)) = queue.recv_async().await {
        let res = conn
            .emit_signal(
                None::<BusName<'_>>,
                topic.as_str(),
                INTERFACE,
                SIGNAL,
                &payload.to_vec(),
            )
            .await;
        match res {
            Ok(()) => trace!(%topic, "signal emitted"),
            Err(err) => warn!(%topic, "failed to emit change signal: {err}"),
        }
    }
}

async fn forward_signals(mut stream: MessageStream, local: LocalBus) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!("session bus error: {err}");
                continue;
            }
        };
        let header = msg.header();
        let Some(path) = header.path() else {
            continue;
        };
        let payload: Vec<u8> = match msg.body().deserialize() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%path, "dropping malformed change signal: {err}");
                continue;
            }
        };
        if let Err(err) = local.emit(path.as_str(), payload.into()) {
            warn!(%path, "failed to forward change signal: {err}");
        }
    }
    debug!("session bus stream closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::bus::{global_topic, topic_for_service_type};

    #[tokio::test]
    #[traced_test]
    #[ignore = "requires a D-Bus session bus"]
    async fn signals_reach_other_connections() -> TestResult {
        let sender = SessionBus::connect().await?;
        let receiver = SessionBus::connect().await?;
        let all = receiver.subscribe(None);
        let chat = receiver.subscribe(Some(vec![topic_for_service_type("IM")]));
        let echo = sender.subscribe(None);

        sender.emit(&topic_for_service_type("e-mail"), Bytes::from_static(b"mail"))?;
        sender.emit(&global_topic(), Bytes::from_static(b"global"))?;

        let recv = |rx: &flume::Receiver<BusMessage>| {
            let rx = rx.clone();
            async move { tokio::time::timeout(Duration::from_secs(5), rx.recv_async()).await }
        };
        let first = recv(&all).await??;
        assert_eq!(first.topic, "/ServiceType/e_2dmail");
        assert_eq!(first.payload, Bytes::from_static(b"mail"));
        assert_eq!(recv(&all).await??.payload, Bytes::from_static(b"global"));
        // the sender hears its own signals
        assert_eq!(recv(&echo).await??.payload, Bytes::from_static(b"mail"));
        assert!(chat.is_empty());
        Ok(())
    }
}
