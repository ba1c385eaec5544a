//! The reload WebSocket endpoint. Every connected browser tab gets its own subscription and is
//! sent a `reload` text frame whenever a watch session published.

use color_eyre::eyre::Result;
use tracing::{debug, trace};

use crate::{
    broadcast::{Broadcaster, Subscription},
    protocol::{Channel, Frame, ProtocolError, SocketCommand, SocketEvent},
};

/// Text of the frame that tells a client to reload.
pub const RELOAD_MESSAGE: &str = "reload";

pub(super) async fn serve(
    channel: Channel<SocketEvent, SocketCommand>,
    broadcaster: &Broadcaster,
) -> Result<()> {
    match channel.recv().await {
        Ok(SocketEvent::Connect) => {}
        Ok(SocketEvent::Disconnect { .. }) | Err(ProtocolError::Disconnected) => {
            debug!("reload client left before connecting");
            return Ok(());
        }
        Ok(event) => return Err(ProtocolError::UnexpectedSocketEvent(event).into()),
        Err(e) => return Err(e.into()),
    }

    let subscription = broadcaster.subscribe();
    channel.send(SocketCommand::Accept).await?;
    debug!(clients = broadcaster.subscriber_count(), "reload client connected");

    tokio::select! {
        res = forward(subscription, &channel) => res?,
        () = drain(&channel) => {}
    }

    debug!("reload client disconnected");
    Ok(())
}

/// Send a reload frame for every published event. Ends when the client side hung up.
async fn forward(
    mut subscription: Subscription,
    channel: &Channel<SocketEvent, SocketCommand>,
) -> Result<(), ProtocolError> {
    while subscription.recv().await.is_some() {
        match channel
            .send(SocketCommand::Send(Frame::Text(RELOAD_MESSAGE.to_owned())))
            .await
        {
            Ok(()) => trace!("sent reload frame"),
            Err(ProtocolError::Disconnected) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Discard whatever the client sends, until it disconnects.
async fn drain(channel: &Channel<SocketEvent, SocketCommand>) {
    loop {
        match channel.recv().await {
            Ok(SocketEvent::Receive(frame)) => trace!(?frame, "ignoring client message"),
            Ok(SocketEvent::Disconnect { code }) => {
                trace!(code, "client closed the connection");
                break;
            }
            Ok(SocketEvent::Connect) => {}
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::protocol::channel;

    #[tokio::test]
    async fn accepts_and_forwards_reloads() {
        let broadcaster = Broadcaster::new();
        let (app, host) = channel();
        let task = tokio::spawn({
            let broadcaster = broadcaster.clone();
            async move { serve(app, &broadcaster).await }
        });

        host.send(SocketEvent::Connect).await.unwrap();
        assert_eq!(SocketCommand::Accept, host.recv().await.unwrap());
        assert_eq!(1, broadcaster.subscriber_count());

        host.send(SocketEvent::Receive(Frame::Text("ping".to_owned())))
            .await
            .unwrap();
        assert_eq!(1, broadcaster.publish());
        assert_eq!(
            SocketCommand::Send(Frame::Text("reload".to_owned())),
            host.recv().await.unwrap()
        );

        host.send(SocketEvent::Disconnect { code: 1001 })
            .await
            .unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(0, broadcaster.subscriber_count());
        assert_eq!(None, host.try_recv(), "nothing sent after the disconnect");
    }

    #[tokio::test]
    async fn idle_socket_gets_no_frames() {
        let broadcaster = Broadcaster::new();
        let (app, host) = channel();
        let task = tokio::spawn({
            let broadcaster = broadcaster.clone();
            async move { serve(app, &broadcaster).await }
        });

        host.send(SocketEvent::Connect).await.unwrap();
        assert_eq!(SocketCommand::Accept, host.recv().await.unwrap());

        assert!(time::timeout(Duration::from_millis(200), host.recv())
            .await
            .is_err());

        drop(host);
        task.await.unwrap().unwrap();
        assert_eq!(0, broadcaster.subscriber_count());
    }

    #[tokio::test]
    async fn disconnect_before_connect() {
        let broadcaster = Broadcaster::new();
        let (app, host) = channel();

        host.send(SocketEvent::Disconnect { code: 1006 })
            .await
            .unwrap();
        serve(app, &broadcaster).await.unwrap();

        assert_eq!(None, host.try_recv());
        assert_eq!(0, broadcaster.subscriber_count());
    }

    #[tokio::test]
    async fn message_before_connect_is_rejected() {
        let (app, host) = channel();

        host.send(SocketEvent::Receive(Frame::Binary(vec![1].into())))
            .await
            .unwrap();
        let err = serve(app, &Broadcaster::new()).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedSocketEvent(_))
        ));
    }
}
