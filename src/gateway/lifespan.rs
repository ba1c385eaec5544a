//! Lifespan handling. The gateway starts and stops its watch sessions around the wrapped
//! application's own startup and shutdown, relaying events and replies between host and app.

use color_eyre::eyre::Result;
use tracing::{debug, warn};

use super::ReloadGateway;
use crate::protocol::{
    self, Application, Channel, Exchange, LifespanEvent, LifespanExchange, LifespanReply,
};

pub(super) async fn pump<A: Application>(
    gateway: &ReloadGateway<A>,
    host: Channel<LifespanEvent, LifespanReply>,
) -> Result<()> {
    let (app_side, gateway_side) = protocol::channel();

    let (relayed, called) = tokio::join!(
        relay(gateway, &host, gateway_side),
        gateway
            .app
            .call(Exchange::Lifespan(LifespanExchange { channel: app_side })),
    );

    relayed?;
    called
}

async fn relay<A: Application>(
    gateway: &ReloadGateway<A>,
    host: &Channel<LifespanEvent, LifespanReply>,
    app: Channel<LifespanReply, LifespanEvent>,
) -> Result<()> {
    let mut app = Some(app);

    while let Ok(event) = host.recv().await {
        let res = match event {
            LifespanEvent::Startup => gateway.startup().await,
            LifespanEvent::Shutdown => gateway.shutdown().await,
        };

        if let Err(e) = res {
            host.send(LifespanReply::failed(event, format!("{e:#}")))
                .await?;
            return Err(e);
        }

        let reply = match &app {
            Some(channel) => ask(channel, event).await,
            None => None,
        };
        let reply = reply.unwrap_or_else(|| {
            if app.take().is_some() {
                debug!("application doesn't handle lifespan events");
            }
            LifespanReply::complete(event)
        });

        if let LifespanReply::StartupFailed { message } = &reply {
            warn!(%message, "application failed to start, stopping file watching");
            gateway.shutdown().await.ok();
        }

        host.send(reply).await?;

        if event == LifespanEvent::Shutdown {
            break;
        }
    }

    debug!("lifespan finished");
    Ok(())
}

/// Forward an event to the app and wait for its reply. `None` if the app stopped listening.
async fn ask(
    app: &Channel<LifespanReply, LifespanEvent>,
    event: LifespanEvent,
) -> Option<LifespanReply> {
    app.send(event).await.ok()?;
    app.recv().await.ok()
}
