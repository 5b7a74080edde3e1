use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use bytes::Buf;
use tracing::{info, span, Level};
use rigelnet::client::Client;
use rigelnet::config::RigelNetConfig;
use rigelnet::handler::{HandlerId, HandlerRegistry};
use rigelnet::server::Server;
use rigelnet::socket::SocketAdapter;

const PING: HandlerId = 1;
const PONG: HandlerId = 2;
const NUM_ROUND_TRIPS: u32 = 10;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        // .with_max_level(Level::TRACE)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let mut server = Server::new(RigelNetConfig::default_ipv4("ping-pong"), SocketAdapter::udp(None), 4)?;
    server.start_on(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100)?;

    let mut client = Client::new(RigelNetConfig::default_ipv4("ping-pong"), SocketAdapter::udp(None))?;
    client.connect(0, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100))?;

    let mut server_handlers = HandlerRegistry::default();
    server_handlers.register(PING, |ctx, args| {
        let counter = args.try_get_u32()?;
        info!("client {:?} sent ping #{}", ctx.client_index(), counter);
        ctx.send_message(PONG, &counter.to_be_bytes());
        Ok(())
    })?;

    let mut client_handlers = HandlerRegistry::default();
    client_handlers.register(PONG, |ctx, args| {
        let counter = args.try_get_u32()?;
        info!("pong #{} after {:?}", counter, ctx.remote_info().mean_latency);
        if counter < NUM_ROUND_TRIPS {
            ctx.send_message(PING, &(counter + 1).to_be_bytes());
        }
        else {
            ctx.disconnect(true, "done");
        }
        Ok(())
    })?;

    let mut ping_sent = false;
    let mut interval = tokio::time::interval(Duration::from_millis(10));
    for _ in 0..1000 {
        interval.tick().await;

        {
            let span = span!(Level::INFO, "client");
            let _entered = span.enter();
            client.update_receive(&mut client_handlers)?;
            while let Some(event) = client.poll_event() {
                info!("event: {:?}", event);
            }
            if client.is_connected() && !ping_sent {
                client.connector_mut().send_message(PING, &1u32.to_be_bytes());
                ping_sent = true;
            }
            client.update_send()?;
        }
        {
            let span = span!(Level::INFO, "server");
            let _entered = span.enter();
            server.update_receive(&mut server_handlers)?;
            server.update_send()?;
            while let Some(event) = server.poll_event() {
                info!("event: {:?}", event);
            }
        }

        if ping_sent && !client.is_connected() {
            break;
        }
    }

    server.stop("shutting down");
    Ok(())
}
