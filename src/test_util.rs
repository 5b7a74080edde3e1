//! Helpers for tests that drive servers and clients through complete cycles

use std::sync::{Arc, Mutex};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::client::Client;
use crate::event::ConnectorEvent;
use crate::handler::{HandlerId, HandlerRegistry};
use crate::server::{Server, ServerEvent};

pub const ECHO_REQUEST: HandlerId = 1;
pub const ECHO_REPLY: HandlerId = 2;

pub type Recorded = Arc<Mutex<Vec<(Option<i32>, Bytes)>>>;

pub fn length_prefixed(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(data.len() + 4);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.to_vec()
}

fn take_length_prefixed(args: &mut Bytes) -> anyhow::Result<Bytes> {
    let len = args.try_get_u32()? as usize;
    if args.remaining() < len {
        bail!("truncated payload");
    }
    Ok(args.split_to(len))
}

/// A registry that answers every echo request with a reply carrying the same payload, recording
///  requests together with the sender's client index
pub fn echo_registry(requests: Recorded) -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    registry.register(ECHO_REQUEST, move |ctx, args| {
        let payload = take_length_prefixed(args)?;
        requests.lock().unwrap().push((ctx.client_index(), payload.clone()));
        ctx.send_message(ECHO_REPLY, &length_prefixed(&payload));
        Ok(())
    }).unwrap();
    registry
}

/// A registry that records echo requests without answering them
pub fn request_recorder(requests: Recorded) -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    registry.register(ECHO_REQUEST, move |ctx, args| {
        let payload = take_length_prefixed(args)?;
        requests.lock().unwrap().push((ctx.client_index(), payload));
        Ok(())
    }).unwrap();
    registry
}

pub fn reply_recorder(replies: Recorded) -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    registry.register(ECHO_REPLY, move |ctx, args| {
        let payload = take_length_prefixed(args)?;
        replies.lock().unwrap().push((ctx.client_index(), payload));
        Ok(())
    }).unwrap();
    registry
}

/// One full cycle for a client and a server: client sends, server receives and answers, client
///  receives the answer
pub fn drive_cycle(server: &mut Server, server_registry: &mut HandlerRegistry, client: &mut Client, client_registry: &mut HandlerRegistry) {
    client.update_send().unwrap();
    server.update_receive(server_registry).unwrap();
    server.update_send().unwrap();
    client.update_receive(client_registry).unwrap();
}

pub fn server_events(server: &mut Server) -> Vec<ServerEvent> {
    let mut result = Vec::new();
    while let Some(evt) = server.poll_event() {
        result.push(evt);
    }
    result
}

pub fn client_events(client: &mut Client) -> Vec<ConnectorEvent> {
    let mut result = Vec::new();
    while let Some(evt) = client.poll_event() {
        result.push(evt);
    }
    result
}
