use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::connector::Connector;
use crate::remote_info::RemoteInfo;
use crate::socket::SocketAdapter;

pub type HandlerId = u32;

pub type Handler = Box<dyn FnMut(&mut MessageContext<'_>, &mut Bytes) -> anyhow::Result<()> + Send>;

/// Builds a handler invocation: the handler's id followed by its arguments. Any number of
///  invocations can be appended to a connector, and they are dispatched in order on the
///  receiving side.
pub fn compose_message(handler_id: HandlerId, args: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(size_of::<HandlerId>() + args.len());
    buf.put_u32(handler_id);
    buf.put_slice(args);
    buf.freeze()
}

/// This is what a connector hands each complete inbound message to
pub trait MessageDispatcher {
    /// An `Err` means that the message could not be processed, and the connection is terminated
    ///  with reason `Error`
    fn on_message(&mut self, ctx: &mut MessageContext<'_>, message: Bytes) -> anyhow::Result<()>;
}

/// Gives a message handler access to the connection the message arrived on
pub struct MessageContext<'a> {
    connector: &'a mut Connector,
    socket: &'a SocketAdapter,
}

impl<'a> MessageContext<'a> {
    pub(crate) fn new(connector: &'a mut Connector, socket: &'a SocketAdapter) -> MessageContext<'a> {
        MessageContext { connector, socket }
    }

    /// The index the server assigned to the connection, if any. On a server, this identifies the
    ///  sending client.
    pub fn client_index(&self) -> Option<i32> {
        self.connector.client_index()
    }

    pub fn remote_info(&self) -> &RemoteInfo {
        self.connector.remote_info()
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn append_for_sending(&mut self, data: &[u8]) {
        self.connector.append_for_sending(data);
    }

    pub fn send_message(&mut self, handler_id: HandlerId, args: &[u8]) {
        self.connector.append_for_sending(&compose_message(handler_id, args));
    }

    /// Terminates the connection. No further messages are dispatched for it.
    pub fn disconnect(&mut self, notify_remote: bool, message: &str) {
        self.connector.disconnect(self.socket, notify_remote, message);
    }
}

/// Dispatches messages to handler functions by their leading [HandlerId]. A handler consumes its
///  arguments from the message buffer, and whatever follows is the next invocation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<HandlerId, Handler>,
}

impl HandlerRegistry {
    pub fn register(&mut self, handler_id: HandlerId, handler: impl FnMut(&mut MessageContext<'_>, &mut Bytes) -> anyhow::Result<()> + Send + 'static) -> anyhow::Result<()> {
        if self.handlers.contains_key(&handler_id) {
            bail!("handler id {} is already registered", handler_id);
        }
        self.handlers.insert(handler_id, Box::new(handler));
        Ok(())
    }
}

impl MessageDispatcher for HandlerRegistry {
    fn on_message(&mut self, ctx: &mut MessageContext<'_>, mut message: Bytes) -> anyhow::Result<()> {
        while message.has_remaining() && ctx.is_connected() {
            let handler_id = message.try_get_u32()?;
            let Some(handler) = self.handlers.get_mut(&handler_id) else {
                bail!("no handler registered for id {}", handler_id);
            };

            trace!("dispatching to handler {}", handler_id);
            handler(ctx, &mut message)?;
        }
        Ok(())
    }
}
