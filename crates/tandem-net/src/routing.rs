//! Message dispatch: route inbound packets to per-kind handlers.
//!
//! The [`MessageRegistry`] maps [`MessageKind`] values to [`MessageHandler`]
//! implementations. Handlers are installed once when the owning session is
//! constructed and receive a mutable context on every dispatch.

use std::collections::HashMap;

use crate::codec::{DecodeError, InboundHeader};
use crate::messages::MessageKind;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A decoded inbound header plus the raw payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct InboundPacket<'a> {
    /// Header fields.
    pub header: InboundHeader,
    /// Resolved message kind.
    pub kind: MessageKind,
    /// Bytes after the inbound header.
    pub payload: &'a [u8],
}

/// Handles one message kind against a context `C`.
pub trait MessageHandler<C, E> {
    /// Process a single inbound packet.
    fn handle(&self, ctx: &mut C, packet: &InboundPacket<'_>) -> Result<(), E>;
}

impl<C, E, F> MessageHandler<C, E> for F
where
    F: Fn(&mut C, &InboundPacket<'_>) -> Result<(), E>,
{
    fn handle(&self, ctx: &mut C, packet: &InboundPacket<'_>) -> Result<(), E> {
        self(ctx, packet)
    }
}

/// What happened to a dispatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran.
    Handled(MessageKind),
    /// No handler for this type id; the packet was dropped.
    Unhandled(u32),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Routes inbound packets to registered handlers by type id.
pub struct MessageRegistry<C, E> {
    handlers: HashMap<MessageKind, Box<dyn MessageHandler<C, E>>>,
}

impl<C, E> MessageRegistry<C, E>
where
    E: From<DecodeError>,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `kind`.
    ///
    /// The first registration wins; later ones are ignored. Returns whether
    /// this call installed the handler.
    pub fn register<H: MessageHandler<C, E> + 'static>(&mut self, kind: MessageKind, handler: H) -> bool {
        if self.handlers.contains_key(&kind) {
            tracing::trace!("Handler for {kind:?} already installed");
            return false;
        }
        self.handlers.insert(kind, Box::new(handler));
        true
    }

    /// Whether `kind` has a handler.
    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Read the type id at its fixed offset and run the matching handler.
    ///
    /// Unknown or unregistered type ids are dropped silently so newer peers
    /// can add message kinds. Header and handler failures are returned.
    pub fn dispatch(&self, ctx: &mut C, bytes: &[u8]) -> Result<Dispatch, E> {
        let (header, payload) = InboundHeader::read(bytes)?;
        let Ok(kind) = MessageKind::try_from(header.type_id) else {
            tracing::trace!("Dropping packet with unknown type id {:#010x}", header.type_id);
            return Ok(Dispatch::Unhandled(header.type_id));
        };
        let Some(handler) = self.handlers.get(&kind) else {
            tracing::trace!("No handler registered for {kind:?}, dropping packet");
            return Ok(Dispatch::Unhandled(header.type_id));
        };

        let packet = InboundPacket {
            header,
            kind,
            payload,
        };
        handler.handle(ctx, &packet)?;
        Ok(Dispatch::Handled(kind))
    }

    /// Registered kinds (useful for startup logging).
    pub fn registered_kinds(&self) -> impl Iterator<Item = &MessageKind> {
        self.handlers.keys()
    }
}

impl<C, E> Default for MessageRegistry<C, E>
where
    E: From<DecodeError>,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
