//! Kind→handler dispatch table.
//!
//! # Design
//! - Handlers run on the caller's task with exclusive access to the context,
//!   so they are written as if single-threaded.
//! - Nothing past this boundary fails the caller: decode errors, unknown kinds
//!   and handler errors are logged and turned into a [`DispatchOutcome`].

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::command::{Command, CommandKind};
use crate::wire::{Decoded, decode};

type Handler<C> = Box<dyn Fn(&mut C, Command) -> anyhow::Result<()> + Send + Sync>;

/// What happened to one dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion.
    Handled,
    /// No handler is registered for the kind; nothing changed.
    Ignored,
    /// The frame could not be decoded and was dropped.
    Malformed,
    /// The handler returned an error, which was logged.
    Failed,
}

/// Handler table for one process.
pub struct Dispatcher<C> {
    handlers: HashMap<CommandKind, Handler<C>>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> Dispatcher<C> {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register<F>(&mut self, kind: CommandKind, handler: F) -> &mut Self
    where
        F: Fn(&mut C, Command) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    /// Whether a handler is registered for `kind`.
    #[must_use]
    pub fn handles(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Decode `frame` and run its handler.
    pub fn dispatch(&self, context: &mut C, frame: &[u8]) -> DispatchOutcome {
        match decode(frame) {
            Ok(Decoded::Known(command)) => self.dispatch_command(context, command),
            Ok(Decoded::Unknown { id, kind }) => {
                warn!(command_id = %id, kind = %kind, "ignoring command of unknown kind");
                DispatchOutcome::Ignored
            }
            Err(err) => {
                warn!(error = %err, detail = ?err, "dropping malformed command frame");
                DispatchOutcome::Malformed
            }
        }
    }

    /// Run the handler for an already decoded (or locally built) command.
    pub fn dispatch_command(&self, context: &mut C, command: Command) -> DispatchOutcome {
        let kind = command.kind();
        let id = command.id;
        let Some(handler) = self.handlers.get(&kind) else {
            warn!(command_id = %id, kind = %kind, "no handler registered for command");
            return DispatchOutcome::Ignored;
        };
        if command.spammy {
            trace!(command_id = %id, kind = %kind, "dispatching command");
        } else {
            debug!(command_id = %id, kind = %kind, "dispatching command");
        }
        match handler(context, command) {
            Ok(()) => DispatchOutcome::Handled,
            Err(err) => {
                warn!(command_id = %id, kind = %kind, error = %err, "command handler failed");
                DispatchOutcome::Failed
            }
        }
    }
}
