//! Command handlers: error taxonomy, execution context, and the registry.
//!
//! Handlers implement [`CommandHandler`] and are registered per
//! `(domain, command_type)`. The registry is populated at startup and
//! read-only afterwards; a single process can host handlers for several
//! domains, but each worker only dispatches commands for its own domain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::models::Command;
use crate::pgmq::PgmqError;

/// Error raised by a command handler.
///
/// The variant drives the worker's failure handling:
/// - `Transient`: retried per policy, then moved to the troubleshooting
///   queue.
/// - `Permanent`: moved to the troubleshooting queue immediately.
/// - `BusinessRule`: terminal failure from the producer's point of view; a
///   `FAILED` reply is sent and no operator action is expected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("transient error [{code}]: {message}")]
    Transient {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("permanent error [{code}]: {message}")]
    Permanent {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("business rule violated [{code}]: {message}")]
    BusinessRule {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl HandlerError {
    pub fn transient(code: &str, message: &str) -> Self {
        Self::Transient {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn permanent(code: &str, message: &str) -> Self {
        Self::Permanent {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn business_rule(code: &str, message: &str) -> Self {
        Self::BusinessRule {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        match &mut self {
            Self::Transient { details: d, .. }
            | Self::Permanent { details: d, .. }
            | Self::BusinessRule { details: d, .. } => *d = Some(details),
        }
        self
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. }
            | Self::Permanent { code, .. }
            | Self::BusinessRule { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. }
            | Self::Permanent { message, .. }
            | Self::BusinessRule { message, .. } => message,
        }
    }
}

/// Extends the visibility timeout of the message being processed.
///
/// Implementations run on their own short-lived connection so the
/// extension cannot contend with the dispatch pipeline's transactions.
#[async_trait]
pub trait VisibilityExtender: Send + Sync {
    /// Hide the message for another `seconds` seconds from now.
    async fn extend(&self, seconds: i32) -> Result<(), PgmqError>;
}

/// Context handed to a handler alongside the command.
pub struct HandlerContext {
    /// Current delivery attempt, 1-based.
    pub attempt: i32,
    pub max_attempts: i32,
    /// PGMQ message id for the in-flight delivery.
    pub msg_id: i64,
    extender: Option<Arc<dyn VisibilityExtender>>,
}

impl HandlerContext {
    pub fn new(attempt: i32, max_attempts: i32, msg_id: i64) -> Self {
        Self {
            attempt,
            max_attempts,
            msg_id,
            extender: None,
        }
    }

    pub fn with_extender(mut self, extender: Arc<dyn VisibilityExtender>) -> Self {
        self.extender = Some(extender);
        self
    }

    /// Extend the message's visibility timeout for long-running work.
    ///
    /// Returns `false` when no extender is configured (contexts built by
    /// hand in tests). The extension is advisory: it is not guaranteed if
    /// the database is unreachable.
    pub async fn extend_visibility(&self, seconds: i32) -> Result<bool, PgmqError> {
        match &self.extender {
            Some(extender) => {
                extender.extend(seconds).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A command handler.
///
/// On success the optional value becomes the reply payload (when the
/// command carries a `reply_to` queue).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: &Command,
        context: &HandlerContext,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Per-command-type dispatch options.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Publish a `FAILED` reply when the command is moved to the
    /// troubleshooting queue. Off by default: TSQ enrollment usually means
    /// an operator will still produce an outcome.
    pub reply_on_tsq: bool,
}

/// Registration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for {domain}.{command_type}")]
    AlreadyRegistered { domain: String, command_type: String },
}

/// Dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {domain}.{command_type}")]
    NotFound { domain: String, command_type: String },

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Maps `(domain, command_type)` to a handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), (Arc<dyn CommandHandler>, HandlerOptions)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with default options.
    pub fn register(
        &mut self,
        domain: &str,
        command_type: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistryError> {
        self.register_with_options(domain, command_type, handler, HandlerOptions::default())
    }

    /// Register a handler with explicit dispatch options.
    pub fn register_with_options(
        &mut self,
        domain: &str,
        command_type: &str,
        handler: Arc<dyn CommandHandler>,
        options: HandlerOptions,
    ) -> Result<(), RegistryError> {
        let key = (domain.to_string(), command_type.to_string());
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                domain: domain.to_string(),
                command_type: command_type.to_string(),
            });
        }
        self.handlers.insert(key, (handler, options));
        debug!(domain = %domain, command_type = %command_type, "registered handler");
        Ok(())
    }

    pub fn has_handler(&self, domain: &str, command_type: &str) -> bool {
        self.handlers
            .contains_key(&(domain.to_string(), command_type.to_string()))
    }

    /// Options for a registered command type, if any.
    pub fn options(&self, domain: &str, command_type: &str) -> Option<&HandlerOptions> {
        self.handlers
            .get(&(domain.to_string(), command_type.to_string()))
            .map(|(_, options)| options)
    }

    /// All registered `(domain, command_type)` pairs.
    pub fn registered_handlers(&self) -> Vec<(String, String)> {
        self.handlers.keys().cloned().collect()
    }

    /// Remove all registrations. For tests.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Dispatch a command to its registered handler.
    pub async fn dispatch(
        &self,
        command: &Command,
        context: &HandlerContext,
    ) -> Result<Option<Value>, DispatchError> {
        let key = (command.domain.clone(), command.command_type.clone());
        let (handler, _) = self
            .handlers
            .get(&key)
            .ok_or_else(|| DispatchError::NotFound {
                domain: command.domain.clone(),
                command_type: command.command_type.clone(),
            })?;

        debug!(
            domain = %command.domain,
            command_type = %command.command_type,
            command_id = %command.command_id,
            "dispatching command"
        );
        Ok(handler.handle(command, context).await?)
    }
}
