//! Hooks system for extensibility
//!
//! Provides a trait-based hooks system for connection validation, message
//! interception and lifecycle events. Interception methods receive their
//! argument by `&mut` and abort through its flags; an `Err` is logged by the
//! caller and treated as described on each method.

mod events;

pub use events::*;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::ReasonCode;

/// Hook error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// Internal error in hook implementation
    Internal(String),
    /// The hook refuses the operation with this reason code
    Denied(ReasonCode),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "internal hook error: {}", msg),
            HookError::Denied(code) => write!(f, "denied: {}", code),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks
///
/// Every method has a default that allows the operation or does nothing,
/// so implementations only override what they need.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called once per CONNECT, before the session is looked up
    ///
    /// # Arguments
    /// * `ctx` - Connection details. Set `reason_code` to reject; may assign
    ///   a client identifier, a server reference and session items.
    ///
    /// # Returns
    /// * `Err(HookError::Denied(code))` rejects with `code`
    /// * `Err(HookError::Internal(_))` rejects with `UnspecifiedError`
    async fn validate_connection(&self, _ctx: &mut ValidatingConnection) -> HookResult<()> {
        Ok(())
    }

    /// Called for every message before retained storage and fan-out,
    /// including injected ones
    ///
    /// An `Err` is logged and the message is routed unchanged.
    async fn intercept_publish(&self, _ctx: &mut InterceptingPublish) -> HookResult<()> {
        Ok(())
    }

    /// Called per SUBSCRIBE filter
    ///
    /// # Returns
    /// * `Err(HookError::Denied(code))` answers the filter with `code`
    async fn intercept_subscription(&self, _ctx: &mut InterceptingSubscription) -> HookResult<()> {
        Ok(())
    }

    /// Called per UNSUBSCRIBE filter
    async fn intercept_unsubscription(
        &self,
        _ctx: &mut InterceptingUnsubscription,
    ) -> HookResult<()> {
        Ok(())
    }

    /// Called for every packet written to a client. Clearing `accept` drops it.
    async fn intercept_outbound_packet(&self, _ctx: &mut InterceptingOutbound) -> HookResult<()> {
        Ok(())
    }

    /// Called for every routed copy before it enters a session queue
    async fn intercept_client_enqueue(
        &self,
        _ctx: &mut InterceptingClientEnqueue,
    ) -> HookResult<()> {
        Ok(())
    }

    /// Called after CONNACK was sent
    async fn on_client_connected(&self, _event: &ClientConnected) {}

    /// Called when a connection that reached the connected state ends
    async fn on_client_disconnected(&self, _event: &ClientDisconnected) {}

    async fn on_client_subscribed(&self, _event: &ClientSubscribed) {}

    async fn on_client_unsubscribed(&self, _event: &ClientUnsubscribed) {}

    /// Called once per outbound QoS 1/2 message, after PUBACK or PUBCOMP
    async fn on_client_acknowledged(&self, _event: &ClientAcknowledged) {}

    async fn on_message_not_consumed(&self, _event: &MessageNotConsumed) {}

    async fn on_message_enqueued_or_dropped(&self, _event: &MessageEnqueuedOrDropped) {}

    async fn on_queued_message_overwritten(&self, _event: &QueuedMessageOverwritten) {}

    async fn on_retained_message_changed(&self, _event: &RetainedMessageChanged) {}

    async fn on_retained_messages_cleared(&self) {}

    async fn on_session_deleted(&self, _event: &SessionDeleted) {}

    async fn on_started(&self) {}

    async fn on_stopped(&self) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Implement Hooks for Arc<T> where T: Hooks
/// This allows Arc-wrapped hook providers to be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn validate_connection(&self, ctx: &mut ValidatingConnection) -> HookResult<()> {
        (**self).validate_connection(ctx).await
    }

    async fn intercept_publish(&self, ctx: &mut InterceptingPublish) -> HookResult<()> {
        (**self).intercept_publish(ctx).await
    }

    async fn intercept_subscription(&self, ctx: &mut InterceptingSubscription) -> HookResult<()> {
        (**self).intercept_subscription(ctx).await
    }

    async fn intercept_unsubscription(
        &self,
        ctx: &mut InterceptingUnsubscription,
    ) -> HookResult<()> {
        (**self).intercept_unsubscription(ctx).await
    }

    async fn intercept_outbound_packet(&self, ctx: &mut InterceptingOutbound) -> HookResult<()> {
        (**self).intercept_outbound_packet(ctx).await
    }

    async fn intercept_client_enqueue(
        &self,
        ctx: &mut InterceptingClientEnqueue,
    ) -> HookResult<()> {
        (**self).intercept_client_enqueue(ctx).await
    }

    async fn on_client_connected(&self, event: &ClientConnected) {
        (**self).on_client_connected(event).await
    }

    async fn on_client_disconnected(&self, event: &ClientDisconnected) {
        (**self).on_client_disconnected(event).await
    }

    async fn on_client_subscribed(&self, event: &ClientSubscribed) {
        (**self).on_client_subscribed(event).await
    }

    async fn on_client_unsubscribed(&self, event: &ClientUnsubscribed) {
        (**self).on_client_unsubscribed(event).await
    }

    async fn on_client_acknowledged(&self, event: &ClientAcknowledged) {
        (**self).on_client_acknowledged(event).await
    }

    async fn on_message_not_consumed(&self, event: &MessageNotConsumed) {
        (**self).on_message_not_consumed(event).await
    }

    async fn on_message_enqueued_or_dropped(&self, event: &MessageEnqueuedOrDropped) {
        (**self).on_message_enqueued_or_dropped(event).await
    }

    async fn on_queued_message_overwritten(&self, event: &QueuedMessageOverwritten) {
        (**self).on_queued_message_overwritten(event).await
    }

    async fn on_retained_message_changed(&self, event: &RetainedMessageChanged) {
        (**self).on_retained_message_changed(event).await
    }

    async fn on_retained_messages_cleared(&self) {
        (**self).on_retained_messages_cleared().await
    }

    async fn on_session_deleted(&self, event: &SessionDeleted) {
        (**self).on_session_deleted(event).await
    }

    async fn on_started(&self) {
        (**self).on_started().await
    }

    async fn on_stopped(&self) {
        (**self).on_stopped().await
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// Hooks run in registration order. For validation and interception the
/// chain stops at the first hook that errors or aborts the operation.
/// For events all hooks are called in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    /// Create a new composite hooks instance
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hooks implementation
    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn validate_connection(&self, ctx: &mut ValidatingConnection) -> HookResult<()> {
        for hooks in &self.hooks {
            hooks.validate_connection(ctx).await?;
            if !ctx.is_accepted() {
                break;
            }
        }
        Ok(())
    }

    async fn intercept_publish(&self, ctx: &mut InterceptingPublish) -> HookResult<()> {
        for hooks in &self.hooks {
            hooks.intercept_publish(ctx).await?;
            if ctx.is_aborted() {
                break;
            }
        }
        Ok(())
    }

    async fn intercept_subscription(&self, ctx: &mut InterceptingSubscription) -> HookResult<()> {
        for hooks in &self.hooks {
            hooks.intercept_subscription(ctx).await?;
            if ctx.is_aborted() {
                break;
            }
        }
        Ok(())
    }

    async fn intercept_unsubscription(
        &self,
        ctx: &mut InterceptingUnsubscription,
    ) -> HookResult<()> {
        for hooks in &self.hooks {
            hooks.intercept_unsubscription(ctx).await?;
            if ctx.is_aborted() {
                break;
            }
        }
        Ok(())
    }

    async fn intercept_outbound_packet(&self, ctx: &mut InterceptingOutbound) -> HookResult<()> {
        for hooks in &self.hooks {
            hooks.intercept_outbound_packet(ctx).await?;
            if !ctx.accept {
                break;
            }
        }
        Ok(())
    }

    async fn intercept_client_enqueue(
        &self,
        ctx: &mut InterceptingClientEnqueue,
    ) -> HookResult<()> {
        for hooks in &self.hooks {
            hooks.intercept_client_enqueue(ctx).await?;
            if !ctx.accept_enqueue {
                break;
            }
        }
        Ok(())
    }

    async fn on_client_connected(&self, event: &ClientConnected) {
        for hooks in &self.hooks {
            hooks.on_client_connected(event).await;
        }
    }

    async fn on_client_disconnected(&self, event: &ClientDisconnected) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(event).await;
        }
    }

    async fn on_client_subscribed(&self, event: &ClientSubscribed) {
        for hooks in &self.hooks {
            hooks.on_client_subscribed(event).await;
        }
    }

    async fn on_client_unsubscribed(&self, event: &ClientUnsubscribed) {
        for hooks in &self.hooks {
            hooks.on_client_unsubscribed(event).await;
        }
    }

    async fn on_client_acknowledged(&self, event: &ClientAcknowledged) {
        for hooks in &self.hooks {
            hooks.on_client_acknowledged(event).await;
        }
    }

    async fn on_message_not_consumed(&self, event: &MessageNotConsumed) {
        for hooks in &self.hooks {
            hooks.on_message_not_consumed(event).await;
        }
    }

    async fn on_message_enqueued_or_dropped(&self, event: &MessageEnqueuedOrDropped) {
        for hooks in &self.hooks {
            hooks.on_message_enqueued_or_dropped(event).await;
        }
    }

    async fn on_queued_message_overwritten(&self, event: &QueuedMessageOverwritten) {
        for hooks in &self.hooks {
            hooks.on_queued_message_overwritten(event).await;
        }
    }

    async fn on_retained_message_changed(&self, event: &RetainedMessageChanged) {
        for hooks in &self.hooks {
            hooks.on_retained_message_changed(event).await;
        }
    }

    async fn on_retained_messages_cleared(&self) {
        for hooks in &self.hooks {
            hooks.on_retained_messages_cleared().await;
        }
    }

    async fn on_session_deleted(&self, event: &SessionDeleted) {
        for hooks in &self.hooks {
            hooks.on_session_deleted(event).await;
        }
    }

    async fn on_started(&self) {
        for hooks in &self.hooks {
            hooks.on_started().await;
        }
    }

    async fn on_stopped(&self) {
        for hooks in &self.hooks {
            hooks.on_stopped().await;
        }
    }
}
