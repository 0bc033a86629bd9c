//! Gateway boundary: event dispatch, outbound delivery, WebSocket front end.

pub mod dispatcher;
pub mod notifier;
pub mod ws;

pub use dispatcher::{ConnectionContext, GatewayDispatcher, GatewayEvent};
pub use notifier::{ChannelNotifier, ConnectionNotifier, DeliveryError};
pub use ws::{gateway_router, GatewayState};
