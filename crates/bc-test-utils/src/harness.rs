//! In-process controller wired to an in-memory store, a manual clock and a
//! recording notifier.

use crate::recording_notifier::RecordingNotifier;
use async_trait::async_trait;
use broadcast_controller::auth::{AuthorizationError, IdentityVerifier, VerifiedIdentity};
use broadcast_controller::config::Config;
use broadcast_controller::gateway::{ConnectionContext, GatewayDispatcher, GatewayEvent};
use broadcast_controller::lifecycle::{LifecycleController, SessionIdSource};
use broadcast_controller::messages::{ClientRequest, ServerMessage};
use broadcast_controller::repositories::Role;
use broadcast_controller::store::MemoryStore;
use common::clock::ManualClock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// 2023-11-14T22:13:20Z
pub const TEST_START_MS: i64 = 1_700_000_000_000;

/// Environment every harness config starts from.
pub fn base_vars() -> HashMap<String, String> {
    HashMap::from([
        ("REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
        (
            "BC_JWKS_URL".to_string(),
            "http://localhost:9000/.well-known/jwks.json".to_string(),
        ),
        ("BC_TOKEN_ISSUER".to_string(), crate::TEST_ISSUER.to_string()),
        ("BC_TOKEN_AUDIENCE".to_string(), crate::TEST_AUDIENCE.to_string()),
    ])
}

/// Build a config from [`base_vars`] plus `overrides`.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars = base_vars();
    for (name, value) in overrides {
        vars.insert((*name).to_string(), (*value).to_string());
    }
    Config::from_vars(&vars).expect("harness config should load")
}

/// Accepts `valid:<user>` tokens; `down` simulates an identity provider
/// outage; anything else is rejected as malformed.
pub struct StaticVerifier;

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthorizationError> {
        if token == "down" {
            return Err(AuthorizationError::ProviderUnavailable);
        }
        match token.strip_prefix("valid:") {
            Some(user) => Ok(VerifiedIdentity {
                user_id: user.to_string(),
                email: None,
                name: None,
            }),
            None => Err(AuthorizationError::MalformedToken),
        }
    }
}

/// Session ids `calm-otter-001`, `calm-otter-002`, ...
pub fn sequential_session_ids() -> SessionIdSource {
    let next = Arc::new(AtomicU32::new(1));
    Arc::new(move || format!("calm-otter-{:03}", next.fetch_add(1, Ordering::SeqCst)))
}

pub struct TestHarness {
    pub clock: ManualClock,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub lifecycle: Arc<LifecycleController>,
    pub dispatcher: GatewayDispatcher,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_overrides(&[])
    }

    pub fn with_overrides(overrides: &[(&str, &str)]) -> Self {
        Self::build(test_config(overrides), Arc::new(StaticVerifier))
    }

    pub fn build(config: Config, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self::build_with_clock(ManualClock::new(TEST_START_MS), config, verifier)
    }

    /// Use `clock` everywhere, so a verifier built on it sees the same time.
    pub fn build_with_clock(
        clock: ManualClock,
        config: Config,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let notifier = Arc::new(RecordingNotifier::new());
        let lifecycle = Arc::new(
            LifecycleController::new(
                Arc::new(config),
                Arc::new(clock.clone()),
                store.clone(),
                verifier,
                notifier.clone(),
            )
            .with_session_ids(sequential_session_ids()),
        );
        let dispatcher = GatewayDispatcher::new(Arc::clone(&lifecycle));
        Self {
            clock,
            store,
            notifier,
            lifecycle,
            dispatcher,
        }
    }

    pub fn speaker(&self, connection_id: &str, user: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: connection_id.to_string(),
            client_ip: Some("203.0.113.10".to_string()),
            token: Some(format!("valid:{user}")),
            role: Some(Role::Speaker),
        }
    }

    pub fn listener(&self, connection_id: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: connection_id.to_string(),
            client_ip: Some("198.51.100.20".to_string()),
            token: None,
            role: Some(Role::Listener),
        }
    }

    pub async fn send(&self, context: &ConnectionContext, request: ClientRequest) -> Vec<ServerMessage> {
        self.dispatcher
            .dispatch(GatewayEvent::Message {
                context: context.clone(),
                request,
            })
            .await
    }

    /// Open a speaker channel and create a session; returns the session id.
    pub async fn create_session(&self, context: &ConnectionContext, source_language: &str) -> String {
        let frames = self
            .send(
                context,
                ClientRequest::CreateSession {
                    source_language: source_language.to_string(),
                    quality_tier: "standard".to_string(),
                },
            )
            .await;
        match frames.first() {
            Some(ServerMessage::SessionCreated { session_id, .. }) => session_id.clone(),
            other => panic!("expected sessionCreated, got {other:?}"),
        }
    }

    /// Join `session_id` as a listener; returns the frames for the channel.
    pub async fn join(
        &self,
        context: &ConnectionContext,
        session_id: &str,
        target_language: &str,
    ) -> Vec<ServerMessage> {
        self.send(
            context,
            ClientRequest::JoinSession {
                session_id: session_id.to_string(),
                target_language: Some(target_language.to_string()),
            },
        )
        .await
    }

    pub async fn disconnect(&self, connection_id: &str) -> Vec<ServerMessage> {
        self.dispatcher
            .dispatch(GatewayEvent::Disconnect {
                connection_id: connection_id.to_string(),
            })
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
