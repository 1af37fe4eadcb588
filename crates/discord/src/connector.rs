//! Session construction and login.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    secrecy::ExposeSecret,
    serenity::{
        all::{ClientBuilder, GatewayIntents},
        http::HttpBuilder,
    },
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use {
    courier_config::{AccountDesiredState, SessionKind},
    courier_supervisor::{ConnectError, SessionConnector, SessionControl, SessionEvent, SessionHandle},
};

use crate::{handler::EventForwarder, history::ChannelHistory};

/// Buffered events between the gateway task and the supervisor's pump.
const EVENT_BUFFER: usize = 256;

/// Gateway intents for a session kind. Privileged sessions get the full
/// message surface; constrained sessions skip the privileged
/// message-content intent.
#[must_use]
pub fn intents_for(kind: SessionKind) -> GatewayIntents {
    let base = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES;
    match kind {
        SessionKind::Privileged => base | GatewayIntents::MESSAGE_CONTENT,
        SessionKind::Constrained => base,
    }
}

fn cache_settings_for(kind: SessionKind) -> serenity::cache::Settings {
    let mut settings = serenity::cache::Settings::default();
    match kind {
        SessionKind::Privileged => {
            settings.max_messages = 200;
        },
        SessionKind::Constrained => {
            // Reduced cache profile to bound memory.
            settings.max_messages = 0;
            settings.cache_users = false;
        },
    }
    settings
}

struct DiscordControl {
    shard_manager: Arc<serenity::gateway::ShardManager>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl SessionControl for DiscordControl {
    async fn destroy(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shard_manager.shutdown_all().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Builds serenity-backed sessions for the supervisor.
#[derive(Default)]
pub struct DiscordConnector;

impl DiscordConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionConnector for DiscordConnector {
    async fn connect(&self, desired: &AccountDesiredState) -> Result<SessionHandle, ConnectError> {
        let token = desired.token.expose_secret().clone();
        let intents = intents_for(desired.session_kind);

        let http = match &desired.proxy {
            Some(proxy) => HttpBuilder::new(&token).proxy(proxy.clone()).build(),
            None => HttpBuilder::new(&token).build(),
        };

        // Verify the credential up front so a bad token is terminal
        // instead of burning the reconnect budget.
        let me = http.get_current_user().await.map_err(classify)?;
        info!(
            account_id = %desired.id,
            user = %me.name,
            kind = ?desired.session_kind,
            "credential verified, starting gateway"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(false));

        let forwarder = EventForwarder {
            tx: tx.clone(),
            connected: Arc::clone(&connected),
        };

        let mut client = ClientBuilder::new_with_http(http, intents)
            .cache_settings(cache_settings_for(desired.session_kind))
            .event_handler(forwarder)
            .await
            .map_err(classify)?;

        let history = Arc::new(ChannelHistory {
            http: Arc::clone(&client.http),
        });
        let control = Arc::new(DiscordControl {
            shard_manager: Arc::clone(&client.shard_manager),
            connected: Arc::clone(&connected),
        });

        let account_id = desired.id.clone();
        tokio::spawn(async move {
            let result = client.start().await;
            connected.store(false, Ordering::SeqCst);
            let reason = match result {
                Ok(()) => "gateway closed".to_string(),
                Err(e) => e.to_string(),
            };
            warn!(%account_id, %reason, "gateway loop ended");
            let _ = tx.send(SessionEvent::Disconnect { reason }).await;
        });

        Ok(SessionHandle {
            events: rx,
            control,
            history: Some(history),
        })
    }
}

fn classify(e: serenity::Error) -> ConnectError {
    if let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(resp)) = &e
        && resp.status_code.as_u16() == 401
    {
        return ConnectError::CredentialInvalid(e.to_string());
    }
    ConnectError::Retriable(e.to_string())
}
