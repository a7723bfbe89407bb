//! Connection supervisor: owns one IMAP session end to end, connect,
//! periodic poll, reconnect on unclean close, across every mailbox
//! configured for its server.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_imap::{Client, Session};
use async_native_tls::{TlsConnector, TlsStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::mailbox;
use crate::rest::TicketingClient;
use crate::config::RuntimeConfig;

pub type ImapSession = Session<TlsStream<TcpStream>>;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Ready,
    Closed { had_error: bool },
}

/// Owns one server's IMAP session and its poll/reconnect timers.
pub struct ConnectionSupervisor {
    server: ServerConfig,
    runtime: Arc<RuntimeConfig>,
    client: Arc<dyn TicketingClient>,
    shutdown: CancellationToken,
    state: Mutex<State>,
    is_running: Mutex<bool>,
}

impl ConnectionSupervisor {
    pub fn new(
        server: ServerConfig,
        runtime: Arc<RuntimeConfig>,
        client: Arc<dyn TicketingClient>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            server,
            runtime,
            client,
            shutdown,
            state: Mutex::new(State::Disconnected),
            is_running: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.server.name
    }

    pub async fn is_idle(&self) -> bool {
        let state = *self.state.lock().await;
        let running = *self.is_running.lock().await;
        matches!(state, State::Disconnected | State::Closed { .. }) && !running
    }

    /// Runs the full connect -> poll -> (reconnect on error) lifecycle
    /// until `shutdown` is cancelled.
    pub async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            *self.state.lock().await = State::Connecting;
            match self.open_and_poll_until_error().await {
                Ok(()) => {
                    *self.state.lock().await = State::Closed { had_error: false };
                    info!(server = self.server.name, "connection closed cleanly");
                    return;
                }
                Err(err) => {
                    *self.state.lock().await = State::Closed { had_error: true };
                    warn!(server = self.server.name, error = %format!("{err:#}"), "connection failed, will retry");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
        }
    }

    async fn open_and_poll_until_error(&self) -> Result<()> {
        let mut session = open_imap_session(&self.server).await?;
        *self.state.lock().await = State::Ready;
        info!(server = self.server.name, "imap session ready");

        let delimiter = discover_delimiter(&mut session).await.unwrap_or_else(|_| "/".to_string());
        let (passed, failed) = check_mailbox_tree(&mut session, &self.server, &delimiter).await?;

        if !failed.is_empty() {
            warn!(server = self.server.name, mailboxes = ?failed, "mailbox structure check failed for these mailboxes");
        }
        if passed.is_empty() {
            anyhow::bail!("no configured mailbox passed the structure check");
        }

        let mut ticker = interval(self.runtime.query_interval.0.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    session.logout().await.ok();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if *self.is_running.lock().await {
                        continue;
                    }
                    *self.is_running.lock().await = true;

                    for box_name in &passed {
                        if let Err(err) = mailbox::process_mailbox(
                            &mut session,
                            self.client.as_ref(),
                            &self.runtime,
                            &self.server,
                            box_name,
                        ).await {
                            warn!(server = self.server.name, mailbox = box_name, error = %format!("{err:#}"), "mailbox poll failed");
                        }
                    }

                    *self.is_running.lock().await = false;
                }
            }
        }
    }
}

async fn discover_delimiter(session: &mut ImapSession) -> Result<String> {
    use futures_util::TryStreamExt;
    let mut names = session.list(Some(""), Some("*")).await.context("imap LIST failed")?;
    if let Some(name) = names.try_next().await.context("imap LIST stream failed")? {
        if let Some(delim) = name.delimiter() {
            return Ok(delim.to_string());
        }
    }
    Ok("/".to_string())
}

/// Verifies every configured mailbox (and its success/failure children)
/// exists, yielding the disjoint `(passed, failed)` lists.
async fn check_mailbox_tree(
    session: &mut ImapSession,
    server: &ServerConfig,
    delimiter: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    use futures_util::TryStreamExt;

    let mut existing = std::collections::HashSet::new();
    let mut names = session.list(Some(""), Some("*")).await.context("imap LIST failed")?;
    while let Some(name) = names.try_next().await.context("imap LIST stream failed")? {
        existing.insert(name.name().to_string());
    }
    drop(names);

    let mut passed = Vec::new();
    let mut failed = Vec::new();

    for (mailbox, moves) in &server.mailbox_config {
        let success_child = format!("{mailbox}{delimiter}{}", moves.success);
        let failure_child = format!("{mailbox}{delimiter}{}", moves.failure);

        if existing.contains(mailbox) && existing.contains(&success_child) && existing.contains(&failure_child) {
            passed.push(mailbox.clone());
        } else {
            failed.push(mailbox.clone());
        }
    }

    Ok((passed, failed))
}

async fn open_imap_session(server: &ServerConfig) -> Result<ImapSession> {
    let connect_timeout = Duration::from_secs(server.connect_timeout_secs.max(1));

    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((server.host.as_str(), server.port)))
        .await
        .with_context(|| format!("imap tcp connect timeout: host={}, port={}", server.host, server.port))?
        .with_context(|| format!("imap tcp connect failed: host={}, port={}", server.host, server.port))?;

    let tls = TlsConnector::new().danger_accept_invalid_certs(server.tls_insecure);
    let tls_stream = tokio::time::timeout(connect_timeout, tls.connect(server.host.as_str(), tcp))
        .await
        .with_context(|| format!("imap tls handshake timeout: host={}", server.host))?
        .with_context(|| format!("imap tls handshake failed: host={}", server.host))?;

    let mut client = Client::new(tls_stream);
    let greeting = tokio::time::timeout(connect_timeout, client.read_response())
        .await
        .with_context(|| format!("imap greeting timeout: host={}", server.host))?
        .context("failed to read imap greeting")?;
    let _ = greeting;

    tokio::time::timeout(connect_timeout, client.login(&server.user, &server.pass))
        .await
        .with_context(|| format!("imap login timeout: host={}, user={}", server.host, server.user))?
        .map_err(|(err, _client)| err)
        .with_context(|| format!("imap login failed: host={}, user={}", server.host, server.user))
}
