//! Mailbox processor: one UNSEEN search + fetch + dispatch + move cycle
//! for a single mailbox on an already-connected session.

use anyhow::{Context, Result};
use async_imap::types::Uid;
use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use crate::config::{RuntimeConfig, ServerConfig};
use crate::core::connection::ImapSession;
use crate::core::dispatch::{self, DispatchOutcome};
use crate::core::message;
use crate::rest::TicketingClient;

const FETCH_QUERY: &str = "(UID BODY.PEEK[])";

pub async fn process_mailbox(
    session: &mut ImapSession,
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    server: &ServerConfig,
    box_name: &str,
) -> Result<()> {
    let moves = server
        .mailbox_config
        .get(box_name)
        .with_context(|| format!("mailbox `{box_name}` not present in configuration"))?;

    session
        .select(box_name)
        .await
        .with_context(|| format!("imap select mailbox failed: mailbox={box_name}"))?;

    let mut uids: Vec<Uid> = session
        .uid_search("UNSEEN")
        .await
        .context("imap UID SEARCH UNSEEN failed")?
        .into_iter()
        .collect();

    if uids.is_empty() {
        return Ok(());
    }

    uids.sort_unstable();
    uids.truncate(runtime.max_query_messages);

    debug!(mailbox = box_name, selected = uids.len(), "messages selected for dispatch");

    let uid_set = uids.iter().map(Uid::to_string).collect::<Vec<_>>().join(",");
    let mut fetches = session.uid_fetch(uid_set, FETCH_QUERY).await.context("imap UID FETCH failed")?;

    let mut raw_messages = Vec::with_capacity(uids.len());
    while let Some(fetch) = fetches.try_next().await.context("imap UID FETCH stream failed")? {
        let Some(uid) = fetch.uid else {
            warn!(mailbox = box_name, "fetch item missing UID");
            continue;
        };
        let Some(bytes) = fetch.body() else {
            warn!(mailbox = box_name, uid, "fetch item missing body");
            continue;
        };
        raw_messages.push((uid, bytes.to_vec()));
    }
    drop(fetches);

    if !uids.is_empty() {
        mark_seen(session, &uids).await?;
    }

    let host = server.host.as_str();

    for (uid, raw) in raw_messages {
        let parsed = match message::parse_email(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(mailbox = box_name, uid, error = %err, "message failed to parse, moving to failure mailbox");
                move_message(session, uid, &moves.failure).await;
                continue;
            }
        };

        let uid_str = uid.to_string();
        let outcome = dispatch::dispatch(client, runtime, &parsed, &raw, &uid_str, host, box_name).await;

        let target = match outcome {
            DispatchOutcome::Success => &moves.success,
            DispatchOutcome::Failure => &moves.failure,
        };
        move_message(session, uid, target).await;
    }

    info!(mailbox = box_name, "mailbox poll cycle complete");
    Ok(())
}

async fn mark_seen(session: &mut ImapSession, uids: &[Uid]) -> Result<()> {
    let uid_set = uids.iter().map(Uid::to_string).collect::<Vec<_>>().join(",");
    let mut updates = session.uid_store(uid_set, "+FLAGS (\\Seen)").await.context("imap UID STORE +FLAGS failed")?;
    while updates.try_next().await.context("imap UID STORE response stream failed")?.is_some() {}
    Ok(())
}

async fn move_message(session: &mut ImapSession, uid: Uid, target_mailbox: &str) {
    if let Err(err) = session.uid_mv(uid.to_string(), target_mailbox).await {
        warn!(uid, target_mailbox, error = %err, "imap UID MOVE failed, message left in place");
    }
}
