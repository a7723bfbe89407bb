//! Per-message attachment upload, driven concurrently.

use futures_util::future::join_all;
use tracing::warn;

use crate::core::message::DecodedAttachment;
use crate::rest::{AttachmentUpload, TicketingClient};

#[derive(Clone, Copy)]
pub enum AttachmentParent<'a> {
    Issue(&'a str),
    Comment(&'a str),
}

/// Uploads every attachment (and, for new issues, the raw EML) for one
/// message concurrently. Individual failures are logged, never
/// propagated: attachment upload never blocks the parent outcome.
pub async fn upload_all(
    client: &dyn TicketingClient,
    parent: AttachmentParent<'_>,
    attachments: &[DecodedAttachment],
    raw_eml: Option<(&str, &[u8])>,
) {
    let mut uploads = Vec::with_capacity(attachments.len() + 1);

    for attachment in attachments {
        uploads.push(upload_one(client, parent, &attachment.file_name, &attachment.content_type, &attachment.bytes));
    }

    if let Some((file_name, bytes)) = raw_eml {
        uploads.push(upload_one(client, parent, file_name, "message/rfc822", bytes));
    }

    join_all(uploads).await;
}

async fn upload_one(
    client: &dyn TicketingClient,
    parent: AttachmentParent<'_>,
    file_name: &str,
    content_type: &str,
    bytes: &[u8],
) {
    let attachment = AttachmentUpload { file_name: file_name.to_string(), content_type: content_type.to_string(), bytes };

    let result = match parent {
        AttachmentParent::Issue(issue_id) => client.upload_issue_attachment(issue_id, attachment).await,
        AttachmentParent::Comment(comment_id) => client.upload_comment_attachment(comment_id, attachment).await,
    };

    if let Err(err) = result {
        warn!("attachment upload failed: file_name={file_name}, error={err:#}");
    }
}
