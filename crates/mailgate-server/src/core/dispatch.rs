//! Per-message dispatch pipeline: classify as a follow-up comment or a
//! new issue, run the spam gate, talk to the ticketing backend, upload
//! attachments, and report where the message should be moved.

use std::collections::HashMap;

use regex::Regex;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::config::{OnPersonNotFound, RuntimeConfig};
use crate::core::attachments::{self, AttachmentParent};
use crate::core::body;
use crate::core::message::ParsedEmail;
use crate::core::spam::{self, SpamVerdict};
use crate::rest::{NewComment, NewIssue, TicketingClient};

/// Where the mailbox processor should move the source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failure,
}

fn issue_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"SRQ\d{12}").expect("static regex"))
}

pub async fn dispatch(
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    parsed: &ParsedEmail,
    raw_eml: &[u8],
    uid: &str,
    host: &str,
    mailbox: &str,
) -> DispatchOutcome {
    let referenced_issue_id = issue_id_regex().find(&parsed.subject).map(|m| m.as_str().to_string());

    let outcome = match referenced_issue_id {
        Some(issue_ref) => match client.get_issue(&issue_ref).await {
            Ok(Some(issue)) => comment_flow(client, runtime, parsed, &issue.id).await,
            Ok(None) | Err(_) => issue_flow(client, runtime, parsed, raw_eml, uid).await,
        },
        None => issue_flow(client, runtime, parsed, raw_eml, uid).await,
    };

    info!(host, uid, mailbox, outcome = ?outcome, "message dispatched");
    outcome
}

async fn comment_flow(
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    parsed: &ParsedEmail,
    issue_id: &str,
) -> DispatchOutcome {
    let body_text = processed_body(runtime, parsed);

    let Some(email) = parsed.from_address.as_deref() else {
        let result = client.create_comment(&NewComment { issue_id: issue_id.to_string(), author_id: None, body: body_text.clone() }).await;
        return finish_comment(client, runtime, parsed, result).await;
    };

    let person = match client.find_person_by_email(email).await {
        Ok(person) => person,
        Err(err) => {
            warn!("person lookup failed: email={email}, error={err:#}");
            None
        }
    };

    let Some(person) = person else {
        // No spam check against an unknown sender.
        let result = client
            .create_comment(&NewComment { issue_id: issue_id.to_string(), author_id: None, body: body_text.clone() })
            .await;
        return finish_comment(client, runtime, parsed, result).await;
    };

    if spam::check(client, &runtime.spam, &person.id, &parsed.header_names).await == SpamVerdict::Reject {
        return DispatchOutcome::Failure;
    }

    let result = client
        .create_comment(&NewComment { issue_id: issue_id.to_string(), author_id: Some(person.id), body: body_text })
        .await;
    finish_comment(client, runtime, parsed, result).await
}

async fn finish_comment(
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    parsed: &ParsedEmail,
    result: anyhow::Result<String>,
) -> DispatchOutcome {
    match result {
        Ok(comment_id) => {
            upload_comment_attachments(client, runtime, parsed, &comment_id).await;
            DispatchOutcome::Success
        }
        Err(err) => {
            warn!("comment creation failed: error={err:#}");
            DispatchOutcome::Failure
        }
    }
}

async fn issue_flow(
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    parsed: &ParsedEmail,
    raw_eml: &[u8],
    uid: &str,
) -> DispatchOutcome {
    let Some(email) = parsed.from_address.as_deref() else {
        return match runtime.on_person_not_found.resolve() {
            Ok(OnPersonNotFound::CreateSystemIssue) => create_system_issue(client, runtime, parsed, raw_eml, uid).await,
            _ => DispatchOutcome::Failure,
        };
    };

    let person = match client.find_person_by_email(email).await {
        Ok(person) => person,
        Err(err) => {
            warn!("person lookup failed: email={email}, error={err:#}");
            None
        }
    };

    let Some(person) = person else {
        return match runtime.on_person_not_found.resolve() {
            Ok(OnPersonNotFound::CreateSystemIssue) => create_system_issue(client, runtime, parsed, raw_eml, uid).await,
            _ => DispatchOutcome::Failure,
        };
    };

    if spam::check(client, &runtime.spam, &person.id, &parsed.header_names).await == SpamVerdict::Reject {
        return DispatchOutcome::Failure;
    }

    let timezone_offset = match client.person_timezone_offset(&person.id).await {
        Ok(offset) => offset,
        Err(err) => {
            warn!("timezone offset lookup failed: person_id={}, error={err:#}", person.id);
            None
        }
    };

    let fields = timezone_adjust(
        body::extract_attributes(&processed_body(runtime, parsed), parsed.is_html, &runtime.permitted_body_attributes),
        timezone_offset.as_deref(),
    );

    let new_issue = NewIssue {
        author_id: person.id,
        subject: parsed.subject.clone(),
        body: processed_body(runtime, parsed),
        status_id: runtime.default_issue_attrs.status_id.clone(),
        category_id: runtime.default_issue_attrs.category_id.clone(),
        priority_id: runtime.default_issue_attrs.priority_id.clone(),
        source_id: runtime.default_issue_attrs.source_id.clone(),
        fields,
    };

    match client.create_issue(&new_issue).await {
        Ok(issue) => {
            upload_issue_attachments(client, runtime, parsed, raw_eml, &issue.id, uid).await;
            DispatchOutcome::Success
        }
        Err(err) => {
            warn!("issue creation failed: error={err:#}");
            DispatchOutcome::Failure
        }
    }
}

async fn create_system_issue(
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    parsed: &ParsedEmail,
    raw_eml: &[u8],
    uid: &str,
) -> DispatchOutcome {
    let new_issue = NewIssue {
        author_id: runtime.default_issue_attrs.author_id.clone(),
        subject: parsed.subject.clone(),
        body: processed_body(runtime, parsed),
        status_id: runtime.default_issue_attrs.status_id.clone(),
        category_id: runtime.default_issue_attrs.category_id.clone(),
        priority_id: runtime.default_issue_attrs.priority_id.clone(),
        source_id: runtime.default_issue_attrs.source_id.clone(),
        fields: body::extract_attributes(&processed_body(runtime, parsed), parsed.is_html, &runtime.permitted_body_attributes),
    };

    match client.create_issue(&new_issue).await {
        Ok(issue) => {
            upload_issue_attachments(client, runtime, parsed, raw_eml, &issue.id, uid).await;
            DispatchOutcome::Success
        }
        Err(err) => {
            warn!("system issue creation failed: error={err:#}");
            DispatchOutcome::Failure
        }
    }
}

async fn upload_issue_attachments(
    client: &dyn TicketingClient,
    runtime: &RuntimeConfig,
    parsed: &ParsedEmail,
    raw_eml: &[u8],
    issue_id: &str,
    uid: &str,
) {
    if !runtime.join_attachments {
        return;
    }
    let eml_name = format!("{uid}-message.eml");
    let eml = runtime.join_original_as_eml.then(|| (eml_name.as_str(), raw_eml));
    attachments::upload_all(client, AttachmentParent::Issue(issue_id), &parsed.attachments, eml).await;
}

async fn upload_comment_attachments(client: &dyn TicketingClient, runtime: &RuntimeConfig, parsed: &ParsedEmail, comment_id: &str) {
    if !runtime.join_attachments {
        return;
    }
    // EML attachment is reserved for new issues only, never for comments.
    attachments::upload_all(client, AttachmentParent::Comment(comment_id), &parsed.attachments, None).await;
}

fn processed_body(runtime: &RuntimeConfig, parsed: &ParsedEmail) -> String {
    let raw = parsed.effective_body.as_deref().unwrap_or("");
    if runtime.truncate_comments_after_delimiter {
        body::truncate_body(raw, parsed.is_html, &runtime.comment_delimiters).unwrap_or_else(|_| raw.to_string())
    } else {
        raw.to_string()
    }
}

fn timezone_adjust(mut fields: HashMap<String, String>, offset: Option<&str>) -> HashMap<String, String> {
    let offset = offset.unwrap_or("+00:00");
    for value in fields.values_mut() {
        if looks_like_naive_iso_date(value) {
            value.push_str(offset);
        }
    }
    fields
}

fn looks_like_naive_iso_date(value: &str) -> bool {
    value.len() == 19 && value.as_bytes().get(10) == Some(&b'T')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultIssueAttrs, OnPersonNotFoundFlags, SpamConfig};
    use crate::rest::{AttachmentUpload, Issue, Person};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        persons: Mutex<HashMap<String, Person>>,
        issues: Mutex<HashMap<String, Issue>>,
        created_issue: Mutex<Option<NewIssue>>,
        created_comment: Mutex<Option<NewComment>>,
        issue_attachment_uploads: Mutex<Vec<(String, String)>>,
        comment_attachment_uploads: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TicketingClient for FakeClient {
        async fn find_person_by_email(&self, email: &str) -> anyhow::Result<Option<Person>> {
            Ok(self.persons.lock().unwrap().get(email).cloned())
        }
        async fn get_issue(&self, issue_ref: &str) -> anyhow::Result<Option<Issue>> {
            Ok(self.issues.lock().unwrap().get(issue_ref).cloned())
        }
        async fn create_issue(&self, issue: &NewIssue) -> anyhow::Result<Issue> {
            *self.created_issue.lock().unwrap() = Some(issue.clone());
            Ok(Issue { id: "new-issue-1".to_string() })
        }
        async fn create_comment(&self, comment: &NewComment) -> anyhow::Result<String> {
            *self.created_comment.lock().unwrap() = Some(comment.clone());
            Ok("new-comment-1".to_string())
        }
        async fn upload_issue_attachment(&self, issue_id: &str, attachment: AttachmentUpload<'_>) -> anyhow::Result<()> {
            self.issue_attachment_uploads.lock().unwrap().push((issue_id.to_string(), attachment.file_name.clone()));
            Ok(())
        }
        async fn upload_comment_attachment(&self, comment_id: &str, attachment: AttachmentUpload<'_>) -> anyhow::Result<()> {
            self.comment_attachment_uploads.lock().unwrap().push((comment_id.to_string(), attachment.file_name.clone()));
            Ok(())
        }
        async fn count_recent_issues(&self, _person_id: &str, _time_span_minutes: u64) -> anyhow::Result<u32> {
            Ok(0)
        }
        async fn person_timezone_offset(&self, _person_id: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    fn runtime_config() -> RuntimeConfig {
        RuntimeConfig {
            max_query_messages: 10,
            query_interval: crate::config::DurationSeconds::default(),
            join_original_as_eml: false,
            join_attachments: true,
            truncate_comments_after_delimiter: false,
            comment_delimiters: Vec::new(),
            permitted_body_attributes: HashMap::new(),
            default_issue_attrs: DefaultIssueAttrs {
                author_id: "system".to_string(),
                status_id: None,
                category_id: None,
                priority_id: None,
                source_id: None,
            },
            on_person_not_found: OnPersonNotFoundFlags { create_system_issue: true, move_msg_to_failure_folder: false },
            spam: SpamConfig::default(),
        }
    }

    fn parsed_email(subject: &str, from: Option<&str>) -> ParsedEmail {
        ParsedEmail {
            from_address: from.map(str::to_string),
            subject: subject.to_string(),
            header_names: vec![],
            effective_body: Some("hello".to_string()),
            is_html: false,
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn unknown_sender_new_issue_creates_system_issue_when_configured() {
        let client = FakeClient::default();
        let runtime = runtime_config();
        let parsed = parsed_email("need help", Some("nobody@example.com"));

        let outcome = dispatch(&client, &runtime, &parsed, b"raw", "1", "host", "INBOX").await;
        assert_eq!(outcome, DispatchOutcome::Success);
        assert!(client.created_issue.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_sender_new_issue_fails_when_configured_to_move_to_failure() {
        let client = FakeClient::default();
        let mut runtime = runtime_config();
        runtime.on_person_not_found = OnPersonNotFoundFlags { create_system_issue: false, move_msg_to_failure_folder: true };
        let parsed = parsed_email("need help", Some("nobody@example.com"));

        let outcome = dispatch(&client, &runtime, &parsed, b"raw", "1", "host", "INBOX").await;
        assert_eq!(outcome, DispatchOutcome::Failure);
    }

    #[tokio::test]
    async fn referenced_issue_creates_comment() {
        let client = FakeClient::default();
        client.issues.lock().unwrap().insert("SRQ000000000001".to_string(), Issue { id: "issue-1".to_string() });
        let runtime = runtime_config();
        let parsed = parsed_email("Re: ticket SRQ000000000001", None);

        let outcome = dispatch(&client, &runtime, &parsed, b"raw", "1", "host", "INBOX").await;
        assert_eq!(outcome, DispatchOutcome::Success);
        assert!(client.created_comment.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn new_issue_eml_attachment_is_named_with_uid() {
        let client = FakeClient::default();
        let mut runtime = runtime_config();
        runtime.join_original_as_eml = true;
        let parsed = parsed_email("need help", Some("nobody@example.com"));

        let outcome = dispatch(&client, &runtime, &parsed, b"raw", "42", "host", "INBOX").await;
        assert_eq!(outcome, DispatchOutcome::Success);

        let uploads = client.issue_attachment_uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0], ("new-issue-1".to_string(), "42-message.eml".to_string()));
    }

    #[tokio::test]
    async fn referenced_issue_uploads_attachment_against_new_comment_id() {
        let client = FakeClient::default();
        client.issues.lock().unwrap().insert("SRQ000000000001".to_string(), Issue { id: "issue-1".to_string() });
        let runtime = runtime_config();
        let mut parsed = parsed_email("Re: ticket SRQ000000000001", None);
        parsed.attachments.push(crate::core::message::DecodedAttachment {
            file_name: "photo.png".to_string(),
            content_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        });

        let outcome = dispatch(&client, &runtime, &parsed, b"raw", "1", "host", "INBOX").await;
        assert_eq!(outcome, DispatchOutcome::Success);

        let uploads = client.comment_attachment_uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0], ("new-comment-1".to_string(), "photo.png".to_string()));
    }

    #[test]
    fn timezone_adjust_appends_offset_to_naive_dates() {
        let mut fields = HashMap::new();
        fields.insert("due".to_string(), "2024-06-05T23:59:59".to_string());
        let adjusted = timezone_adjust(fields, Some("+03:00"));
        assert_eq!(adjusted.get("due").unwrap(), "2024-06-05T23:59:59+03:00");
    }
}
