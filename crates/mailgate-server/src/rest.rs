//! Ticketing REST collaborator.
//!
//! The pipeline never talks to `reqwest` directly; it goes through the
//! `TicketingClient` trait so tests can swap in an in-memory fake.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RestConfig;

#[derive(Debug, Clone)]
pub struct Person {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewIssue {
    pub author_id: String,
    pub subject: String,
    pub body: String,
    pub status_id: Option<String>,
    pub category_id: Option<String>,
    pub priority_id: Option<String>,
    pub source_id: Option<String>,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewComment {
    pub issue_id: String,
    pub author_id: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload<'a> {
    pub file_name: String,
    pub content_type: String,
    pub bytes: &'a [u8],
}

/// Every call the dispatch pipeline needs from the ticketing backend.
#[async_trait::async_trait]
pub trait TicketingClient: Send + Sync {
    async fn find_person_by_email(&self, email: &str) -> Result<Option<Person>>;
    async fn get_issue(&self, issue_ref: &str) -> Result<Option<Issue>>;
    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue>;
    /// Returns the id of the newly created comment.
    async fn create_comment(&self, comment: &NewComment) -> Result<String>;
    async fn upload_issue_attachment(&self, issue_id: &str, attachment: AttachmentUpload<'_>) -> Result<()>;
    async fn upload_comment_attachment(&self, comment_id: &str, attachment: AttachmentUpload<'_>) -> Result<()>;
    /// Count of issues authored by `person_id` within the last `time_span_minutes`.
    async fn count_recent_issues(&self, person_id: &str, time_span_minutes: u64) -> Result<u32>;
    /// `person_id`'s UTC offset (e.g. "+03:00"), looked up via the database
    /// query endpoint. `None` when the endpoint has no offset on file.
    async fn person_timezone_offset(&self, person_id: &str) -> Result<Option<String>>;
}

/// `reqwest`-backed implementation of the contract described above.
///
/// Every response is expected to follow the envelope shape
/// `{ "ReturnCode": 0, "ResourceName": "...", "content": [ { "<ResourceName>": {...} } ], "Messages": [] }`.
pub struct HttpTicketingClient {
    client: Client,
    config: RestConfig,
}

impl HttpTicketingClient {
    pub fn new(config: RestConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build REST http client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    async fn send_envelope(&self, request: reqwest::RequestBuilder) -> Result<Envelope> {
        let response = request
            .basic_auth(&self.config.user, Some(&self.config.pass))
            .send()
            .await
            .context("REST request failed")?;

        let status = response.status();
        let body: Envelope = response
            .json()
            .await
            .context("failed to decode REST response body")?;

        if status != StatusCode::OK || body.return_code != 0 {
            bail!(
                "REST call returned failure: status={status}, return_code={}, messages={:?}",
                body.return_code,
                body.messages
            );
        }

        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "ReturnCode")]
    return_code: i64,
    #[serde(rename = "ResourceName", default)]
    #[allow(dead_code)]
    resource_name: String,
    #[serde(rename = "content", default)]
    content: Vec<Value>,
    #[serde(rename = "Messages", default)]
    messages: Vec<String>,
}

impl Envelope {
    fn first_resource(&self) -> Option<&Value> {
        self.content.first().and_then(|entry| entry.as_object()).and_then(|obj| obj.values().next())
    }
}

#[async_trait::async_trait]
impl TicketingClient for HttpTicketingClient {
    async fn find_person_by_email(&self, email: &str) -> Result<Option<Person>> {
        let request = self.client.get(self.url("Persons")).query(&[("email", email)]);
        let envelope = self.send_envelope(request).await?;

        let Some(resource) = envelope.first_resource() else {
            return Ok(None);
        };

        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .context("person resource missing `id`")?
            .to_string();

        Ok(Some(Person { id }))
    }

    async fn get_issue(&self, issue_ref: &str) -> Result<Option<Issue>> {
        let request = self.client.get(self.url(&format!("Issues/{issue_ref}")));
        let response = request.basic_auth(&self.config.user, Some(&self.config.pass)).send().await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return Err(err).context("REST Issues lookup request failed"),
        };

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = response.status();
        let envelope: Envelope = response.json().await.context("failed to decode Issues lookup response")?;
        if status != StatusCode::OK || envelope.return_code != 0 {
            return Ok(None);
        }

        let Some(resource) = envelope.first_resource() else {
            return Ok(None);
        };
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .context("issue resource missing `id`")?
            .to_string();
        Ok(Some(Issue { id }))
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue> {
        let payload = json!({ "ZIssue": {
            "authorId": issue.author_id,
            "subject": issue.subject,
            "body": issue.body,
            "statusId": issue.status_id,
            "categoryId": issue.category_id,
            "priorityId": issue.priority_id,
            "sourceId": issue.source_id,
            "fields": issue.fields,
        }});

        let request = self.client.post(self.url("Issues")).json(&payload);
        let envelope = self.send_envelope(request).await?;
        let resource = envelope.first_resource().context("create issue response missing content")?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .context("created issue missing `id`")?
            .to_string();
        Ok(Issue { id })
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<String> {
        let payload = json!({ "ZComment": {
            "issueId": comment.issue_id,
            "authorId": comment.author_id,
            "body": comment.body,
        }});

        let request = self.client.post(self.url("Comments")).json(&payload);
        let envelope = self.send_envelope(request).await?;
        let resource = envelope.first_resource().context("create comment response missing content")?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .context("created comment missing `id`")?
            .to_string();
        Ok(id)
    }

    async fn upload_issue_attachment(&self, issue_id: &str, attachment: AttachmentUpload<'_>) -> Result<()> {
        upload_attachment(&self.client, &self.config, &self.url(&format!("Issues/{issue_id}/attachments")), attachment).await
    }

    async fn upload_comment_attachment(&self, comment_id: &str, attachment: AttachmentUpload<'_>) -> Result<()> {
        upload_attachment(&self.client, &self.config, &self.url(&format!("Comments/{comment_id}/attachments")), attachment).await
    }

    async fn count_recent_issues(&self, person_id: &str, time_span_minutes: u64) -> Result<u32> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM issues WHERE author_id = '{person_id}' AND created_at >= NOW() - INTERVAL {time_span_minutes} MINUTE"
        );
        let request = self
            .client
            .post(self.url(&self.config.db_query_path))
            .json(&json!({ "query": sql }));
        let envelope = self.send_envelope(request).await?;
        let resource = envelope.first_resource().context("db query response missing content")?;
        let count = resource.get("cnt").and_then(Value::as_u64).unwrap_or(0);
        Ok(count as u32)
    }

    async fn person_timezone_offset(&self, person_id: &str) -> Result<Option<String>> {
        let sql = format!("SELECT timezone_offset AS tz FROM persons WHERE id = '{person_id}'");
        let request = self
            .client
            .post(self.url(&self.config.db_query_path))
            .json(&json!({ "query": sql }));
        let envelope = self.send_envelope(request).await?;
        let offset = envelope
            .first_resource()
            .and_then(|resource| resource.get("tz"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(offset)
    }
}

async fn upload_attachment(
    client: &Client,
    config: &RestConfig,
    url: &str,
    attachment: AttachmentUpload<'_>,
) -> Result<()> {
    let encoded_name = urlencoding::encode(&attachment.file_name);
    let disposition = format!("attachment; filename*=UTF-8''{encoded_name}");

    let response = client
        .post(url)
        .basic_auth(&config.user, Some(&config.pass))
        .header(reqwest::header::CONTENT_DISPOSITION, disposition)
        .header(reqwest::header::CONTENT_TYPE, attachment.content_type.clone())
        .body(attachment.bytes.to_vec())
        .send()
        .await
        .context("attachment upload request failed")?;

    if !response.status().is_success() {
        bail!("attachment upload returned status {}", response.status());
    }

    Ok(())
}
