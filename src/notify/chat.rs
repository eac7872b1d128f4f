//! Interactive status cards posted to the task's chat webhook.

use serde::Serialize;
use tracing::info;

use crate::errors::AgentError;

/// Card envelope.
#[derive(Debug, Serialize)]
pub struct CardMessage {
    msg_type: &'static str,
    card: Card,
}

#[derive(Debug, Serialize)]
struct Card {
    config: CardConfig,
    elements: Vec<Element>,
    header: CardHeader,
}

#[derive(Debug, Serialize)]
struct CardConfig {
    wide_screen_mode: bool,
}

#[derive(Debug, Serialize)]
struct CardHeader {
    title: Text,
    template: &'static str,
}

#[derive(Debug, Serialize)]
struct Text {
    content: String,
    tag: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Element {
    Fields(FieldSet),
    Divider(Divider),
}

#[derive(Debug, Serialize)]
struct FieldSet {
    tag: &'static str,
    fields: Vec<Field>,
}

#[derive(Debug, Serialize)]
struct Field {
    is_short: bool,
    text: Text,
}

#[derive(Debug, Serialize)]
struct Divider {
    tag: &'static str,
}

fn markdown_field(label: &str, value: &str) -> Field {
    Field {
        is_short: true,
        text: Text {
            content: format!("**{}**\n{}", label, value),
            tag: "lark_md",
        },
    }
}

/// Elapsed time between two `%Y-%m-%d %H:%M:%S` stamps, for the card.
fn elapsed_label(start: &str, end: &str) -> String {
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    let (Ok(start), Ok(end)) = (
        chrono::NaiveDateTime::parse_from_str(start, FORMAT),
        chrono::NaiveDateTime::parse_from_str(end, FORMAT),
    ) else {
        return "unknown".to_string();
    };

    let secs = (end - start).num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Build the card for a task-terminal state.
#[allow(clippy::too_many_arguments)]
pub fn build_task_card(
    project: &str,
    tag: &str,
    status: &str,
    start_time: &str,
    end_time: &str,
    category: &str,
    project_name: &str,
    current_version: Option<&str>,
) -> CardMessage {
    let (template, title, status_text) = match status {
        "complete" => (
            "green",
            format!("🎉 [{}] deployment succeeded", project_name),
            "✅ complete".to_string(),
        ),
        "failed" => (
            "red",
            format!("❌ [{}] deployment failed", project_name),
            "❌ failed".to_string(),
        ),
        "cancel" => (
            "grey",
            format!("⏹️ [{}] deployment cancelled", project_name),
            "⏹️ cancelled".to_string(),
        ),
        other => ("blue", "📋 deployment notice".to_string(), format!("📋 {}", other)),
    };

    let mut fields = vec![
        markdown_field("Project", project),
        markdown_field("Tag", tag),
        markdown_field("Status", &status_text),
        markdown_field("Elapsed", &elapsed_label(start_time, end_time)),
        markdown_field("Category", if category.is_empty() { "none" } else { category }),
    ];
    // Blue/green tasks show the live colour; the slot stays blank otherwise.
    match current_version {
        Some(version) => fields.push(markdown_field("Live version", version)),
        None => fields.push(markdown_field(" ", " ")),
    }

    CardMessage {
        msg_type: "interactive",
        card: Card {
            config: CardConfig {
                wide_screen_mode: true,
            },
            header: CardHeader {
                title: Text {
                    content: title,
                    tag: "plain_text",
                },
                template,
            },
            elements: vec![
                Element::Fields(FieldSet { tag: "div", fields }),
                Element::Divider(Divider { tag: "hr" }),
                Element::Fields(FieldSet {
                    tag: "div",
                    fields: vec![
                        markdown_field("Started", start_time),
                        markdown_field("Finished", end_time),
                    ],
                }),
            ],
        },
    }
}

/// Post a task card to a webhook. An empty webhook URL is a no-op.
#[allow(clippy::too_many_arguments)]
pub async fn send_task_card(
    client: &reqwest::Client,
    webhook_url: &str,
    project: &str,
    tag: &str,
    status: &str,
    start_time: &str,
    end_time: &str,
    category: &str,
    project_name: &str,
    current_version: Option<&str>,
) -> Result<(), AgentError> {
    if webhook_url.is_empty() {
        info!("chat webhook not configured, skipping card");
        return Ok(());
    }

    let card = build_task_card(
        project,
        tag,
        status,
        start_time,
        end_time,
        category,
        project_name,
        current_version,
    );

    let resp = client
        .post(webhook_url)
        .json(&card)
        .send()
        .await
        .map_err(|e| AgentError::NotifyError(format!("chat webhook request failed: {}", e)))?;

    if resp.status() != reqwest::StatusCode::OK {
        return Err(AgentError::NotifyError(format!(
            "chat webhook returned {}",
            resp.status()
        )));
    }

    info!("chat card sent: project={}, status={}", project, status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_status_templates() {
        let complete = build_task_card("p", "1.0", "complete", "", "", "", "P", None);
        let json = serde_json::to_value(&complete).unwrap();
        assert_eq!(json["card"]["header"]["template"], "green");
        assert_eq!(json["msg_type"], "interactive");

        let failed = build_task_card("p", "1.0", "failed", "", "", "", "P", None);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["card"]["header"]["template"], "red");

        let cancel = build_task_card("p", "1.0", "cancel", "", "", "", "P", None);
        let json = serde_json::to_value(&cancel).unwrap();
        assert_eq!(json["card"]["header"]["template"], "grey");
    }

    #[test]
    fn test_card_shows_live_version_for_double() {
        let card = build_task_card("p", "1.0", "complete", "", "", "", "P", Some("v2"));
        let json = serde_json::to_string(&card).unwrap();
        assert!(json.contains("Live version"));
        assert!(json.contains("v2"));
    }

    #[test]
    fn test_elapsed_label() {
        assert_eq!(
            elapsed_label("2025-01-01 10:00:00", "2025-01-01 10:01:30"),
            "1m30s"
        );
        assert_eq!(
            elapsed_label("2025-01-01 10:00:00", "2025-01-01 11:02:03"),
            "1h2m3s"
        );
        assert_eq!(elapsed_label("", "2025-01-01 10:00:00"), "unknown");
    }
}
