//! Content library: email templates and catalog items, resolved into
//! rendered bodies for a specific recipient.
//!
//! Placeholders use `{{recipient.<field>}}` syntax, where `<field>` is `id`,
//! `email` or any profile field, with optional `| upcase`, `| downcase`,
//! `| capitalize` and `| default` filters.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use drip_core::collaborators::ContentResolver;
use drip_core::types::{Attachment, ContentRef, Recipient, RenderedContent};
use drip_core::{DripError, DripResult};

/// A stored email template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A product or content item that catalog steps can feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
}

type FilterFn = fn(&str) -> String;

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().to_string() + &chars.as_str().to_lowercase(),
    }
}

fn upcase(s: &str) -> String {
    s.to_uppercase()
}

fn downcase(s: &str) -> String {
    s.to_lowercase()
}

fn or_default(s: &str) -> String {
    if s.is_empty() {
        "there".to_string()
    } else {
        s.to_string()
    }
}

fn filters() -> [(&'static str, FilterFn); 4] {
    [
        ("upcase", upcase),
        ("downcase", downcase),
        ("capitalize", capitalize),
        ("default", or_default),
    ]
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Substitutes recipient placeholders. Unknown fields render as empty.
pub fn render(template: &str, recipient: &Recipient) -> String {
    let mut vars: HashMap<&str, &str> = recipient
        .profile
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    vars.insert("id", recipient.id.as_str());
    vars.insert("email", recipient.email.as_str());

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = after[..end].trim();
        let mut parts = expr.splitn(2, '|');
        let name = parts.next().unwrap_or_default().trim();
        let filter = parts.next().map(str::trim);

        match name.strip_prefix("recipient.") {
            Some(field) => {
                let value = vars.get(field).copied().unwrap_or_default();
                let rendered = match filter {
                    Some(f) => filters()
                        .iter()
                        .find(|(n, _)| *n == f)
                        .map_or_else(|| value.to_string(), |(_, apply)| apply(value)),
                    None => value.to_string(),
                };
                out.push_str(&rendered);
            }
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Thread-safe template and catalog store implementing `ContentResolver`.
#[derive(Clone, Default)]
pub struct ContentLibrary {
    templates: Arc<DashMap<String, EmailTemplate>>,
    catalog: Arc<DashMap<String, CatalogItem>>,
}

impl ContentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, template: EmailTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn add_catalog_item(&self, item: CatalogItem) {
        self.catalog.insert(item.id.clone(), item);
    }

    pub fn remove_template(&self, id: &str) -> Option<EmailTemplate> {
        self.templates.remove(id).map(|(_, t)| t)
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    fn catalog_items(&self, item_ids: &[String]) -> DripResult<Vec<CatalogItem>> {
        if item_ids.is_empty() {
            return Err(DripError::InvalidContent(
                "catalog content needs at least one item".to_string(),
            ));
        }
        item_ids
            .iter()
            .map(|id| {
                self.catalog
                    .get(id)
                    .map(|r| r.value().clone())
                    .ok_or_else(|| DripError::ContentNotFound(format!("catalog item {id}")))
            })
            .collect()
    }

    fn render_catalog(&self, items: &[CatalogItem], message: &str, recipient: &Recipient) -> RenderedContent {
        let message = render(message, recipient);
        let subject = message
            .lines()
            .next()
            .map(|line| line.chars().take(78).collect::<String>())
            .filter(|line| !line.trim().is_empty())
            .unwrap_or_else(|| items[0].title.clone());

        let mut html = format!("<p>{}</p>\n<ul>\n", escape_html(&message).replace('\n', "<br>"));
        let mut text = format!("{message}\n\n");
        for item in items {
            let title = escape_html(&item.title);
            let label = match &item.url {
                Some(url) => format!("<a href=\"{}\">{title}</a>", escape_html(url)),
                None => title,
            };
            let price = item
                .price
                .as_deref()
                .map(|p| format!(" - {}", escape_html(p)))
                .unwrap_or_default();
            html.push_str(&format!(
                "<li>{label}{price}<br>{}</li>\n",
                escape_html(&item.description)
            ));

            text.push_str(&format!("* {}", item.title));
            if let Some(p) = &item.price {
                text.push_str(&format!(" ({p})"));
            }
            if let Some(url) = &item.url {
                text.push_str(&format!(" {url}"));
            }
            text.push('\n');
        }
        html.push_str("</ul>");

        RenderedContent {
            subject,
            html,
            text,
            attachments: Vec::new(),
        }
    }
}

#[async_trait]
impl ContentResolver for ContentLibrary {
    async fn resolve(&self, content: &ContentRef, recipient: &Recipient) -> DripResult<RenderedContent> {
        match content {
            ContentRef::Template { template_id } => {
                let template = self
                    .templates
                    .get(template_id)
                    .map(|r| r.value().clone())
                    .ok_or_else(|| DripError::ContentNotFound(format!("template {template_id}")))?;
                debug!(template_id = %template_id, recipient_id = %recipient.id, "Rendering template");
                Ok(RenderedContent {
                    subject: render(&template.subject, recipient),
                    html: render(&template.html, recipient),
                    text: render(&template.text, recipient),
                    attachments: template.attachments,
                })
            }
            ContentRef::Catalog { item_ids, message } => {
                let items = self.catalog_items(item_ids)?;
                Ok(self.render_catalog(&items, message, recipient))
            }
        }
    }

    async fn exists(&self, content: &ContentRef) -> DripResult<bool> {
        match content {
            ContentRef::Template { template_id } => Ok(self.templates.contains_key(template_id)),
            ContentRef::Catalog { item_ids, .. } => Ok(!item_ids.is_empty()
                && item_ids.iter().all(|id| self.catalog.contains_key(id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Recipient {
        Recipient {
            id: "r-1".into(),
            email: "ada@example.com".into(),
            profile: HashMap::from([("first_name".to_string(), "ada".to_string())]),
        }
    }

    #[test]
    fn test_render_substitutes_fields_and_filters() {
        let out = render(
            "Hi {{ recipient.first_name | capitalize }} <{{recipient.email}}> {{recipient.company | default}} {{other}}",
            &recipient(),
        );
        assert_eq!(out, "Hi Ada <ada@example.com> there {{other}}");
    }

    #[test]
    fn test_render_keeps_unterminated_placeholder() {
        assert_eq!(render("Hello {{recipient.email", &recipient()), "Hello {{recipient.email");
    }

    #[tokio::test]
    async fn test_resolve_template() {
        let library = ContentLibrary::new();
        library.add_template(EmailTemplate {
            id: "welcome".into(),
            name: "Welcome".into(),
            subject: "Welcome, {{recipient.first_name | capitalize}}".into(),
            html: "<p>Hi {{recipient.first_name}}</p>".into(),
            text: "Hi {{recipient.first_name}}".into(),
            attachments: vec![],
        });

        let content = ContentRef::Template {
            template_id: "welcome".into(),
        };
        assert!(library.exists(&content).await.unwrap());
        let rendered = library.resolve(&content, &recipient()).await.unwrap();
        assert_eq!(rendered.subject, "Welcome, Ada");
        assert_eq!(rendered.text, "Hi ada");
    }

    #[tokio::test]
    async fn test_missing_template_is_content_not_found() {
        let library = ContentLibrary::new();
        let content = ContentRef::Template {
            template_id: "gone".into(),
        };
        assert!(!library.exists(&content).await.unwrap());
        let err = library.resolve(&content, &recipient()).await.unwrap_err();
        assert!(matches!(err, DripError::ContentNotFound(_)));
        assert!(err.is_content_error());
    }

    #[tokio::test]
    async fn test_resolve_catalog_lists_items() {
        let library = ContentLibrary::new();
        library.add_catalog_item(CatalogItem {
            id: "sku-1".into(),
            title: "Trail <Runner>".into(),
            description: "Light and fast".into(),
            url: Some("https://shop.example.com/sku-1".into()),
            price: Some("$89".into()),
        });

        let content = ContentRef::Catalog {
            item_ids: vec!["sku-1".into()],
            message: "Picked for you, {{recipient.first_name | capitalize}}".into(),
        };
        let rendered = library.resolve(&content, &recipient()).await.unwrap();
        assert_eq!(rendered.subject, "Picked for you, Ada");
        assert!(rendered.html.contains("Trail &lt;Runner&gt;"));
        assert!(rendered.text.contains("* Trail <Runner> ($89) https://shop.example.com/sku-1"));

        let missing = ContentRef::Catalog {
            item_ids: vec!["sku-1".into(), "sku-404".into()],
            message: "x".into(),
        };
        assert!(!library.exists(&missing).await.unwrap());
        assert!(matches!(
            library.resolve(&missing, &recipient()).await,
            Err(DripError::ContentNotFound(_))
        ));
    }
}
