use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

/// Markdown rendered to plain text, plus the first top-level heading.
pub(crate) struct PlainDocument {
    pub title: Option<String>,
    pub text: String,
}

/// Strip Markdown markup. Block boundaries become newlines; YAML front
/// matter is dropped.
pub(crate) fn markdown_to_text(content: &str) -> PlainDocument {
    let body = strip_front_matter(content);
    let mut text = String::with_capacity(body.len());
    let mut title: Option<String> = None;
    let mut heading: Option<(HeadingLevel, String)> = None;

    for event in Parser::new(body) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => heading = Some((level, String::new())),
            Event::End(TagEnd::Heading(_)) => {
                if let Some((level, heading_text)) = heading.take() {
                    let heading_text = heading_text.trim().to_string();
                    if title.is_none() && level <= HeadingLevel::H2 && !heading_text.is_empty() {
                        title = Some(heading_text.clone());
                    }
                    text.push_str(&heading_text);
                    text.push('\n');
                }
            }
            Event::Text(t) | Event::Code(t) => match heading.as_mut() {
                Some((_, h)) => h.push_str(&t),
                None => text.push_str(&t),
            },
            Event::SoftBreak => text.push(' '),
            Event::HardBreak => text.push('\n'),
            Event::End(TagEnd::Paragraph | TagEnd::Item | TagEnd::CodeBlock | TagEnd::BlockQuote(_)) => {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            _ => {}
        }
    }

    PlainDocument {
        title,
        text: text.trim().to_string(),
    }
}

fn strip_front_matter(content: &str) -> &str {
    if let Some(rest) = content.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---\n") {
            return &rest[end + 5..];
        }
    }
    content
}
