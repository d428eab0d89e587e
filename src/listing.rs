use std::{cmp::Ordering, io, path::Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
}

pub async fn read_entries(dir: &Path) -> io::Result<Vec<Entry>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        // Follows symlinks; a dangling link falls back to the entry's own type.
        let is_dir = match tokio::fs::metadata(entry.path()).await {
            Ok(metadata) => metadata.is_dir(),
            Err(_) => entry.file_type().await?.is_dir(),
        };
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir,
        });
    }
    entries.sort_by(|a, b| match a.name.to_lowercase().cmp(&b.name.to_lowercase()) {
        Ordering::Equal => a.name.cmp(&b.name),
        other => other,
    });
    Ok(entries)
}

/// Renders an HTML index of `entries`. `request_path` is the decoded path shown in the title.
pub fn render(request_path: &str, entries: &[Entry]) -> String {
    let title = format!("Directory listing for {}", escape(request_path));
    let mut html = format!(
        "<!DOCTYPE HTML>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n<hr>\n<ul>\n"
    );
    for entry in entries {
        let suffix = if entry.is_dir { "/" } else { "" };
        html.push_str(&format!(
            "<li><a href=\"{}{suffix}\">{}{suffix}</a></li>\n",
            urlencoding::encode(&entry.name),
            escape(&entry.name),
        ));
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    html
}

pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}
