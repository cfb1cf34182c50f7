use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::config::Config;
use crate::sandbox::{SandboxStatus, SandboxSummary};

#[derive(Tabled)]
struct SandboxRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PORT")]
    port: String,
    #[tabled(rename = "URL")]
    url: String,
}

fn format_status(summary: &SandboxSummary) -> String {
    match summary.status {
        SandboxStatus::Running => "\x1b[32mrunning\x1b[0m".to_string(),
        SandboxStatus::Stopped => format!("\x1b[90mstopped\x1b[0m ({})", summary.status_text),
        SandboxStatus::Removed => "removed".to_string(),
    }
}

fn to_row(summary: SandboxSummary) -> SandboxRow {
    SandboxRow {
        id: summary.id.chars().take(12).collect(),
        status: format_status(&summary),
        port: summary
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
        url: summary.url.unwrap_or_else(|| "-".to_string()),
        name: summary.name,
    }
}

pub async fn run(config: &Config) -> Result<()> {
    let sandboxes = super::load_sandboxes(config)?;
    let summaries = sandboxes.list().await?;

    if summaries.is_empty() {
        println!("No sandboxes found");
        return Ok(());
    }

    let rows: Vec<SandboxRow> = summaries.into_iter().map(to_row).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));
    println!("{table}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_formatting() {
        let summary = SandboxSummary {
            id: "0123456789abcdef0123".to_string(),
            name: "dec-nextjs-a".to_string(),
            status: SandboxStatus::Stopped,
            status_text: "Exited (0) 1 second ago".to_string(),
            port: None,
            url: None,
            sandbox_id: Some("a".to_string()),
            created_at: None,
            kind: crate::sandbox::APP_KIND,
        };
        let row = to_row(summary);
        assert_eq!(row.id, "0123456789ab");
        assert_eq!(row.port, "-");
        assert_eq!(row.url, "-");
        assert!(row.status.contains("Exited (0)"));
    }
}
